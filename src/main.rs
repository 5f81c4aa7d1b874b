// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use telflow_rs::{
    cfg::{config::Config, logger::init_logger},
    models::JobStatus,
    pipeline::runner::JobRunner,
};
use tracing::info;

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(input) = args.next() else {
        bail!("usage: telflow <capture.pcap[ng][.gz]> [output.json] [config.yaml]");
    };
    let output = args.next().map(PathBuf::from);
    let config = match args.next() {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };

    let _logger_guard = std::env::var("TELFLOW_LOGGER_CONFIG")
        .ok()
        .map(|path| init_logger(&path))
        .transpose()
        .context("failed to initialize logger")?;

    let mut runner = JobRunner::new(config);
    runner.set_event_callback(Arc::new(|job_id, event_type, payload| {
        info!("[{job_id}] {event_type}: {payload}");
    }));
    runner.start();

    let job_id = runner
        .submit(&input, output)
        .context("failed to submit job")?;
    println!("job {job_id} submitted for {input}");

    loop {
        std::thread::sleep(Duration::from_millis(200));
        let Some(status) = runner.status(&job_id) else {
            bail!("job disappeared");
        };
        match status.status {
            JobStatus::Completed => {
                println!(
                    "completed: {} packets, {} sessions, {} warnings -> {:?}",
                    status.total_packets,
                    status.session_count,
                    status.warning_count,
                    status.output_path
                );
                break;
            },
            JobStatus::Failed => {
                bail!(
                    "job failed: {}",
                    status.error.unwrap_or_else(|| "unknown error".to_string())
                );
            },
            _ => {},
        }
    }

    runner.stop();
    Ok(())
}
