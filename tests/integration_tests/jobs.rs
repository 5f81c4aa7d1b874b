// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Job facade behavior: submission, status transitions, callbacks,
//! session export, and deletion.

use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use serial_test::serial;
use telflow_rs::{
    cfg::config::Config,
    models::{JobStatus, error::Error},
    pipeline::runner::JobRunner,
};

use super::common::{PcapWriter, udp_frame};

fn small_capture(name: &str) -> std::path::PathBuf {
    let invite = "INVITE sip:bob@x SIP/2.0\r\n\
         Call-ID: job@x\r\n\
         CSeq: 1 INVITE\r\n\
         Content-Length: 0\r\n\r\n";
    let bye = "BYE sip:bob@x SIP/2.0\r\n\
         Call-ID: job@x\r\n\
         CSeq: 2 BYE\r\n\
         Content-Length: 0\r\n\r\n";

    let a = Ipv4Addr::new(10, 0, 0, 1);
    let b = Ipv4Addr::new(10, 0, 0, 2);
    let mut pcap = PcapWriter::new();
    pcap.frame(0, &udp_frame(a, 5060, b, 5060, invite.as_bytes()));
    pcap.frame(1_000, &udp_frame(a, 5060, b, 5060, bye.as_bytes()));
    pcap.write_temp(name)
}

fn wait_for_completion(runner: &JobRunner, job_id: &str) -> JobStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(info) = runner.status(job_id) {
            if matches!(info.status, JobStatus::Completed | JobStatus::Failed) {
                return info.status;
            }
        }
        if Instant::now() > deadline {
            panic!("job {job_id} did not finish in time");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
#[serial]
fn test_job_lifecycle_and_export() {
    let capture = small_capture("job-lifecycle");
    let output_dir = std::env::temp_dir().join(format!(
        "telflow-job-out-{}",
        std::process::id()
    ));
    let config = Config {
        output: telflow_rs::cfg::config::OutputConfig {
            output_dir: output_dir.clone(),
            ..Default::default()
        },
        ..Default::default()
    };

    let events: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let progresses: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

    let mut runner = JobRunner::new(config);
    {
        let events = Arc::clone(&events);
        runner.set_event_callback(Arc::new(move |job_id, event_type, _payload| {
            if let Ok(mut events) = events.lock() {
                events.push((job_id.to_string(), event_type.to_string()));
            }
        }));
    }
    {
        let progresses = Arc::clone(&progresses);
        runner.set_progress_callback(Arc::new(move |_job_id, progress, _message| {
            if let Ok(mut progresses) = progresses.lock() {
                progresses.push(progress);
            }
        }));
    }
    runner.start();

    let job_id = runner.submit(&capture, None).expect("submit");
    assert_eq!(wait_for_completion(&runner, &job_id), JobStatus::Completed);

    let info = runner.status(&job_id).expect("status");
    assert_eq!(info.progress, 100);
    assert_eq!(info.total_packets, 2);
    assert_eq!(info.session_count, 1);
    assert!(info.started_at.is_some());
    assert!(info.completed_at.is_some());
    assert!(info.output_path.exists());

    // Exported records are available through the facade.
    let sessions = runner.sessions(&job_id).expect("sessions");
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].get("timeline").is_some());

    // Status events fired for both transitions.
    let events = events.lock().expect("events");
    let status_events: Vec<&(String, String)> =
        events.iter().filter(|(_, t)| t == "status").collect();
    assert!(status_events.len() >= 2);
    drop(events);

    let progresses = progresses.lock().expect("progresses");
    assert!(progresses.contains(&100));
    drop(progresses);

    // Deletion removes the registry entry and the output file.
    let output_path = info.output_path.clone();
    runner.delete(&job_id).expect("delete");
    assert!(runner.status(&job_id).is_none());
    assert!(!output_path.exists());

    runner.stop();
    let _ = std::fs::remove_file(&capture);
    let _ = std::fs::remove_dir_all(&output_dir);
}

#[test]
#[serial]
fn test_submit_requires_running_runner() {
    let capture = small_capture("job-not-started");
    let runner = JobRunner::new(Config::default());
    let err = runner.submit(&capture, None).expect_err("not running");
    assert!(matches!(err, Error::Cancelled));
    let _ = std::fs::remove_file(&capture);
}

#[test]
#[serial]
fn test_missing_input_fails_job() {
    let mut runner = JobRunner::new(Config::default());
    runner.start();

    let job_id = runner
        .submit("/nonexistent/telflow-missing.pcap", None)
        .expect("submit");
    assert_eq!(wait_for_completion(&runner, &job_id), JobStatus::Failed);

    let info = runner.status(&job_id).expect("status");
    assert!(info.error.is_some());
    runner.stop();
}
