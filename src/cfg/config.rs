// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::VisualizationMode;

/// Pipeline configuration, grouped by concern.
///
/// Injected through constructors; there is no global config instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Worker pool and queue sizing.
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// Table capacity caps.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Sweep thresholds for every time-evicted table.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    /// GTP tunnel manager behavior.
    #[serde(default)]
    pub tunnels: TunnelConfig,
    /// Exporter destination and job retention.
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Size of the worker pool.
    #[serde(default = "defaults::worker_threads")]
    pub worker_threads: usize,
    /// Back-pressure bound for the per-job packet queue.
    #[serde(default = "defaults::max_packet_queue_size")]
    pub max_packet_queue_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "defaults::max_flows")]
    pub max_flows: usize,
    #[serde(default = "defaults::max_tunnels")]
    pub max_tunnels: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Flow sweeper threshold.
    #[serde(default = "defaults::flow_timeout_sec")]
    pub flow_timeout_sec: u32,
    /// Master-session inactivity cap.
    #[serde(default = "defaults::session_timeout_sec")]
    pub session_timeout_sec: u32,
    /// Tunnel inactivity before the tunnel is marked INACTIVE.
    #[serde(default = "defaults::activity_timeout_sec")]
    pub activity_timeout_sec: u32,
    /// Echo timeout is `multiplier x tracked interval`.
    #[serde(default = "defaults::echo_timeout_multiplier")]
    pub echo_timeout_multiplier: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "defaults::enable_handover_detection")]
    pub enable_handover_detection: bool,
    #[serde(default)]
    pub visualization_mode: VisualizationMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "defaults::output_dir")]
    pub output_dir: PathBuf,
    /// Completed/failed jobs older than this are evicted from the registry.
    #[serde(default = "defaults::retention_hours")]
    pub retention_hours: u32,
}

mod defaults {
    use std::path::PathBuf;

    pub fn worker_threads() -> usize {
        4
    }
    pub fn max_packet_queue_size() -> usize {
        10_000
    }
    pub fn max_flows() -> usize {
        100_000
    }
    pub fn max_tunnels() -> usize {
        100_000
    }
    pub fn flow_timeout_sec() -> u32 {
        300
    }
    pub fn session_timeout_sec() -> u32 {
        600
    }
    pub fn activity_timeout_sec() -> u32 {
        7200
    }
    pub fn echo_timeout_multiplier() -> u32 {
        3
    }
    pub fn enable_handover_detection() -> bool {
        true
    }
    pub fn output_dir() -> PathBuf {
        PathBuf::from("./output")
    }
    pub fn retention_hours() -> u32 {
        24
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            worker_threads: defaults::worker_threads(),
            max_packet_queue_size: defaults::max_packet_queue_size(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_flows: defaults::max_flows(),
            max_tunnels: defaults::max_tunnels(),
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            flow_timeout_sec: defaults::flow_timeout_sec(),
            session_timeout_sec: defaults::session_timeout_sec(),
            activity_timeout_sec: defaults::activity_timeout_sec(),
            echo_timeout_multiplier: defaults::echo_timeout_multiplier(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enable_handover_detection: defaults::enable_handover_detection(),
            visualization_mode: VisualizationMode::default(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: defaults::output_dir(),
            retention_hours: defaults::retention_hours(),
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("failed to read config file {:?}", path.as_ref())
        })?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            self.processing.worker_threads >= 1,
            "worker_threads must be >= 1"
        );
        ensure!(
            self.processing.max_packet_queue_size >= 1,
            "max_packet_queue_size must be >= 1"
        );
        ensure!(self.limits.max_flows >= 1, "max_flows must be >= 1");
        ensure!(self.limits.max_tunnels >= 1, "max_tunnels must be >= 1");
        ensure!(
            self.timeouts.echo_timeout_multiplier >= 1,
            "echo_timeout_multiplier must be >= 1"
        );

        // A zero flow timeout would reap flows on the first sweep.
        if self.timeouts.flow_timeout_sec == 0 {
            self.timeouts.flow_timeout_sec = defaults::flow_timeout_sec();
        }

        Ok(())
    }

    /// Resolves a possibly-relative config path against the current working
    /// directory.
    pub fn resolve_path(rel: &str) -> Result<PathBuf> {
        let p = Path::new(rel);

        let abs = if p.is_absolute() {
            p.to_path_buf()
        } else {
            std::env::current_dir()
                .context("cannot get current working dir")?
                .join(p)
        };

        let canon = abs
            .canonicalize()
            .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

        Ok(canon)
    }
}
