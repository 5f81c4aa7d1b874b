// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{path::PathBuf, sync::Arc};

use serde_json::Value;

/// One unit of work popped by a worker.
#[derive(Debug, Clone)]
pub struct JobTask {
    pub job_id: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
}

/// `fn(job_id, progress 0..=100, message)`
pub type ProgressCallback = Arc<dyn Fn(&str, u8, &str) + Send + Sync>;

/// `fn(job_id, event_type, payload)` where event_type is one of
/// `status`, `progress`, `warning`.
pub type EventCallback = Arc<dyn Fn(&str, &str, &Value) + Send + Sync>;

pub const EVENT_STATUS: &str = "status";
pub const EVENT_PROGRESS: &str = "progress";
pub const EVENT_WARNING: &str = "warning";
