// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a GTP tunnel timeline is rendered by the exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisualizationMode {
    /// Every echo shown individually.
    Full,
    /// Keep-alive runs collapsed into aggregate summaries.
    #[default]
    Aggregated,
    /// Only setup/teardown and handovers.
    Minimal,
}

impl fmt::Display for VisualizationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VisualizationMode::Full => "full",
            VisualizationMode::Aggregated => "aggregated",
            VisualizationMode::Minimal => "minimal",
        };
        f.write_str(s)
    }
}
