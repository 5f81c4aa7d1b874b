// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, trace, warn};

/// One echo request with its (optional) response.
#[derive(Debug, Clone, Serialize)]
pub struct EchoRecord {
    pub request_time: DateTime<Utc>,
    pub response_time: Option<DateTime<Utc>>,
    pub is_timeout: bool,
    /// Kept out of aggregation runs: first, last, interval changes,
    /// timeouts.
    pub show_individually: bool,
}

/// A maximal run of unremarkable echoes collapsed into one summary.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedKeepalive {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub echo_count: u32,
    pub avg_interval_sec: i64,
    pub all_successful: bool,
}

impl AggregatedKeepalive {
    pub fn duration_hours(&self) -> f64 {
        (self.end_time - self.start_time).num_seconds() as f64 / 3600.0
    }
}

#[derive(Debug, Default)]
struct TunnelEchoData {
    echoes: Vec<EchoRecord>,
    /// Tracked inter-request interval in seconds; 0 until two requests
    /// were answered.
    current_interval_sec: i64,
    finalized: bool,
    cache: Vec<AggregatedKeepalive>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EchoStats {
    pub request_count: usize,
    pub response_count: usize,
    pub timeout_count: usize,
    pub avg_interval_sec: i64,
    pub last_request: Option<DateTime<Utc>>,
    pub last_response: Option<DateTime<Utc>>,
}

/// Lossy aggregation of long keep-alive streams.
///
/// Every echo is retained as a record; aggregation decides which ones the
/// timeline shows individually. Interval changes above 20 % flag the echo
/// and re-baseline the tracked interval; timeouts are found at
/// finalization by comparing the gap to the next request against
/// `timeout_multiplier x interval` (15 minutes when no interval is known
/// yet).
pub struct KeepAliveAggregator {
    tunnels: HashMap<u32, TunnelEchoData>,
    timeout_multiplier: i64,
}

/// Relative interval change that breaks aggregation.
const INTERVAL_CHANGE_THRESHOLD: f64 = 0.20;
/// Timeout fallback when no interval is tracked yet, in seconds.
const DEFAULT_TIMEOUT_SEC: i64 = 900;

impl KeepAliveAggregator {
    pub fn new(timeout_multiplier: u32) -> Self {
        Self {
            tunnels: HashMap::new(),
            timeout_multiplier: i64::from(timeout_multiplier.max(1)),
        }
    }

    pub fn add_echo_request(&mut self, teid: u32, ts: DateTime<Utc>) {
        let data = self.tunnels.entry(teid).or_default();
        data.echoes.push(EchoRecord {
            request_time: ts,
            response_time: None,
            is_timeout: false,
            show_individually: false,
        });
        trace!("echo request for teid 0x{teid:08x}, count={}", data.echoes.len());
    }

    /// Pairs the response with the most recent unanswered request (an
    /// older one without a response is a lost echo, found at
    /// finalization) and applies the interval-change rule.
    pub fn add_echo_response(&mut self, teid: u32, ts: DateTime<Utc>) {
        let Some(data) = self.tunnels.get_mut(&teid) else {
            warn!("echo response for unknown teid 0x{teid:08x}");
            return;
        };

        let Some(index) = data
            .echoes
            .iter()
            .rposition(|e| e.response_time.is_none())
        else {
            warn!("echo response without matching request on teid 0x{teid:08x}");
            return;
        };

        data.echoes[index].response_time = Some(ts);

        if index > 0 {
            let interval = (data.echoes[index].request_time
                - data.echoes[index - 1].request_time)
                .num_seconds();
            if data.current_interval_sec == 0 {
                data.current_interval_sec = interval;
            } else {
                let old = data.current_interval_sec as f64;
                let change = ((interval as f64) - old).abs() / old;
                if change > INTERVAL_CHANGE_THRESHOLD {
                    debug!(
                        "echo interval change on teid 0x{teid:08x}: {} -> {interval}s",
                        data.current_interval_sec
                    );
                    data.echoes[index].show_individually = true;
                    data.current_interval_sec = interval;
                }
            }
        }
    }

    /// The tracked interval, once established.
    pub fn tracked_interval_sec(&self, teid: u32) -> i64 {
        self.tunnels
            .get(&teid)
            .map_or(0, |d| d.current_interval_sec)
    }

    /// Marks first/last/timeout echoes and caches the aggregation runs.
    pub fn finalize_tunnel(&mut self, teid: u32) {
        let timeout_multiplier = self.timeout_multiplier;
        let Some(data) = self.tunnels.get_mut(&teid) else {
            return;
        };

        mark_for_visualization(data, timeout_multiplier);
        data.cache = generate_runs(&data.echoes);
        data.finalized = true;
        debug!(
            "finalized keepalives for teid 0x{teid:08x}: {} echoes, {} runs",
            data.echoes.len(),
            data.cache.len()
        );
    }

    /// Aggregation runs; generated on the fly until finalized.
    pub fn aggregates(&self, teid: u32) -> Vec<AggregatedKeepalive> {
        match self.tunnels.get(&teid) {
            Some(data) if data.finalized => data.cache.clone(),
            Some(data) => generate_runs(&data.echoes),
            None => Vec::new(),
        }
    }

    /// Echoes flagged to appear individually on the timeline.
    pub fn individual_echoes(&self, teid: u32) -> Vec<EchoRecord> {
        self.tunnels.get(&teid).map_or_else(Vec::new, |data| {
            data.echoes
                .iter()
                .filter(|e| e.show_individually || e.is_timeout)
                .cloned()
                .collect()
        })
    }

    /// Every echo, for `FULL` visualization.
    pub fn all_echoes(&self, teid: u32) -> Vec<EchoRecord> {
        self.tunnels
            .get(&teid)
            .map_or_else(Vec::new, |data| data.echoes.clone())
    }

    pub fn echo_stats(&self, teid: u32) -> EchoStats {
        let Some(data) = self.tunnels.get(&teid) else {
            return EchoStats::default();
        };

        let mut stats = EchoStats {
            request_count: data.echoes.len(),
            ..EchoStats::default()
        };
        for echo in &data.echoes {
            if echo.response_time.is_some() {
                stats.response_count += 1;
            }
            if echo.is_timeout {
                stats.timeout_count += 1;
            }
        }
        stats.last_request = data.echoes.last().map(|e| e.request_time);
        stats.last_response = data
            .echoes
            .iter()
            .rev()
            .find_map(|e| e.response_time);
        stats.avg_interval_sec = average_interval(&data.echoes);
        stats
    }

    pub fn clear_tunnel(&mut self, teid: u32) {
        self.tunnels.remove(&teid);
    }

    pub fn clear(&mut self) {
        self.tunnels.clear();
    }
}

fn average_interval(echoes: &[EchoRecord]) -> i64 {
    if echoes.len() < 2 {
        return 0;
    }
    let total: i64 = echoes
        .windows(2)
        .map(|w| (w[1].request_time - w[0].request_time).num_seconds())
        .sum();
    total / (echoes.len() as i64 - 1)
}

fn mark_for_visualization(data: &mut TunnelEchoData, timeout_multiplier: i64) {
    if data.echoes.is_empty() {
        return;
    }

    data.echoes[0].show_individually = true;
    if data.echoes.len() > 1 {
        let last = data.echoes.len() - 1;
        data.echoes[last].show_individually = true;
    }

    let threshold = if data.current_interval_sec > 0 {
        Duration::seconds(data.current_interval_sec * timeout_multiplier)
    } else {
        Duration::seconds(DEFAULT_TIMEOUT_SEC)
    };

    for i in 0..data.echoes.len() {
        if data.echoes[i].response_time.is_some() {
            continue;
        }
        if i + 1 < data.echoes.len() {
            let wait = data.echoes[i + 1].request_time - data.echoes[i].request_time;
            if wait > threshold {
                data.echoes[i].is_timeout = true;
                data.echoes[i].show_individually = true;
                debug!("echo timeout detected: waited {}s", wait.num_seconds());
            }
        }
    }
}

/// Maximal runs of consecutive non-flagged echoes.
fn generate_runs(echoes: &[EchoRecord]) -> Vec<AggregatedKeepalive> {
    let mut runs = Vec::new();
    let mut current: Option<AggregatedKeepalive> = None;
    let mut intervals: Vec<i64> = Vec::new();
    let mut prev_request: Option<DateTime<Utc>> = None;

    let flagged = |i: usize, e: &EchoRecord| {
        e.show_individually || e.is_timeout || i == 0 || i == echoes.len() - 1
    };

    for (i, echo) in echoes.iter().enumerate() {
        if flagged(i, echo) {
            if let Some(mut run) = current.take() {
                if !intervals.is_empty() {
                    run.avg_interval_sec =
                        intervals.iter().sum::<i64>() / intervals.len() as i64;
                }
                runs.push(run);
                intervals.clear();
            }
            prev_request = Some(echo.request_time);
            continue;
        }

        match current.as_mut() {
            None => {
                current = Some(AggregatedKeepalive {
                    start_time: echo.request_time,
                    end_time: echo.request_time,
                    echo_count: 1,
                    avg_interval_sec: 0,
                    all_successful: echo.response_time.is_some(),
                });
            },
            Some(run) => {
                run.echo_count += 1;
                run.end_time = echo.request_time;
                run.all_successful &= echo.response_time.is_some();
            },
        }
        if let Some(prev) = prev_request {
            intervals.push((echo.request_time - prev).num_seconds());
        }
        prev_request = Some(echo.request_time);
    }

    if let Some(mut run) = current.take() {
        if !intervals.is_empty() {
            run.avg_interval_sec = intervals.iter().sum::<i64>() / intervals.len() as i64;
        }
        runs.push(run);
    }

    runs
}
