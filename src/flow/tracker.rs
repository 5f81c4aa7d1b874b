// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::models::{FiveTuple, ProtocolType};

/// Per-five-tuple bookkeeping. `last_seen` is monotonic; counters only
/// grow.
#[derive(Debug, Clone)]
pub struct Flow {
    pub five_tuple: FiveTuple,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub packets: u64,
    pub bytes: u64,
    pub detected_protocol: ProtocolType,
    /// Session-key hint for the correlator (SIP Call-ID, TEID, ...).
    pub session_hint: Option<String>,
    /// SSRC of the RTP tracker this flow feeds, when media.
    pub rtp_ssrc: Option<u32>,
}

/// Flow table with a capacity cap and timeout sweep.
pub struct FlowTracker {
    flows: HashMap<FiveTuple, Flow>,
    max_flows: usize,
    timeout: Duration,
    refused: u64,
}

impl FlowTracker {
    pub fn new(max_flows: usize, timeout_sec: u32) -> Self {
        Self {
            flows: HashMap::new(),
            max_flows,
            timeout: Duration::seconds(i64::from(timeout_sec)),
            refused: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn refused(&self) -> u64 {
        self.refused
    }

    pub fn get(&self, five_tuple: &FiveTuple) -> Option<&Flow> {
        self.flows.get(five_tuple)
    }

    /// Annotation access that does not advance counters.
    pub fn get_mut(&mut self, five_tuple: &FiveTuple) -> Option<&mut Flow> {
        self.flows.get_mut(five_tuple)
    }

    /// Creates or updates the flow for this packet. Returns `None` when
    /// the table is full and the tuple is new.
    pub fn touch(
        &mut self,
        five_tuple: &FiveTuple,
        now: DateTime<Utc>,
        bytes: u64,
    ) -> Option<&mut Flow> {
        if !self.flows.contains_key(five_tuple) {
            if self.flows.len() >= self.max_flows {
                self.refused += 1;
                if self.refused == 1 {
                    warn!("flow table full ({} entries), refusing new flows", self.max_flows);
                }
                return None;
            }
            self.flows.insert(
                five_tuple.clone(),
                Flow {
                    five_tuple: five_tuple.clone(),
                    first_seen: now,
                    last_seen: now,
                    packets: 0,
                    bytes: 0,
                    detected_protocol: ProtocolType::Unknown,
                    session_hint: None,
                    rtp_ssrc: None,
                },
            );
        }

        let flow = self.flows.get_mut(five_tuple)?;
        // Keep last_seen monotonic even against clock-skewed interfaces.
        if now > flow.last_seen {
            flow.last_seen = now;
        }
        flow.packets += 1;
        flow.bytes += bytes;
        Some(flow)
    }

    /// Reaps flows idle past the timeout.
    pub fn cleanup(&mut self, now: DateTime<Utc>) -> usize {
        let timeout = self.timeout;
        let before = self.flows.len();
        self.flows.retain(|_, f| now - f.last_seen <= timeout);
        before - self.flows.len()
    }
}
