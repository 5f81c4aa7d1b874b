// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::correlation::{CorrelationKey, SessionMessageRef};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SessionMetrics {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub rtp_packet_loss: f64,
    pub rtp_jitter_ms: f64,
    pub setup_time_ms: Option<i64>,
    pub duration_ms: Option<i64>,
}

/// The correlation root: one subscriber-level session aggregating every
/// per-protocol child that shares an identifier with it.
///
/// Children are referenced by stable ids (TEIDs, Call-IDs, Session-Ids,
/// context keys, interaction indexes) into the correlator's flat arenas;
/// no back-pointers.
#[derive(Debug, Clone, Serialize)]
pub struct MasterSession {
    pub id: u64,
    pub key: CorrelationKey,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub tunnels: BTreeSet<u32>,
    pub sip_calls: BTreeSet<String>,
    pub diameter_dialogs: BTreeSet<String>,
    pub ue_contexts: BTreeSet<String>,
    pub sba_interactions: BTreeSet<usize>,
    pub metrics: SessionMetrics,
    pub timeline: Vec<SessionMessageRef>,
}

impl MasterSession {
    pub fn new(id: u64, start_time: DateTime<Utc>) -> Self {
        Self {
            id,
            key: CorrelationKey::default(),
            start_time,
            last_activity: start_time,
            tunnels: BTreeSet::new(),
            sip_calls: BTreeSet::new(),
            diameter_dialogs: BTreeSet::new(),
            ue_contexts: BTreeSet::new(),
            sba_interactions: BTreeSet::new(),
            metrics: SessionMetrics::default(),
            timeline: Vec::new(),
        }
    }

    pub fn record(&mut self, msg: &SessionMessageRef, wire_bytes: u64) {
        self.key.merge_from(&msg.correlation_key);
        if msg.timestamp > self.last_activity {
            self.last_activity = msg.timestamp;
        }
        if msg.timestamp < self.start_time {
            self.start_time = msg.timestamp;
        }
        self.metrics.total_packets += 1;
        self.metrics.total_bytes += wire_bytes;
        self.timeline.push(msg.clone());
    }

    /// Merges `other` into `self`: identifier union, earlier start time,
    /// concatenated timelines (sorted at emit), child-set union, summed
    /// counters. Associative and commutative up to the surviving `id`.
    pub fn absorb(&mut self, other: MasterSession) {
        self.key.merge_from(&other.key);
        self.start_time = self.start_time.min(other.start_time);
        self.last_activity = self.last_activity.max(other.last_activity);

        self.tunnels.extend(other.tunnels);
        self.sip_calls.extend(other.sip_calls);
        self.diameter_dialogs.extend(other.diameter_dialogs);
        self.ue_contexts.extend(other.ue_contexts);
        self.sba_interactions.extend(other.sba_interactions);

        self.metrics.total_packets += other.metrics.total_packets;
        self.metrics.total_bytes += other.metrics.total_bytes;
        if self.metrics.setup_time_ms.is_none() {
            self.metrics.setup_time_ms = other.metrics.setup_time_ms;
        }
        if other.metrics.rtp_packet_loss > self.metrics.rtp_packet_loss {
            self.metrics.rtp_packet_loss = other.metrics.rtp_packet_loss;
        }
        if other.metrics.rtp_jitter_ms > self.metrics.rtp_jitter_ms {
            self.metrics.rtp_jitter_ms = other.metrics.rtp_jitter_ms;
        }

        self.timeline.extend(other.timeline);
    }

    /// Timeline sorted by timestamp, frame number breaking ties.
    pub fn sorted_timeline(&self) -> Vec<&SessionMessageRef> {
        let mut refs: Vec<&SessionMessageRef> = self.timeline.iter().collect();
        refs.sort_by_key(|m| (m.timestamp, m.frame_number));
        refs
    }

    pub fn finalize(&mut self) {
        self.metrics.duration_ms =
            Some((self.last_activity - self.start_time).num_milliseconds());
    }
}
