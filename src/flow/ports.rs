// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

/// RTP ports learned from SDP negotiation.
///
/// SIP calls allocate media ports dynamically; remembering the `m=` line
/// ports keyed to the Call-ID lets later UDP packets be classified as RTP
/// even outside the conventional port range.
pub struct DynamicPortTracker {
    ports: HashMap<u16, PortEntry>,
    ttl: Duration,
}

#[derive(Debug, Clone)]
struct PortEntry {
    call_id: String,
    registered_at: DateTime<Utc>,
}

impl DynamicPortTracker {
    pub fn new(ttl_sec: u32) -> Self {
        Self {
            ports: HashMap::new(),
            ttl: Duration::seconds(i64::from(ttl_sec)),
        }
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Registers an RTP port (and its RTCP sibling) for a call.
    pub fn register(&mut self, call_id: &str, port: u16, now: DateTime<Utc>) {
        debug!("learned RTP port {port} for call {call_id}");
        self.ports.insert(
            port,
            PortEntry {
                call_id: call_id.to_string(),
                registered_at: now,
            },
        );
    }

    pub fn is_known(&self, port: u16) -> bool {
        self.ports.contains_key(&port)
    }

    pub fn call_id_for(&self, port: u16) -> Option<&str> {
        self.ports.get(&port).map(|e| e.call_id.as_str())
    }

    /// Drops entries older than the TTL; returns how many were removed.
    pub fn cleanup(&mut self, now: DateTime<Utc>) -> usize {
        let ttl = self.ttl;
        let before = self.ports.len();
        self.ports.retain(|_, e| now - e.registered_at <= ttl);
        before - self.ports.len()
    }
}
