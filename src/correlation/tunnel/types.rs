// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cfg::enums::VisualizationMode;

/// GTP tunnel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TunnelState {
    /// Exists but idle past the activity timeout.
    Inactive,
    /// Create Session Request seen, awaiting the response.
    Creating,
    /// Operational.
    Active,
    /// Modify Bearer in progress.
    Modifying,
    /// Delete Session Request seen.
    Deleting,
    /// Delete Session Response seen.
    Deleted,
}

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Inactive => "INACTIVE",
            TunnelState::Creating => "CREATING",
            TunnelState::Active => "ACTIVE",
            TunnelState::Modifying => "MODIFYING",
            TunnelState::Deleting => "DELETING",
            TunnelState::Deleted => "DELETED",
        }
    }
}

/// Clock skew across capture interfaces can produce negative interruption
/// times; those events are kept but marked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HandoverQuality {
    Normal,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HandoverType {
    X2,
    S1,
    N2,
}

impl HandoverType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandoverType::X2 => "X2",
            HandoverType::S1 => "S1",
            HandoverType::N2 => "N2",
        }
    }
}

/// A TEID change caused by mobility.
#[derive(Debug, Clone, Serialize)]
pub struct HandoverEvent {
    pub timestamp: DateTime<Utc>,
    pub old_teid_uplink: u32,
    pub new_teid_uplink: u32,
    pub old_enb_ip: Option<IpAddr>,
    pub new_enb_ip: Option<IpAddr>,
    pub handover_type: HandoverType,
    pub interruption_ms: i64,
    pub quality: HandoverQuality,
}

/// One GTP bearer with lifecycle, keep-alive counters, user-plane
/// accounting, and handover history.
#[derive(Debug, Clone, Serialize)]
pub struct GtpTunnel {
    pub teid_uplink: u32,
    pub teid_downlink: u32,
    pub imsi: Option<String>,
    pub ue_ipv4: Option<Ipv4Addr>,
    pub ue_ipv6: Option<Ipv6Addr>,
    pub apn: Option<String>,
    pub eps_bearer_id: Option<u8>,
    pub qci: Option<u8>,

    pub state: TunnelState,
    pub created: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,

    pub echo_request_count: u32,
    pub echo_response_count: u32,
    pub last_echo_request: Option<DateTime<Utc>>,
    pub last_echo_response: Option<DateTime<Utc>>,
    /// Tracked inter-echo interval in seconds.
    pub echo_interval_sec: i64,

    pub uplink_packets: u64,
    pub downlink_packets: u64,
    pub uplink_bytes: u64,
    pub downlink_bytes: u64,

    pub handovers: Vec<HandoverEvent>,

    pub viz_mode: VisualizationMode,
}

impl GtpTunnel {
    pub fn new(teid_uplink: u32, created: DateTime<Utc>, viz_mode: VisualizationMode) -> Self {
        Self {
            teid_uplink,
            teid_downlink: 0,
            imsi: None,
            ue_ipv4: None,
            ue_ipv6: None,
            apn: None,
            eps_bearer_id: None,
            qci: None,
            state: TunnelState::Creating,
            created,
            deleted: None,
            last_activity: created,
            echo_request_count: 0,
            echo_response_count: 0,
            last_echo_request: None,
            last_echo_response: None,
            echo_interval_sec: 0,
            uplink_packets: 0,
            downlink_packets: 0,
            uplink_bytes: 0,
            downlink_bytes: 0,
            handovers: Vec::new(),
            viz_mode,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, TunnelState::Active | TunnelState::Modifying)
    }

    pub fn duration_hours(&self) -> f64 {
        let end = self.deleted.unwrap_or(self.last_activity);
        (end - self.created).num_seconds() as f64 / 3600.0
    }

    pub fn tunnel_id(&self) -> String {
        format!("teid_{}", crate::utils::format_teid(self.teid_uplink))
    }

    pub fn touch(&mut self, ts: DateTime<Utc>) {
        if ts > self.last_activity {
            self.last_activity = ts;
        }
    }
}

/// Timeline entry kinds for tunnel visualization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TunnelEventKind {
    Create,
    Keepalive,
    KeepaliveAggregated,
    Handover,
    ModifyBearer,
    Delete,
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelEvent {
    pub kind: TunnelEventKind,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub details: serde_json::Value,
}

/// Aggregate statistics over the whole tunnel table.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TunnelStatistics {
    pub total_tunnels: usize,
    pub active_tunnels: usize,
    pub deleted_tunnels: usize,
    pub handovers_detected: usize,
    pub echo_requests: u64,
    pub echo_responses: u64,
    pub total_uplink_bytes: u64,
    pub total_downlink_bytes: u64,
}
