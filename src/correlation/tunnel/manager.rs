// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::Config,
    correlation::tunnel::{
        keepalive::KeepAliveAggregator,
        types::{
            GtpTunnel, HandoverEvent, HandoverQuality, HandoverType, TunnelEvent,
            TunnelEventKind, TunnelState, TunnelStatistics,
        },
    },
    models::{
        MessageType,
        error::{Error, Result},
    },
    parsers::gtpv2::Gtpv2Message,
    utils::format_teid,
};
use crate::cfg::enums::VisualizationMode;

/// How long a RAN mobility indication stays relevant for classifying a
/// subsequent GTP handover, in seconds.
const MOBILITY_HINT_WINDOW_SEC: i64 = 10;

/// GTP tunnel lifecycle tracking, keep-alive aggregation, and handover
/// detection.
///
/// Tunnels are keyed by the uplink TEID. GTPv2 echoes carry no TEID; they
/// are attributed to the most recent tunnel on the control path between
/// the two endpoint addresses.
pub struct TunnelManager {
    tunnels: HashMap<u32, GtpTunnel>,
    imsi_index: HashMap<String, Vec<u32>>,
    ue_ip_index: HashMap<IpAddr, Vec<u32>>,
    /// Control-path (sorted endpoint pair) to tunnels, for echo
    /// attribution.
    path_index: HashMap<(IpAddr, IpAddr), Vec<u32>>,
    aggregator: KeepAliveAggregator,
    /// Most recent RAN mobility message, used to refine handover types.
    mobility_hint: Option<(DateTime<Utc>, HandoverType)>,

    max_tunnels: usize,
    activity_timeout: Duration,
    echo_timeout_multiplier: i64,
    enable_handover_detection: bool,
    viz_mode: VisualizationMode,

    state_violations: u64,
}

impl TunnelManager {
    pub fn new(config: &Config) -> Self {
        Self {
            tunnels: HashMap::new(),
            imsi_index: HashMap::new(),
            ue_ip_index: HashMap::new(),
            path_index: HashMap::new(),
            aggregator: KeepAliveAggregator::new(
                config.timeouts.echo_timeout_multiplier,
            ),
            mobility_hint: None,
            max_tunnels: config.limits.max_tunnels,
            activity_timeout: Duration::seconds(i64::from(
                config.timeouts.activity_timeout_sec,
            )),
            echo_timeout_multiplier: i64::from(config.timeouts.echo_timeout_multiplier),
            enable_handover_detection: config.tunnels.enable_handover_detection,
            viz_mode: config.tunnels.visualization_mode,
            state_violations: 0,
        }
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    pub fn state_violations(&self) -> u64 {
        self.state_violations
    }

    pub fn tunnel(&self, teid: u32) -> Option<&GtpTunnel> {
        self.tunnels.get(&teid)
    }

    pub fn tunnels_by_imsi(&self, imsi: &str) -> Vec<&GtpTunnel> {
        self.imsi_index.get(imsi).map_or_else(Vec::new, |teids| {
            teids
                .iter()
                .filter_map(|teid| self.tunnels.get(teid))
                .collect()
        })
    }

    pub fn tunnels_by_ue_ip(&self, ip: &IpAddr) -> Vec<&GtpTunnel> {
        self.ue_ip_index.get(ip).map_or_else(Vec::new, |teids| {
            teids
                .iter()
                .filter_map(|teid| self.tunnels.get(teid))
                .collect()
        })
    }

    pub fn active_tunnels(&self) -> impl Iterator<Item = &GtpTunnel> {
        self.tunnels.values().filter(|t| t.is_active())
    }

    pub fn all_tunnels(&self) -> impl Iterator<Item = &GtpTunnel> {
        self.tunnels.values()
    }

    /// A RAN mobility message (Path Switch / Handover) was seen; GTP
    /// handovers shortly after adopt its type.
    pub fn note_mobility_event(&mut self, ts: DateTime<Utc>, message_type: MessageType) {
        let kind = match message_type {
            MessageType::S1apPathSwitchRequest | MessageType::S1apHandoverRequest => {
                HandoverType::S1
            },
            MessageType::NgapPathSwitchRequest | MessageType::NgapHandoverRequest => {
                HandoverType::N2
            },
            MessageType::X2apHandoverRequest => HandoverType::X2,
            _ => return,
        };
        self.mobility_hint = Some((ts, kind));
    }

    /// Drives the state machine with one GTPv2-C message.
    pub fn process_message(
        &mut self,
        msg: &Gtpv2Message,
        ts: DateTime<Utc>,
        src_ip: IpAddr,
        dst_ip: IpAddr,
    ) -> Result<()> {
        match msg.message_type() {
            MessageType::GtpCreateSessionRequest => self.create_tunnel(msg, ts, src_ip, dst_ip),
            MessageType::GtpCreateSessionResponse => self.activate_tunnel(msg, ts),
            MessageType::GtpModifyBearerRequest | MessageType::GtpModifyBearerResponse => {
                self.modify_tunnel(msg, ts)?;
                if self.enable_handover_detection
                    && msg.message_type() == MessageType::GtpModifyBearerResponse
                {
                    self.detect_handover(msg, ts);
                }
                Ok(())
            },
            MessageType::GtpDeleteSessionRequest
            | MessageType::GtpDeleteSessionResponse => self.delete_tunnel(msg, ts),
            MessageType::GtpEchoRequest => {
                self.handle_echo_request(ts, src_ip, dst_ip);
                Ok(())
            },
            MessageType::GtpEchoResponse => {
                self.handle_echo_response(ts, src_ip, dst_ip);
                Ok(())
            },
            _ => Ok(()),
        }
    }

    fn create_tunnel(
        &mut self,
        msg: &Gtpv2Message,
        ts: DateTime<Utc>,
        src_ip: IpAddr,
        dst_ip: IpAddr,
    ) -> Result<()> {
        let Some(teid) = extract_uplink_teid(msg) else {
            warn!("Create Session Request without a usable TEID");
            return Ok(());
        };

        if self.tunnels.contains_key(&teid) {
            self.state_violations += 1;
            return Err(Error::StateViolation(format!(
                "tunnel {} already exists",
                format_teid(teid)
            )));
        }
        if self.tunnels.len() >= self.max_tunnels {
            warn!("tunnel cap reached ({}), refusing new tunnel", self.max_tunnels);
            return Err(Error::Resource("max_tunnels"));
        }

        let mut tunnel = GtpTunnel::new(teid, ts, self.viz_mode);
        tunnel.imsi = msg.imsi.clone();
        tunnel.apn = msg.apn.clone();
        tunnel.ue_ipv4 = msg.ue_ipv4;
        tunnel.ue_ipv6 = msg.ue_ipv6;
        tunnel.eps_bearer_id = msg
            .eps_bearer_id
            .or_else(|| msg.bearer_contexts.first().and_then(|b| b.eps_bearer_id));
        tunnel.qci = msg.bearer_contexts.first().and_then(|b| b.qci);

        info!(
            "tunnel created: {}, imsi={:?}, apn={:?}",
            format_teid(teid),
            tunnel.imsi,
            tunnel.apn
        );

        self.index_tunnel(&tunnel);
        self.path_index
            .entry(path_key(src_ip, dst_ip))
            .or_default()
            .push(teid);
        self.tunnels.insert(teid, tunnel);
        Ok(())
    }

    fn activate_tunnel(&mut self, msg: &Gtpv2Message, ts: DateTime<Utc>) -> Result<()> {
        let Some((uplink, downlink)) = extract_teid_pair(msg) else {
            warn!("Create Session Response without a TEID pair");
            return Ok(());
        };

        let Some(tunnel) = self.tunnels.get_mut(&uplink) else {
            self.state_violations += 1;
            return Err(Error::StateViolation(format!(
                "activation for unknown tunnel {}",
                format_teid(uplink)
            )));
        };

        tunnel.teid_downlink = downlink;
        tunnel.state = TunnelState::Active;
        tunnel.touch(ts);

        let mut newly_indexed = Vec::new();
        if tunnel.ue_ipv4.is_none() {
            tunnel.ue_ipv4 = msg.ue_ipv4;
            if let Some(ip) = msg.ue_ipv4 {
                newly_indexed.push((IpAddr::V4(ip), uplink));
            }
        }
        if tunnel.ue_ipv6.is_none() {
            tunnel.ue_ipv6 = msg.ue_ipv6;
            if let Some(ip) = msg.ue_ipv6 {
                newly_indexed.push((IpAddr::V6(ip), uplink));
            }
        }

        info!(
            "tunnel activated: {} downlink={}",
            format_teid(uplink),
            format_teid(downlink)
        );

        for (ip, teid) in newly_indexed {
            self.ue_ip_index.entry(ip).or_default().push(teid);
        }
        Ok(())
    }

    fn modify_tunnel(&mut self, msg: &Gtpv2Message, ts: DateTime<Utc>) -> Result<()> {
        let Some(teid) = extract_uplink_teid(msg) else {
            return Ok(());
        };
        let Some(tunnel) = self.tunnels.get_mut(&teid) else {
            // Modify for a TEID we never saw created: common mid-capture;
            // handover detection may still match by IMSI.
            return Ok(());
        };

        tunnel.state = if msg.message_type() == MessageType::GtpModifyBearerRequest {
            TunnelState::Modifying
        } else {
            TunnelState::Active
        };
        tunnel.touch(ts);
        Ok(())
    }

    fn delete_tunnel(&mut self, msg: &Gtpv2Message, ts: DateTime<Utc>) -> Result<()> {
        let Some(teid) = extract_uplink_teid(msg) else {
            warn!("Delete Session without a usable TEID");
            return Ok(());
        };

        let Some(tunnel) = self.tunnels.get_mut(&teid) else {
            self.state_violations += 1;
            debug!("delete for unknown tunnel {}", format_teid(teid));
            return Err(Error::StateViolation(format!(
                "delete for unknown tunnel {}",
                format_teid(teid)
            )));
        };

        if msg.message_type() == MessageType::GtpDeleteSessionRequest {
            tunnel.state = TunnelState::Deleting;
        } else {
            tunnel.state = TunnelState::Deleted;
            tunnel.deleted = Some(ts);
            self.aggregator.finalize_tunnel(teid);
            info!(
                "tunnel deleted: {}, duration={:.2}h",
                format_teid(teid),
                tunnel.duration_hours()
            );
        }
        tunnel.touch(ts);
        Ok(())
    }

    fn handle_echo_request(&mut self, ts: DateTime<Utc>, src_ip: IpAddr, dst_ip: IpAddr) {
        let Some(teid) = self.tunnel_for_path(src_ip, dst_ip) else {
            debug!("echo request on a path with no tunnels");
            return;
        };
        self.aggregator.add_echo_request(teid, ts);

        if let Some(tunnel) = self.tunnels.get_mut(&teid) {
            tunnel.echo_request_count += 1;
            if let Some(last) = tunnel.last_echo_request {
                tunnel.echo_interval_sec = (ts - last).num_seconds();
            }
            tunnel.last_echo_request = Some(ts);
            tunnel.touch(ts);
        }
    }

    fn handle_echo_response(&mut self, ts: DateTime<Utc>, src_ip: IpAddr, dst_ip: IpAddr) {
        let Some(teid) = self.tunnel_for_path(src_ip, dst_ip) else {
            debug!("echo response on a path with no tunnels");
            return;
        };
        self.aggregator.add_echo_response(teid, ts);

        if let Some(tunnel) = self.tunnels.get_mut(&teid) {
            tunnel.echo_response_count += 1;
            tunnel.last_echo_response = Some(ts);
            tunnel.touch(ts);
        }
    }

    /// Accounts one GTP-U packet against its tunnel. Uplink is decided by
    /// matching the carrying TEID against the uplink key.
    pub fn handle_user_data(&mut self, teid: u32, bytes: u64, ts: DateTime<Utc>) {
        // Uplink TEID keys the table directly; downlink needs a scan.
        if let Some(tunnel) = self.tunnels.get_mut(&teid) {
            tunnel.uplink_packets += 1;
            tunnel.uplink_bytes += bytes;
            tunnel.touch(ts);
            return;
        }
        if let Some(tunnel) = self
            .tunnels
            .values_mut()
            .find(|t| t.teid_downlink == teid && t.teid_downlink != 0)
        {
            tunnel.downlink_packets += 1;
            tunnel.downlink_bytes += bytes;
            tunnel.touch(ts);
        }
    }

    fn detect_handover(&mut self, msg: &Gtpv2Message, ts: DateTime<Utc>) {
        let Some((new_teid, _)) = extract_teid_pair(msg) else {
            return;
        };
        let Some(imsi) = msg.imsi.clone().or_else(|| {
            // Modify Bearer rarely repeats the IMSI; recover it from the
            // tunnel the message addressed.
            msg.teid
                .and_then(|t| self.tunnels.get(&t))
                .and_then(|t| t.imsi.clone())
        }) else {
            return;
        };

        let Some(&old_teid) = self
            .imsi_index
            .get(&imsi)
            .and_then(|teids| teids.last())
        else {
            return;
        };

        if old_teid == new_teid {
            // Plain bearer modification.
            return;
        }
        let Some(old_tunnel) = self.tunnels.get(&old_teid) else {
            return;
        };

        let interruption_ms = (ts - old_tunnel.last_activity).num_milliseconds();
        let quality = if interruption_ms < 0 {
            HandoverQuality::Invalid
        } else {
            HandoverQuality::Normal
        };

        let handover_type = match self.mobility_hint {
            Some((hint_ts, kind))
                if ts - hint_ts <= Duration::seconds(MOBILITY_HINT_WINDOW_SEC) =>
            {
                kind
            },
            _ => HandoverType::X2,
        };

        let new_enb_ip = msg
            .bearer_contexts
            .first()
            .and_then(|b| b.enb_fteid.as_ref())
            .and_then(|f| {
                f.ipv4
                    .map(IpAddr::V4)
                    .or_else(|| f.ipv6.map(IpAddr::V6))
            });
        let old_enb_ip = None;

        let handover = HandoverEvent {
            timestamp: ts,
            old_teid_uplink: old_teid,
            new_teid_uplink: new_teid,
            old_enb_ip,
            new_enb_ip,
            handover_type,
            interruption_ms,
            quality,
        };

        info!(
            "handover detected: {} -> {}, imsi={imsi}, interruption={interruption_ms}ms",
            format_teid(old_teid),
            format_teid(new_teid)
        );

        let Some(old) = self.tunnels.get_mut(&old_teid) else {
            return;
        };
        old.handovers.push(handover);
        let inherited = (
            old.imsi.clone(),
            old.ue_ipv4,
            old.ue_ipv6,
            old.apn.clone(),
            old.eps_bearer_id,
            old.qci,
            old.viz_mode,
        );

        if self.tunnels.len() >= self.max_tunnels {
            warn!("tunnel cap reached, handover target not tracked");
            return;
        }

        let mut new_tunnel = GtpTunnel::new(new_teid, ts, inherited.6);
        new_tunnel.imsi = inherited.0;
        new_tunnel.ue_ipv4 = inherited.1;
        new_tunnel.ue_ipv6 = inherited.2;
        new_tunnel.apn = inherited.3;
        new_tunnel.eps_bearer_id = inherited.4;
        new_tunnel.qci = inherited.5;
        new_tunnel.state = TunnelState::Active;

        self.index_tunnel(&new_tunnel);
        self.tunnels.insert(new_teid, new_tunnel);
    }

    /// Sweeps idle tunnels into INACTIVE and reports echo silence.
    pub fn check_timeouts(&mut self, now: DateTime<Utc>) {
        for (teid, tunnel) in &mut self.tunnels {
            if !tunnel.is_active() {
                continue;
            }

            if now - tunnel.last_activity > self.activity_timeout {
                info!(
                    "tunnel {} idle for {}s, marking inactive",
                    format_teid(*teid),
                    (now - tunnel.last_activity).num_seconds()
                );
                tunnel.state = TunnelState::Inactive;
                continue;
            }

            if tunnel.echo_interval_sec > 0
                && let Some(last_response) = tunnel.last_echo_response
            {
                let silence = now - last_response;
                let limit = Duration::seconds(
                    tunnel.echo_interval_sec * self.echo_timeout_multiplier,
                );
                if silence > limit {
                    warn!(
                        "tunnel {} echo timeout: {}s since last response",
                        format_teid(*teid),
                        silence.num_seconds()
                    );
                }
            }
        }
    }

    /// Finalizes keep-alive aggregation for tunnels that never saw a
    /// Delete Session Response (end of capture).
    pub fn finalize(&mut self) {
        let teids: Vec<u32> = self
            .tunnels
            .iter()
            .filter(|(_, t)| t.state != TunnelState::Deleted)
            .map(|(teid, _)| *teid)
            .collect();
        for teid in teids {
            self.aggregator.finalize_tunnel(teid);
        }
    }

    pub fn statistics(&self) -> TunnelStatistics {
        let mut stats = TunnelStatistics {
            total_tunnels: self.tunnels.len(),
            ..TunnelStatistics::default()
        };
        for tunnel in self.tunnels.values() {
            if tunnel.is_active() {
                stats.active_tunnels += 1;
            }
            if tunnel.state == TunnelState::Deleted {
                stats.deleted_tunnels += 1;
            }
            stats.handovers_detected += tunnel.handovers.len();
            stats.echo_requests += u64::from(tunnel.echo_request_count);
            stats.echo_responses += u64::from(tunnel.echo_response_count);
            stats.total_uplink_bytes += tunnel.uplink_bytes;
            stats.total_downlink_bytes += tunnel.downlink_bytes;
        }
        stats
    }

    pub fn echo_stats(&self, teid: u32) -> crate::correlation::tunnel::keepalive::EchoStats {
        self.aggregator.echo_stats(teid)
    }

    pub fn aggregated_keepalives(
        &self,
        teid: u32,
    ) -> Vec<crate::correlation::tunnel::keepalive::AggregatedKeepalive> {
        self.aggregator.aggregates(teid)
    }

    /// The tunnel's visualization timeline:
    /// `CREATE, [runs / flagged echoes / handovers], DELETE`, sorted by
    /// timestamp, honoring the tunnel's visualization mode.
    pub fn event_timeline(&self, teid: u32) -> Vec<TunnelEvent> {
        let Some(tunnel) = self.tunnels.get(&teid) else {
            return Vec::new();
        };

        let mut events = vec![TunnelEvent {
            kind: TunnelEventKind::Create,
            timestamp: tunnel.created,
            message: "GTP Create Session".to_string(),
            details: json!({ "teid": tunnel.tunnel_id() }),
        }];

        match tunnel.viz_mode {
            VisualizationMode::Minimal => {},
            VisualizationMode::Full => {
                for echo in self.aggregator.all_echoes(teid) {
                    events.push(TunnelEvent {
                        kind: TunnelEventKind::Keepalive,
                        timestamp: echo.request_time,
                        message: if echo.is_timeout {
                            "Echo timeout".to_string()
                        } else {
                            "Echo".to_string()
                        },
                        details: serde_json::to_value(&echo).unwrap_or_default(),
                    });
                }
            },
            VisualizationMode::Aggregated => {
                for run in self.aggregator.aggregates(teid) {
                    events.push(TunnelEvent {
                        kind: TunnelEventKind::KeepaliveAggregated,
                        timestamp: run.start_time,
                        message: format!(
                            "Session active ({} keep-alives over {:.2} hours)",
                            run.echo_count,
                            run.duration_hours()
                        ),
                        details: serde_json::to_value(&run).unwrap_or_default(),
                    });
                }
                for echo in self.aggregator.individual_echoes(teid) {
                    events.push(TunnelEvent {
                        kind: TunnelEventKind::Keepalive,
                        timestamp: echo.request_time,
                        message: if echo.is_timeout {
                            "Echo timeout".to_string()
                        } else {
                            "Echo".to_string()
                        },
                        details: serde_json::to_value(&echo).unwrap_or_default(),
                    });
                }
            },
        }

        for handover in &tunnel.handovers {
            events.push(TunnelEvent {
                kind: TunnelEventKind::Handover,
                timestamp: handover.timestamp,
                message: format!("{} Handover", handover.handover_type.as_str()),
                details: serde_json::to_value(handover).unwrap_or_default(),
            });
        }

        if let Some(deleted) = tunnel.deleted {
            events.push(TunnelEvent {
                kind: TunnelEventKind::Delete,
                timestamp: deleted,
                message: "GTP Delete Session".to_string(),
                details: json!({ "teid": tunnel.tunnel_id() }),
            });
        }

        events.sort_by_key(|e| e.timestamp);
        events
    }

    pub fn clear(&mut self) {
        self.tunnels.clear();
        self.imsi_index.clear();
        self.ue_ip_index.clear();
        self.path_index.clear();
        self.aggregator.clear();
    }

    fn index_tunnel(&mut self, tunnel: &GtpTunnel) {
        if let Some(imsi) = &tunnel.imsi {
            self.imsi_index
                .entry(imsi.clone())
                .or_default()
                .push(tunnel.teid_uplink);
        }
        if let Some(ip) = tunnel.ue_ipv4 {
            self.ue_ip_index
                .entry(IpAddr::V4(ip))
                .or_default()
                .push(tunnel.teid_uplink);
        }
        if let Some(ip) = tunnel.ue_ipv6 {
            self.ue_ip_index
                .entry(IpAddr::V6(ip))
                .or_default()
                .push(tunnel.teid_uplink);
        }
    }

    fn tunnel_for_path(&self, src_ip: IpAddr, dst_ip: IpAddr) -> Option<u32> {
        self.path_index
            .get(&path_key(src_ip, dst_ip))
            .and_then(|teids| teids.last())
            .copied()
    }
}

fn path_key(a: IpAddr, b: IpAddr) -> (IpAddr, IpAddr) {
    if a <= b { (a, b) } else { (b, a) }
}

/// The uplink TEID identifying a tunnel: the bearer's eNodeB F-TEID when
/// present, the header TEID otherwise.
fn extract_uplink_teid(msg: &Gtpv2Message) -> Option<u32> {
    msg.bearer_contexts
        .iter()
        .find_map(|b| b.enb_fteid.as_ref().map(|f| f.teid))
        .or(msg.teid.filter(|t| *t != 0))
}

/// (uplink, downlink) from the bearer contexts; activation needs both.
fn extract_teid_pair(msg: &Gtpv2Message) -> Option<(u32, u32)> {
    let bearer = msg.bearer_contexts.first()?;
    let uplink = bearer.enb_fteid.as_ref()?.teid;
    let downlink = bearer.sgw_fteid.as_ref()?.teid;
    Some((uplink, downlink))
}
