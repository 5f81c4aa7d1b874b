// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::{
    cfg::config::Config,
    correlation::{
        CorrelationKey, SessionMessageRef,
        children::{DiameterDialog, SipCall, UeContext},
        master::MasterSession,
    },
    parsers::{ParsedMessage, sba::SbaInteraction},
};

/// Canonicalizes parsed messages into master sessions keyed by whatever
/// identifiers they carry.
///
/// Lookup follows a fixed strength order; *every* match participates:
/// when one message bridges several existing masters they are merged into
/// the first, which adopts the union of identifiers and timelines.
pub struct SessionCorrelator {
    next_id: u64,
    masters: HashMap<u64, MasterSession>,

    by_imsi: HashMap<String, u64>,
    by_msisdn: HashMap<String, u64>,
    by_call_id: HashMap<String, u64>,
    by_diameter_session: HashMap<String, u64>,
    by_icid: HashMap<String, u64>,
    by_teid: HashMap<u32, u64>,
    by_ue_ip: HashMap<IpAddr, u64>,
    /// Fallback for identifier-less messages (GTP echoes, bare media):
    /// the most recent master seen on a bidirectional flow.
    by_flow: HashMap<(IpAddr, u16, IpAddr, u16), u64>,

    sip_calls: HashMap<String, SipCall>,
    diameter_dialogs: HashMap<String, DiameterDialog>,
    ue_contexts: HashMap<String, UeContext>,
    sba_interactions: Vec<SbaInteraction>,

    session_timeout: Duration,
}

impl SessionCorrelator {
    pub fn new(config: &Config) -> Self {
        Self {
            next_id: 1,
            masters: HashMap::new(),
            by_imsi: HashMap::new(),
            by_msisdn: HashMap::new(),
            by_call_id: HashMap::new(),
            by_diameter_session: HashMap::new(),
            by_icid: HashMap::new(),
            by_teid: HashMap::new(),
            by_ue_ip: HashMap::new(),
            by_flow: HashMap::new(),
            sip_calls: HashMap::new(),
            diameter_dialogs: HashMap::new(),
            ue_contexts: HashMap::new(),
            sba_interactions: Vec::new(),
            session_timeout: Duration::seconds(i64::from(
                config.timeouts.session_timeout_sec,
            )),
        }
    }

    pub fn session_count(&self) -> usize {
        self.masters.len()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &MasterSession> {
        self.masters.values()
    }

    pub fn session(&self, id: u64) -> Option<&MasterSession> {
        self.masters.get(&id)
    }

    pub fn sip_call(&self, call_id: &str) -> Option<&SipCall> {
        self.sip_calls.get(call_id)
    }

    pub fn diameter_dialog(&self, session_id: &str) -> Option<&DiameterDialog> {
        self.diameter_dialogs.get(session_id)
    }

    pub fn ue_context(&self, key: &str) -> Option<&UeContext> {
        self.ue_contexts.get(key)
    }

    pub fn sba_interaction(&self, index: usize) -> Option<&SbaInteraction> {
        self.sba_interactions.get(index)
    }

    /// Ingests one message: updates child state machines, finds (or
    /// creates) the master session, merges bridged masters, appends to
    /// the timeline.
    pub fn process(
        &mut self,
        msg: &ParsedMessage,
        msg_ref: SessionMessageRef,
        wire_bytes: u64,
    ) {
        let master_id = self.resolve_master(&msg_ref);

        self.update_children(msg, &msg_ref, master_id);

        if let Some(master) = self.masters.get_mut(&master_id) {
            master.record(&msg_ref, wire_bytes);
            // New identifiers may have appeared; refresh the indexes.
            let key = master.key.clone();
            self.index_master(master_id, &key);
        }
        self.by_flow.insert(flow_pair_key(&msg_ref), master_id);
    }

    /// First-match-wins lookup, merging every further match into the
    /// winner. UE IP matches only join sessions that are still active, to
    /// avoid cross-subscriber bleed after address reuse.
    fn resolve_master(&mut self, msg_ref: &SessionMessageRef) -> u64 {
        let key = &msg_ref.correlation_key;
        let mut matches: Vec<u64> = Vec::new();

        let push = |id: Option<&u64>, matches: &mut Vec<u64>| {
            if let Some(&id) = id {
                if !matches.contains(&id) {
                    matches.push(id);
                }
            }
        };

        if let Some(imsi) = &key.imsi {
            push(self.by_imsi.get(imsi), &mut matches);
        }
        if let Some(msisdn) = &key.msisdn {
            push(self.by_msisdn.get(msisdn), &mut matches);
        }
        if let Some(call_id) = &key.sip_call_id {
            push(self.by_call_id.get(call_id), &mut matches);
        }
        if let Some(session_id) = &key.diameter_session_id {
            push(self.by_diameter_session.get(session_id), &mut matches);
        }
        if let Some(icid) = &key.icid {
            push(self.by_icid.get(icid), &mut matches);
        }
        for teid in [key.teid_uplink, key.teid_downlink, key.teid_control]
            .into_iter()
            .flatten()
        {
            push(self.by_teid.get(&teid), &mut matches);
        }
        for ip in key
            .ue_ipv4
            .map(IpAddr::V4)
            .into_iter()
            .chain(key.ue_ipv6.map(IpAddr::V6))
        {
            if let Some(&id) = self.by_ue_ip.get(&ip) {
                let active = self
                    .masters
                    .get(&id)
                    .is_some_and(|m| {
                        msg_ref.timestamp - m.last_activity <= self.session_timeout
                    });
                if active && !matches.contains(&id) {
                    matches.push(id);
                }
            }
        }

        // Opportunistic source/destination match: an RTP or SIP packet
        // from the UE's address belongs to its session.
        if matches.is_empty() {
            for ip in [msg_ref.src_ip, msg_ref.dst_ip] {
                if let Some(&id) = self.by_ue_ip.get(&ip) {
                    let active = self
                        .masters
                        .get(&id)
                        .is_some_and(|m| {
                            msg_ref.timestamp - m.last_activity <= self.session_timeout
                        });
                    if active {
                        matches.push(id);
                        break;
                    }
                }
            }
        }

        // Identifier-less messages (GTP echoes) stay with the most recent
        // master on their flow.
        if matches.is_empty()
            && key.is_empty()
            && let Some(&id) = self.by_flow.get(&flow_pair_key(msg_ref))
            && self.masters.contains_key(&id)
        {
            matches.push(id);
        }

        match matches.split_first() {
            None => {
                let id = self.next_id;
                self.next_id += 1;
                let master = MasterSession::new(id, msg_ref.timestamp);
                self.masters.insert(id, master);
                debug!("created master session {id}");
                id
            },
            Some((&winner, rest)) => {
                for &loser in rest {
                    self.merge_masters(winner, loser);
                }
                winner
            },
        }
    }

    /// Merges `loser` into `winner` and re-points every index entry.
    fn merge_masters(&mut self, winner: u64, loser: u64) {
        if winner == loser {
            return;
        }
        let Some(loser_session) = self.masters.remove(&loser) else {
            return;
        };
        info!("merging master session {loser} into {winner}");

        let loser_key = loser_session.key.clone();
        if let Some(winner_session) = self.masters.get_mut(&winner) {
            winner_session.absorb(loser_session);
        }

        self.index_master(winner, &loser_key);
        // Catch any stale entries still naming the loser.
        for map in [
            &mut self.by_imsi,
            &mut self.by_msisdn,
            &mut self.by_call_id,
            &mut self.by_diameter_session,
            &mut self.by_icid,
        ] {
            for id in map.values_mut() {
                if *id == loser {
                    *id = winner;
                }
            }
        }
        for id in self.by_teid.values_mut() {
            if *id == loser {
                *id = winner;
            }
        }
        for id in self.by_ue_ip.values_mut() {
            if *id == loser {
                *id = winner;
            }
        }
        for id in self.by_flow.values_mut() {
            if *id == loser {
                *id = winner;
            }
        }
    }

    fn index_master(&mut self, id: u64, key: &CorrelationKey) {
        if let Some(imsi) = &key.imsi {
            self.by_imsi.insert(imsi.clone(), id);
        }
        if let Some(msisdn) = &key.msisdn {
            self.by_msisdn.insert(msisdn.clone(), id);
        }
        if let Some(call_id) = &key.sip_call_id {
            self.by_call_id.insert(call_id.clone(), id);
        }
        if let Some(session_id) = &key.diameter_session_id {
            self.by_diameter_session.insert(session_id.clone(), id);
        }
        if let Some(icid) = &key.icid {
            self.by_icid.insert(icid.clone(), id);
        }
        for teid in [key.teid_uplink, key.teid_downlink, key.teid_control]
            .into_iter()
            .flatten()
        {
            self.by_teid.insert(teid, id);
        }
        if let Some(ip) = key.ue_ipv4 {
            self.by_ue_ip.insert(IpAddr::V4(ip), id);
        }
        if let Some(ip) = key.ue_ipv6 {
            self.by_ue_ip.insert(IpAddr::V6(ip), id);
        }
    }

    fn update_children(
        &mut self,
        msg: &ParsedMessage,
        msg_ref: &SessionMessageRef,
        master_id: u64,
    ) {
        let Some(master) = self.masters.get_mut(&master_id) else {
            return;
        };

        match msg {
            ParsedMessage::Sip(sip) => {
                if let Some(call_id) = &sip.call_id {
                    let call = self
                        .sip_calls
                        .entry(call_id.clone())
                        .or_insert_with(|| SipCall::new(call_id.clone()));
                    call.on_message(sip, msg_ref.timestamp);
                    master.sip_calls.insert(call_id.clone());
                    if master.metrics.setup_time_ms.is_none() {
                        master.metrics.setup_time_ms = call.setup_time_ms;
                    }
                }
            },
            ParsedMessage::Diameter(dia) => {
                if let Some(session_id) = &dia.session_id {
                    let dialog = self
                        .diameter_dialogs
                        .entry(session_id.clone())
                        .or_insert_with(|| {
                            DiameterDialog::new(session_id.clone(), msg_ref.timestamp)
                        });
                    dialog.on_message(
                        dia.is_request,
                        dia.command_code,
                        msg_ref.timestamp,
                    );
                    master.diameter_dialogs.insert(session_id.clone());
                }
            },
            ParsedMessage::RanAp(ran) => {
                let key = UeContext::context_key(
                    msg_ref.protocol,
                    ran.enb_ue_id,
                    ran.mme_ue_id,
                );
                let context =
                    self.ue_contexts.entry(key.clone()).or_insert_with(|| {
                        UeContext::new(
                            key.clone(),
                            msg_ref.protocol,
                            ran.enb_ue_id,
                            ran.mme_ue_id,
                            msg_ref.timestamp,
                        )
                    });
                context.on_transport_message(
                    msg_ref.timestamp,
                    ran.enb_ue_id,
                    ran.mme_ue_id,
                );
                // NAS PDUs carried inside are re-parsed into the UE's NAS
                // timeline.
                for nas_pdu in &ran.nas_pdus {
                    if let Ok(nas) = crate::parsers::nas::parse(nas_pdu) {
                        context.record_nas(&nas, msg_ref.timestamp);
                    }
                }
                master.ue_contexts.insert(key);
            },
            ParsedMessage::Gtpv2(_) => {
                for teid in [
                    msg_ref.correlation_key.teid_uplink,
                    msg_ref.correlation_key.teid_downlink,
                ]
                .into_iter()
                .flatten()
                {
                    master.tunnels.insert(teid);
                }
            },
            ParsedMessage::GtpUser(gtpu) => {
                master.tunnels.insert(gtpu.teid);
            },
            ParsedMessage::Sba(sba) => {
                self.sba_interactions.push((**sba).clone());
                master
                    .sba_interactions
                    .insert(self.sba_interactions.len() - 1);
            },
            ParsedMessage::Rtp(_) | ParsedMessage::Rtcp(_) | ParsedMessage::Nas(_) => {},
        }
    }

    /// Feeds per-SSRC media quality into the owning SIP call and its
    /// master session.
    pub fn apply_rtp_stats(
        &mut self,
        call_id: &str,
        packets: u64,
        loss: f64,
        jitter_ms: f64,
    ) {
        if let Some(call) = self.sip_calls.get_mut(call_id) {
            call.apply_rtp_stats(packets, loss, jitter_ms);
        }
        if let Some(&master_id) = self.by_call_id.get(call_id)
            && let Some(master) = self.masters.get_mut(&master_id)
        {
            master.metrics.rtp_packet_loss = master.metrics.rtp_packet_loss.max(loss);
            master.metrics.rtp_jitter_ms = master.metrics.rtp_jitter_ms.max(jitter_ms);
        }
    }

    /// Closes out computed metrics; called once at job end.
    pub fn finalize(&mut self) {
        for master in self.masters.values_mut() {
            // Pull setup times discovered after the first SIP message.
            for call_id in &master.sip_calls {
                if let Some(call) = self.sip_calls.get(call_id)
                    && master.metrics.setup_time_ms.is_none()
                {
                    master.metrics.setup_time_ms = call.setup_time_ms;
                }
            }
            master.finalize();
        }
    }

    /// Master-session inactivity sweep hook. Masters are kept for export;
    /// only the opportunistic UE-IP index honors the timeout, so this is
    /// bookkeeping-free.
    pub fn cleanup(&mut self, _now: DateTime<Utc>) {}
}

fn flow_pair_key(msg_ref: &SessionMessageRef) -> (IpAddr, u16, IpAddr, u16) {
    let a = (msg_ref.src_ip, msg_ref.src_port);
    let b = (msg_ref.dst_ip, msg_ref.dst_port);
    if a <= b {
        (a.0, a.1, b.0, b.1)
    } else {
        (b.0, b.1, a.0, a.1)
    }
}
