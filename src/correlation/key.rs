// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::net::{Ipv4Addr, Ipv6Addr};

use serde::Serialize;

use crate::{
    models::FiveTuple,
    parsers::{ParsedMessage, gtpv2::Gtpv2Message, sip::SipMessage},
};

/// Bag of optional subscriber/session identifiers carried by every parsed
/// message and aggregated on master sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CorrelationKey {
    pub imsi: Option<String>,
    pub msisdn: Option<String>,
    pub impi: Option<String>,
    pub impu: Option<String>,
    pub suci: Option<String>,
    pub sip_call_id: Option<String>,
    pub diameter_session_id: Option<String>,
    /// IMS Charging ID; bridges SIP dialogs to Diameter accounting.
    pub icid: Option<String>,
    pub teid_control: Option<u32>,
    pub teid_uplink: Option<u32>,
    pub teid_downlink: Option<u32>,
    pub ue_ipv4: Option<Ipv4Addr>,
    pub ue_ipv6: Option<Ipv6Addr>,
    pub apn: Option<String>,
    pub eps_bearer_id: Option<u8>,
    pub enb_ue_id: Option<u32>,
    pub mme_ue_id: Option<u64>,
    /// HTTP/2 stream scoped by its connection tuple.
    pub http2_stream: Option<String>,
}

impl CorrelationKey {
    pub fn is_empty(&self) -> bool {
        self == &CorrelationKey::default()
    }

    /// Adopts every identifier `other` has that `self` lacks.
    pub fn merge_from(&mut self, other: &CorrelationKey) {
        macro_rules! adopt {
            ($($field:ident),+) => {
                $(
                    if self.$field.is_none() {
                        self.$field = other.$field.clone();
                    }
                )+
            };
        }
        adopt!(
            imsi,
            msisdn,
            impi,
            impu,
            suci,
            sip_call_id,
            diameter_session_id,
            icid,
            teid_control,
            teid_uplink,
            teid_downlink,
            ue_ipv4,
            ue_ipv6,
            apn,
            eps_bearer_id,
            enb_ue_id,
            mme_ue_id,
            http2_stream
        );
    }

    /// True when `other` contributes nothing `self` does not already
    /// carry.
    pub fn contains(&self, other: &CorrelationKey) -> bool {
        let mut merged = self.clone();
        merged.merge_from(other);
        &merged == self
    }

    /// Derives the identifier bag for one parsed message.
    pub fn from_message(msg: &ParsedMessage, _five_tuple: &FiveTuple) -> Self {
        let mut key = CorrelationKey::default();

        match msg {
            ParsedMessage::Sip(sip) => key.apply_sip(sip),
            ParsedMessage::Gtpv2(gtp) => key.apply_gtpv2(gtp),
            ParsedMessage::GtpUser(gtpu) => {
                key.teid_uplink = Some(gtpu.teid);
            },
            ParsedMessage::RanAp(ran) => {
                key.enb_ue_id = ran.enb_ue_id;
                key.mme_ue_id = ran.mme_ue_id;
                for erab in &ran.erabs {
                    if key.teid_uplink.is_none() {
                        key.teid_uplink = erab.gtp_teid;
                    }
                    if key.eps_bearer_id.is_none() {
                        key.eps_bearer_id = Some(erab.erab_id);
                    }
                }
            },
            ParsedMessage::Nas(nas) => {
                key.imsi = nas.imsi.clone();
                key.suci = nas.suci.clone();
                key.apn = nas.apn.clone().or_else(|| nas.dnn.clone());
                key.eps_bearer_id = nas.eps_bearer_id;
            },
            ParsedMessage::Diameter(dia) => {
                key.diameter_session_id = dia.session_id.clone();
                key.imsi = dia.imsi();
                key.msisdn = dia.msisdn();
                key.apn = dia.called_station_id.clone();
                key.impi = dia.user_name.clone();
            },
            // The SBA stream key needs the stream id; the packet
            // processor sets it via `http2_stream_key`.
            ParsedMessage::Sba(_) => {},
            ParsedMessage::Rtp(_) | ParsedMessage::Rtcp(_) => {},
        }

        key
    }

    fn apply_sip(&mut self, sip: &SipMessage) {
        self.sip_call_id = sip.call_id.clone();

        for identity in sip.identities() {
            let looks_like_number = identity.username.starts_with('+')
                || identity.username.bytes().all(|b| b.is_ascii_digit());
            if looks_like_number && self.msisdn.is_none() {
                self.msisdn = Some(identity.username.trim_start_matches('+').to_string());
            }
            if self.impu.is_none() && !identity.domain.is_empty() {
                self.impu =
                    Some(format!("{}@{}", identity.username, identity.domain));
            }
        }

        // ICID travels in P-Charging-Vector: icid-value=...;
        if let Some(pcv) = sip.headers.get("P-Charging-Vector") {
            self.icid = pcv
                .split(';')
                .map(str::trim)
                .find_map(|p| p.strip_prefix("icid-value="))
                .map(|v| v.trim_matches('"').to_string());
        }
    }

    fn apply_gtpv2(&mut self, gtp: &Gtpv2Message) {
        self.imsi = gtp.imsi.clone();
        self.msisdn = gtp.msisdn.clone();
        self.apn = gtp.apn.clone();
        self.ue_ipv4 = gtp.ue_ipv4;
        self.ue_ipv6 = gtp.ue_ipv6;
        self.eps_bearer_id = gtp.eps_bearer_id;
        self.teid_control = gtp.teid.filter(|t| *t != 0);

        for bearer in &gtp.bearer_contexts {
            if self.eps_bearer_id.is_none() {
                self.eps_bearer_id = bearer.eps_bearer_id;
            }
            if self.teid_uplink.is_none() {
                self.teid_uplink = bearer.enb_fteid.as_ref().map(|f| f.teid);
            }
            if self.teid_downlink.is_none() {
                self.teid_downlink = bearer.sgw_fteid.as_ref().map(|f| f.teid);
            }
        }

        if self.teid_uplink.is_none() {
            self.teid_uplink = gtp.teid.filter(|t| *t != 0);
        }
    }
}

fn flow_key(five_tuple: &FiveTuple) -> String {
    let (a_ip, a_port, b_ip, b_port, proto) = five_tuple.bidirectional_key();
    format!("{a_ip}:{a_port}-{b_ip}:{b_port}/{proto}")
}

/// Scopes an HTTP/2 stream id to its connection for correlation.
pub fn http2_stream_key(five_tuple: &FiveTuple, stream_id: u32) -> String {
    format!("{}-{stream_id}", flow_key(five_tuple))
}
