// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::{BTreeSet, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{ProtocolType, TelecomInterface};

pub const PORT_S1_MME: u16 = 36412;
pub const PORT_X2_C: u16 = 36422;
pub const PORT_N2: u16 = 38412;
pub const PORT_GTP_C: u16 = 2123;
pub const PORT_GTP_U: u16 = 2152;
pub const PORT_PFCP: u16 = 8805;
pub const PORT_DIAMETER: u16 = 3868;
pub const PORT_SIP: u16 = 5060;
pub const PORT_SIP_TLS: u16 = 5061;
pub const PORT_HTTP: u16 = 80;
pub const PORT_HTTPS: u16 = 443;
pub const PORT_RTP_MIN: u16 = 10000;
pub const PORT_RTP_MAX: u16 = 20000;

/// Name/description patterns, checked in priority order. The first match
/// wins, so the more specific reference points come first.
static NAME_PATTERNS: Lazy<Vec<(Regex, TelecomInterface)>> = Lazy::new(|| {
    let table: &[(&str, TelecomInterface)] = &[
        (r"(?i)S1[-_ ]?MME|S1[-_]?AP|S1[-_]?CP", TelecomInterface::S1Mme),
        (r"(?i)S1[-_]?U\b|S1[-_]?UP", TelecomInterface::S1U),
        (r"(?i)X2[-_]?C\b|X2[-_]?CP|X2[-_]?AP", TelecomInterface::X2C),
        (r"(?i)S[58][-_]?C\b|S[58][-_]?CP", TelecomInterface::S5S8C),
        (r"(?i)S[58][-_]?U\b|S[58][-_]?UP", TelecomInterface::S5S8U),
        (r"(?i)\bS6[ad]\b", TelecomInterface::S6a),
        (r"(?i)\bGx\b|PCEF.*PCRF|PCRF.*PCEF", TelecomInterface::Gx),
        (r"(?i)\bRx\b|P-CSCF.*PCRF", TelecomInterface::Rx),
        (r"(?i)\bGy\b|\bOCS\b|online.*charging", TelecomInterface::Gy),
        (r"(?i)\bN2\b|NGAP|gNB.*AMF|AMF.*gNB", TelecomInterface::N2),
        (r"(?i)\bN3\b", TelecomInterface::N3),
        (r"(?i)\bN4\b|PFCP|SMF.*UPF", TelecomInterface::N4),
        (r"(?i)\bN6\b", TelecomInterface::N6),
        (r"(?i)IMS|\bSIP\b|[PSI]-CSCF", TelecomInterface::ImsSip),
        (r"(?i)\bRTP\b|\bmedia\b|\bvoice\b", TelecomInterface::RtpMedia),
        (r"(?i)SGi|\bGi\b|internet|\bPDN\b", TelecomInterface::SGi),
    ];
    table
        .iter()
        .map(|(pattern, kind)| {
            let re = Regex::new(pattern).expect("static classifier pattern");
            (re, *kind)
        })
        .collect()
});

/// Ports and protocol hits observed on one capture interface. Fed by the
/// packet processor, consumed when name matching was inconclusive.
#[derive(Debug, Clone, Default)]
pub struct TrafficObservation {
    pub sctp_ports: BTreeSet<u16>,
    pub udp_ports: BTreeSet<u16>,
    pub tcp_ports: BTreeSet<u16>,
    pub protocol_hits: HashMap<ProtocolType, u64>,
}

impl TrafficObservation {
    pub fn observe_ports(&mut self, ip_protocol: u8, src: u16, dst: u16) {
        let set = match ip_protocol {
            6 => &mut self.tcp_ports,
            17 => &mut self.udp_ports,
            132 => &mut self.sctp_ports,
            _ => return,
        };
        set.insert(src);
        set.insert(dst);
    }

    pub fn observe_protocol(&mut self, protocol: ProtocolType) {
        *self.protocol_hits.entry(protocol).or_insert(0) += 1;
    }

    fn hits(&self, protocol: ProtocolType) -> u64 {
        self.protocol_hits.get(&protocol).copied().unwrap_or(0)
    }
}

/// Maps capture interfaces to telecom reference points.
#[derive(Debug, Default)]
pub struct InterfaceClassifier;

impl InterfaceClassifier {
    /// Classification by `if_name`/`if_description` pattern matching.
    pub fn classify_by_name(name: &str, description: &str) -> TelecomInterface {
        let combined = format!("{name} {description}");
        for (re, kind) in NAME_PATTERNS.iter() {
            if re.is_match(&combined) {
                return *kind;
            }
        }
        TelecomInterface::Unknown
    }

    /// Classification from observed traffic, in the documented priority
    /// order: SCTP ports, GTP/PFCP ports, Diameter, SIP, RTP range, HTTP.
    pub fn classify_by_traffic(obs: &TrafficObservation) -> TelecomInterface {
        if obs.sctp_ports.contains(&PORT_S1_MME) {
            return TelecomInterface::S1Mme;
        }
        if obs.sctp_ports.contains(&PORT_N2) {
            return TelecomInterface::N2;
        }
        if obs.sctp_ports.contains(&PORT_X2_C) {
            return TelecomInterface::X2C;
        }

        if obs.udp_ports.contains(&PORT_GTP_C) {
            return TelecomInterface::S5S8C;
        }
        if obs.udp_ports.contains(&PORT_GTP_U) {
            // Could be S1-U, S5/S8-U, or N3; S1-U is the common default.
            return TelecomInterface::S1U;
        }
        if obs.udp_ports.contains(&PORT_PFCP) {
            return TelecomInterface::N4;
        }

        let diameter_port = obs.tcp_ports.contains(&PORT_DIAMETER)
            || obs.sctp_ports.contains(&PORT_DIAMETER);
        if diameter_port && obs.hits(ProtocolType::Diameter) > 0 {
            // S6a, Gx, Rx, and Gy are indistinguishable without AVP-level
            // inspection; S6a is the default.
            return TelecomInterface::S6a;
        }

        if obs.udp_ports.contains(&PORT_SIP)
            || obs.tcp_ports.contains(&PORT_SIP)
            || obs.tcp_ports.contains(&PORT_SIP_TLS)
        {
            return TelecomInterface::ImsSip;
        }

        if obs
            .udp_ports
            .iter()
            .any(|p| (PORT_RTP_MIN..=PORT_RTP_MAX).contains(p))
        {
            return TelecomInterface::RtpMedia;
        }

        if obs.tcp_ports.contains(&PORT_HTTP) || obs.tcp_ports.contains(&PORT_HTTPS) {
            let has_5g =
                obs.hits(ProtocolType::Ngap) > 0 || obs.udp_ports.contains(&PORT_PFCP);
            return if has_5g {
                TelecomInterface::N6
            } else {
                TelecomInterface::SGi
            };
        }

        TelecomInterface::Unknown
    }

    /// Name match first, traffic heuristics as fallback.
    pub fn classify(
        name: &str,
        description: &str,
        obs: &TrafficObservation,
    ) -> TelecomInterface {
        match Self::classify_by_name(name, description) {
            TelecomInterface::Unknown => Self::classify_by_traffic(obs),
            kind => kind,
        }
    }

    /// Well-known ports for a reference point, for diagnostics.
    pub fn well_known_ports(kind: TelecomInterface) -> &'static [u16] {
        match kind {
            TelecomInterface::S1Mme => &[PORT_S1_MME],
            TelecomInterface::S1U | TelecomInterface::S5S8U | TelecomInterface::N3 => {
                &[PORT_GTP_U]
            },
            TelecomInterface::S5S8C => &[PORT_GTP_C],
            TelecomInterface::S6a
            | TelecomInterface::Gx
            | TelecomInterface::Rx
            | TelecomInterface::Gy => &[PORT_DIAMETER],
            TelecomInterface::X2C => &[PORT_X2_C],
            TelecomInterface::N2 => &[PORT_N2],
            TelecomInterface::N4 => &[PORT_PFCP],
            TelecomInterface::SGi | TelecomInterface::N6 => &[PORT_HTTP, PORT_HTTPS],
            TelecomInterface::ImsSip => &[PORT_SIP, PORT_SIP_TLS],
            TelecomInterface::RtpMedia => &[PORT_RTP_MIN, PORT_RTP_MAX],
            TelecomInterface::Unknown => &[],
        }
    }

    /// Protocols expected on a reference point, for diagnostics.
    pub fn expected_protocols(kind: TelecomInterface) -> &'static [&'static str] {
        match kind {
            TelecomInterface::S1Mme => &["SCTP", "S1AP"],
            TelecomInterface::S1U | TelecomInterface::S5S8U | TelecomInterface::N3 => {
                &["UDP", "GTP-U"]
            },
            TelecomInterface::S5S8C => &["UDP", "GTP-C"],
            TelecomInterface::S6a
            | TelecomInterface::Gx
            | TelecomInterface::Rx
            | TelecomInterface::Gy => &["TCP", "SCTP", "DIAMETER"],
            TelecomInterface::X2C => &["SCTP", "X2AP"],
            TelecomInterface::N2 => &["SCTP", "NGAP"],
            TelecomInterface::N4 => &["UDP", "PFCP"],
            TelecomInterface::SGi | TelecomInterface::N6 => {
                &["TCP", "UDP", "HTTP", "HTTPS", "DNS", "TLS"]
            },
            TelecomInterface::ImsSip => &["UDP", "TCP", "SIP"],
            TelecomInterface::RtpMedia => &["UDP", "RTP", "RTCP"],
            TelecomInterface::Unknown => &[],
        }
    }
}
