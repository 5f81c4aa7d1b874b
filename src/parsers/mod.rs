// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod diameter;
pub mod gtpv2;
pub mod hpack;
pub mod http2;
pub mod nas;
pub mod rtp;
pub mod s1ap;
pub mod sba;
pub mod sip;

use serde_json::Value;

use crate::models::{MessageType, ProtocolType};

/// Closed set of parser outputs. Dispatch is a `match` over the variant,
/// never dynamic; larger payload structs are boxed to keep the enum slim.
#[derive(Debug, Clone)]
pub enum ParsedMessage {
    Sip(Box<sip::SipMessage>),
    Rtp(rtp::RtpHeader),
    Rtcp(rtp::RtcpHeader),
    Gtpv2(Box<gtpv2::Gtpv2Message>),
    GtpUser(gtpv2::GtpUserHeader),
    RanAp(Box<s1ap::RanApMessage>),
    Nas(Box<nas::NasMessage>),
    Diameter(Box<diameter::DiameterMessage>),
    Sba(Box<sba::SbaInteraction>),
}

impl ParsedMessage {
    pub fn protocol(&self) -> ProtocolType {
        match self {
            ParsedMessage::Sip(_) => ProtocolType::Sip,
            ParsedMessage::Rtp(_) => ProtocolType::Rtp,
            ParsedMessage::Rtcp(_) => ProtocolType::Rtcp,
            ParsedMessage::Gtpv2(_) => ProtocolType::GtpC,
            ParsedMessage::GtpUser(_) => ProtocolType::GtpU,
            ParsedMessage::RanAp(msg) => match msg.protocol {
                s1ap::RanProtocol::S1ap => ProtocolType::S1ap,
                s1ap::RanProtocol::Ngap => ProtocolType::Ngap,
                s1ap::RanProtocol::X2ap => ProtocolType::X2ap,
            },
            ParsedMessage::Nas(_) => ProtocolType::Nas,
            ParsedMessage::Diameter(_) => ProtocolType::Diameter,
            ParsedMessage::Sba(_) => ProtocolType::Http2,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            ParsedMessage::Sip(msg) => msg.message_type(),
            ParsedMessage::Rtp(_) => MessageType::RtpData,
            ParsedMessage::Rtcp(_) => MessageType::RtcpReport,
            ParsedMessage::Gtpv2(msg) => msg.message_type(),
            ParsedMessage::GtpUser(_) => MessageType::GtpUserData,
            ParsedMessage::RanAp(msg) => msg.message_type(),
            ParsedMessage::Nas(msg) => msg.message_type(),
            ParsedMessage::Diameter(msg) => msg.message_type(),
            ParsedMessage::Sba(_) => MessageType::SbaInteraction,
        }
    }

    /// Canonical structured record. Deterministic for identical input
    /// bytes: the serializers touch parsed fields only.
    pub fn to_json(&self) -> Value {
        let result = match self {
            ParsedMessage::Sip(msg) => serde_json::to_value(msg),
            ParsedMessage::Rtp(msg) => serde_json::to_value(msg),
            ParsedMessage::Rtcp(msg) => serde_json::to_value(msg),
            ParsedMessage::Gtpv2(msg) => serde_json::to_value(msg),
            ParsedMessage::GtpUser(msg) => serde_json::to_value(msg),
            ParsedMessage::RanAp(msg) => serde_json::to_value(msg),
            ParsedMessage::Nas(msg) => serde_json::to_value(msg),
            ParsedMessage::Diameter(msg) => serde_json::to_value(msg),
            ParsedMessage::Sba(msg) => serde_json::to_value(msg),
        };
        result.unwrap_or(Value::Null)
    }
}

/// Heuristic protocol identification for payloads whose port or PPID did
/// not already decide. Probes are ordered from the most to the least
/// distinctive framing.
pub fn detect(payload: &[u8]) -> ProtocolType {
    if sip::probe(payload) {
        return ProtocolType::Sip;
    }
    if diameter::probe(payload) {
        return ProtocolType::Diameter;
    }
    if gtpv2::probe(payload) {
        return ProtocolType::GtpC;
    }
    if gtpv2::probe_gtpu(payload) {
        return ProtocolType::GtpU;
    }
    if http2::probe(payload) {
        return ProtocolType::Http2;
    }
    if rtp::probe_rtcp(payload) {
        return ProtocolType::Rtcp;
    }
    if rtp::probe_rtp(payload) {
        return ProtocolType::Rtp;
    }
    ProtocolType::Unknown
}
