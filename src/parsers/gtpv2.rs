// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::net::{Ipv4Addr, Ipv6Addr};

use serde::Serialize;

use crate::{
    models::{
        MessageType,
        error::{Error, Result},
    },
    utils::decode_tbcd,
};

// Message types (TS 29.274 §6.1).
pub const MSG_ECHO_REQUEST: u8 = 1;
pub const MSG_ECHO_RESPONSE: u8 = 2;
pub const MSG_CREATE_SESSION_REQUEST: u8 = 32;
pub const MSG_CREATE_SESSION_RESPONSE: u8 = 33;
pub const MSG_MODIFY_BEARER_REQUEST: u8 = 34;
pub const MSG_MODIFY_BEARER_RESPONSE: u8 = 35;
pub const MSG_DELETE_SESSION_REQUEST: u8 = 36;
pub const MSG_DELETE_SESSION_RESPONSE: u8 = 37;

// IE types (TS 29.274 §8.1).
const IE_IMSI: u8 = 1;
const IE_CAUSE: u8 = 2;
const IE_APN: u8 = 71;
const IE_EBI: u8 = 73;
const IE_MSISDN: u8 = 76;
const IE_PAA: u8 = 79;
const IE_BEARER_QOS: u8 = 80;
const IE_RAT_TYPE: u8 = 82;
const IE_FTEID: u8 = 87;
const IE_BEARER_CONTEXT: u8 = 93;
const IE_PDN_TYPE: u8 = 99;

/// Nested grouped-IE recursion bound.
const MAX_GROUP_DEPTH: usize = 3;

/// F-TEID interface types (subset).
pub const FTEID_IF_S1U_ENODEB: u8 = 0;
pub const FTEID_IF_S1U_SGW: u8 = 1;
pub const FTEID_IF_S5S8_SGW_C: u8 = 6;
pub const FTEID_IF_S11_MME_C: u8 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct Fteid {
    pub interface_type: u8,
    pub teid: u32,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BearerContext {
    pub eps_bearer_id: Option<u8>,
    pub qci: Option<u8>,
    /// F-TEID with interface type S1-U eNodeB (uplink endpoint).
    pub enb_fteid: Option<Fteid>,
    /// F-TEID with interface type S1-U SGW (downlink endpoint).
    pub sgw_fteid: Option<Fteid>,
    pub fteids: Vec<Fteid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Gtpv2Message {
    pub message_type_raw: u8,
    pub teid: Option<u32>,
    pub sequence: u32,
    pub piggybacked: bool,
    pub imsi: Option<String>,
    pub msisdn: Option<String>,
    pub apn: Option<String>,
    pub cause: Option<u8>,
    pub rat_type: Option<u8>,
    pub pdn_type: Option<u8>,
    pub ue_ipv4: Option<Ipv4Addr>,
    pub ue_ipv6: Option<Ipv6Addr>,
    pub eps_bearer_id: Option<u8>,
    pub sender_fteid: Option<Fteid>,
    pub bearer_contexts: Vec<BearerContext>,
}

impl Gtpv2Message {
    pub fn message_type(&self) -> MessageType {
        match self.message_type_raw {
            MSG_ECHO_REQUEST => MessageType::GtpEchoRequest,
            MSG_ECHO_RESPONSE => MessageType::GtpEchoResponse,
            MSG_CREATE_SESSION_REQUEST => MessageType::GtpCreateSessionRequest,
            MSG_CREATE_SESSION_RESPONSE => MessageType::GtpCreateSessionResponse,
            MSG_MODIFY_BEARER_REQUEST => MessageType::GtpModifyBearerRequest,
            MSG_MODIFY_BEARER_RESPONSE => MessageType::GtpModifyBearerResponse,
            MSG_DELETE_SESSION_REQUEST => MessageType::GtpDeleteSessionRequest,
            MSG_DELETE_SESSION_RESPONSE => MessageType::GtpDeleteSessionResponse,
            _ => MessageType::Unknown,
        }
    }

    pub fn is_request(&self) -> bool {
        self.message_type_raw % 2 == 0 && self.message_type_raw >= 32
            || self.message_type_raw == MSG_ECHO_REQUEST
    }
}

pub fn probe(data: &[u8]) -> bool {
    if data.len() < 8 {
        return false;
    }
    let version = data[0] >> 5;
    if version != 2 {
        return false;
    }
    let length = usize::from(u16::from_be_bytes([data[2], data[3]]));
    length >= 4 && 4 + length <= data.len()
}

/// Parses a GTPv2-C message starting at the GTP header.
pub fn parse(data: &[u8]) -> Result<Gtpv2Message> {
    if data.len() < 8 {
        return Err(Error::truncated(8, data.len()));
    }

    let flags = data[0];
    let version = flags >> 5;
    if version != 2 {
        return Err(Error::malformed("GTPv2", format!("version {version}")));
    }
    let piggybacked = flags & 0x10 != 0;
    let has_teid = flags & 0x08 != 0;

    let message_type_raw = data[1];
    let length = usize::from(u16::from_be_bytes([data[2], data[3]]));
    if data.len() < 4 + length {
        return Err(Error::truncated(4 + length, data.len()));
    }

    let (teid, seq_at) = if has_teid {
        if length < 8 {
            return Err(Error::malformed("GTPv2", "length below TEID header"));
        }
        let teid = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        (Some(teid), 8usize)
    } else {
        (None, 4usize)
    };

    if data.len() < seq_at + 4 {
        return Err(Error::truncated(seq_at + 4, data.len()));
    }
    let sequence = u32::from_be_bytes([0, data[seq_at], data[seq_at + 1], data[seq_at + 2]]);

    let mut msg = Gtpv2Message {
        message_type_raw,
        teid,
        sequence,
        piggybacked,
        imsi: None,
        msisdn: None,
        apn: None,
        cause: None,
        rat_type: None,
        pdn_type: None,
        ue_ipv4: None,
        ue_ipv6: None,
        eps_bearer_id: None,
        sender_fteid: None,
        bearer_contexts: Vec::new(),
    };

    let ies_start = seq_at + 4;
    let ies_end = 4 + length;
    parse_ies(&data[ies_start..ies_end], &mut msg, 0)?;

    Ok(msg)
}

/// TLV walk: type(1), length(2), spare/instance(1), value.
fn parse_ies(mut data: &[u8], msg: &mut Gtpv2Message, depth: usize) -> Result<()> {
    if depth > MAX_GROUP_DEPTH {
        return Err(Error::Sanity("gtpv2 grouped IE nesting too deep"));
    }

    while data.len() >= 4 {
        let ie_type = data[0];
        let ie_len = usize::from(u16::from_be_bytes([data[1], data[2]]));
        let instance = data[3] & 0x0F;
        let value = data
            .get(4..4 + ie_len)
            .ok_or_else(|| Error::truncated(4 + ie_len, data.len()))?;

        match ie_type {
            IE_IMSI => msg.imsi = Some(decode_tbcd(value)),
            IE_MSISDN => msg.msisdn = Some(decode_tbcd(value)),
            IE_APN => msg.apn = Some(decode_apn(value)),
            IE_CAUSE => msg.cause = value.first().copied(),
            IE_RAT_TYPE => msg.rat_type = value.first().copied(),
            IE_PDN_TYPE => msg.pdn_type = value.first().map(|b| b & 0x07),
            IE_EBI => msg.eps_bearer_id = value.first().map(|b| b & 0x0F),
            IE_PAA => decode_paa(value, msg),
            IE_FTEID => {
                if let Some(fteid) = decode_fteid(value) {
                    if instance == 0 && msg.sender_fteid.is_none() {
                        msg.sender_fteid = Some(fteid);
                    }
                }
            },
            IE_BEARER_CONTEXT => {
                let ctx = parse_bearer_context(value, depth + 1)?;
                msg.bearer_contexts.push(ctx);
            },
            _ => {},
        }

        data = &data[4 + ie_len..];
    }

    Ok(())
}

fn parse_bearer_context(data: &[u8], depth: usize) -> Result<BearerContext> {
    if depth > MAX_GROUP_DEPTH {
        return Err(Error::Sanity("gtpv2 grouped IE nesting too deep"));
    }

    let mut ctx = BearerContext::default();
    let mut cursor = data;

    while cursor.len() >= 4 {
        let ie_type = cursor[0];
        let ie_len = usize::from(u16::from_be_bytes([cursor[1], cursor[2]]));
        let value = cursor
            .get(4..4 + ie_len)
            .ok_or_else(|| Error::truncated(4 + ie_len, cursor.len()))?;

        match ie_type {
            IE_EBI => ctx.eps_bearer_id = value.first().map(|b| b & 0x0F),
            IE_BEARER_QOS => {
                // Flags/ARP byte, then QCI.
                ctx.qci = value.get(1).copied();
            },
            IE_FTEID => {
                if let Some(fteid) = decode_fteid(value) {
                    match fteid.interface_type {
                        FTEID_IF_S1U_ENODEB => ctx.enb_fteid = Some(fteid.clone()),
                        FTEID_IF_S1U_SGW => ctx.sgw_fteid = Some(fteid.clone()),
                        _ => {},
                    }
                    ctx.fteids.push(fteid);
                }
            },
            _ => {},
        }

        cursor = &cursor[4 + ie_len..];
    }

    Ok(ctx)
}

fn decode_fteid(value: &[u8]) -> Option<Fteid> {
    if value.len() < 5 {
        return None;
    }
    let flags = value[0];
    let has_v4 = flags & 0x80 != 0;
    let has_v6 = flags & 0x40 != 0;
    let interface_type = flags & 0x3F;
    let teid = u32::from_be_bytes([value[1], value[2], value[3], value[4]]);

    let mut at = 5usize;
    let ipv4 = if has_v4 {
        let octets: [u8; 4] = value.get(at..at + 4)?.try_into().ok()?;
        at += 4;
        Some(Ipv4Addr::from(octets))
    } else {
        None
    };
    let ipv6 = if has_v6 {
        let octets: [u8; 16] = value.get(at..at + 16)?.try_into().ok()?;
        Some(Ipv6Addr::from(octets))
    } else {
        None
    };

    Some(Fteid {
        interface_type,
        teid,
        ipv4,
        ipv6,
    })
}

/// PDN Address Allocation: type octet then the address(es).
fn decode_paa(value: &[u8], msg: &mut Gtpv2Message) {
    let Some(&pdn_type) = value.first() else {
        return;
    };
    match pdn_type & 0x07 {
        1 => {
            if let Some(octets) = value.get(1..5) {
                let octets: [u8; 4] = octets.try_into().unwrap_or_default();
                msg.ue_ipv4 = Some(Ipv4Addr::from(octets));
            }
        },
        2 => {
            // Prefix length octet precedes the address.
            if let Some(octets) = value.get(2..18) {
                let octets: [u8; 16] = octets.try_into().unwrap_or_default();
                msg.ue_ipv6 = Some(Ipv6Addr::from(octets));
            }
        },
        3 => {
            if let Some(octets) = value.get(2..18) {
                let octets: [u8; 16] = octets.try_into().unwrap_or_default();
                msg.ue_ipv6 = Some(Ipv6Addr::from(octets));
            }
            if let Some(octets) = value.get(18..22) {
                let octets: [u8; 4] = octets.try_into().unwrap_or_default();
                msg.ue_ipv4 = Some(Ipv4Addr::from(octets));
            }
        },
        _ => {},
    }
}

/// APN is a DNS-style label sequence.
fn decode_apn(value: &[u8]) -> String {
    let mut labels = Vec::new();
    let mut cursor = value;
    while let Some((&len, rest)) = cursor.split_first() {
        let len = usize::from(len);
        if len == 0 || rest.len() < len {
            break;
        }
        labels.push(String::from_utf8_lossy(&rest[..len]).into_owned());
        cursor = &rest[len..];
    }
    if labels.is_empty() {
        // Some encoders ship the bare string.
        String::from_utf8_lossy(value).into_owned()
    } else {
        labels.join(".")
    }
}

/// Minimal GTP-U (GTPv1 user plane) header view: enough to account user
/// traffic against a tunnel.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GtpUserHeader {
    pub message_type: u8,
    pub teid: u32,
    pub payload_length: u16,
}

pub fn probe_gtpu(data: &[u8]) -> bool {
    data.len() >= 8 && (data[0] >> 5) == 1 && data[0] & 0x10 != 0
}

pub fn parse_gtpu(data: &[u8]) -> Result<GtpUserHeader> {
    if data.len() < 8 {
        return Err(Error::truncated(8, data.len()));
    }
    let version = data[0] >> 5;
    if version != 1 {
        return Err(Error::malformed("GTP-U", format!("version {version}")));
    }
    Ok(GtpUserHeader {
        message_type: data[1],
        teid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        payload_length: u16::from_be_bytes([data[2], data[3]]),
    })
}
