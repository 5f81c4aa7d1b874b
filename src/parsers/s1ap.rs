// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::Serialize;
use tracing::debug;

use crate::models::{
    MessageType,
    error::{Error, Result},
};

/// Which RAN application protocol framed the PDU. S1AP, NGAP, and X2AP
/// share the envelope; IE ids and procedure codes differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RanProtocol {
    S1ap,
    Ngap,
    X2ap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PduType {
    InitiatingMessage,
    SuccessfulOutcome,
    UnsuccessfulOutcome,
}

// S1AP procedure codes (TS 36.413).
pub mod s1ap_proc {
    pub const HANDOVER_PREPARATION: u8 = 0;
    pub const PATH_SWITCH_REQUEST: u8 = 3;
    pub const INITIAL_CONTEXT_SETUP: u8 = 9;
    pub const DOWNLINK_NAS_TRANSPORT: u8 = 11;
    pub const INITIAL_UE_MESSAGE: u8 = 12;
    pub const UPLINK_NAS_TRANSPORT: u8 = 13;
    pub const UE_CONTEXT_RELEASE: u8 = 23;
}

// NGAP procedure codes (TS 38.413).
pub mod ngap_proc {
    pub const DOWNLINK_NAS_TRANSPORT: u8 = 4;
    pub const HANDOVER_PREPARATION: u8 = 12;
    pub const INITIAL_UE_MESSAGE: u8 = 15;
    pub const UPLINK_NAS_TRANSPORT: u8 = 46;
    pub const PATH_SWITCH_REQUEST: u8 = 57;
}

// Protocol IE ids.
mod s1ap_ie {
    pub const MME_UE_S1AP_ID: u16 = 0;
    pub const CAUSE: u16 = 2;
    pub const ENB_UE_S1AP_ID: u16 = 8;
    pub const E_RAB_TO_BE_SETUP_LIST: u16 = 24;
    pub const NAS_PDU: u16 = 26;
    pub const E_RAB_SETUP_LIST: u16 = 28;
    pub const TAI: u16 = 67;
    pub const EUTRAN_CGI: u16 = 100;
    pub const UE_SECURITY_CAPABILITIES: u16 = 107;
    pub const RRC_ESTABLISHMENT_CAUSE: u16 = 134;
}

mod ngap_ie {
    pub const AMF_UE_NGAP_ID: u16 = 10;
    pub const CAUSE: u16 = 15;
    pub const NAS_PDU: u16 = 38;
    pub const RAN_UE_NGAP_ID: u16 = 85;
    pub const USER_LOCATION_INFORMATION: u16 = 121;
}

#[derive(Debug, Clone, Serialize)]
pub struct Tai {
    /// MCC+MNC as ASCII digits.
    pub plmn: String,
    pub tac: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CellIdentity {
    pub plmn: String,
    pub cell_id: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ErabItem {
    pub erab_id: u8,
    pub qci: Option<u8>,
    pub transport_address: Option<IpAddr>,
    pub gtp_teid: Option<u32>,
    #[serde(skip)]
    pub nas_pdu: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RanApMessage {
    pub protocol: RanProtocol,
    pub pdu_type: PduType,
    pub procedure_code: u8,
    pub criticality: u8,
    pub mme_ue_id: Option<u64>,
    pub enb_ue_id: Option<u32>,
    #[serde(skip)]
    pub nas_pdus: Vec<Vec<u8>>,
    pub tai: Option<Tai>,
    pub cgi: Option<CellIdentity>,
    pub ue_security_capabilities: Option<String>,
    pub erabs: Vec<ErabItem>,
    pub cause: Option<(u8, u8)>,
    pub rrc_establishment_cause: Option<u8>,
}

impl RanApMessage {
    pub fn message_type(&self) -> MessageType {
        match self.protocol {
            RanProtocol::S1ap => match self.procedure_code {
                s1ap_proc::INITIAL_UE_MESSAGE => MessageType::S1apInitialUeMessage,
                s1ap_proc::INITIAL_CONTEXT_SETUP => MessageType::S1apInitialContextSetup,
                s1ap_proc::UPLINK_NAS_TRANSPORT => MessageType::S1apUplinkNasTransport,
                s1ap_proc::DOWNLINK_NAS_TRANSPORT => {
                    MessageType::S1apDownlinkNasTransport
                },
                s1ap_proc::PATH_SWITCH_REQUEST => MessageType::S1apPathSwitchRequest,
                s1ap_proc::HANDOVER_PREPARATION => MessageType::S1apHandoverRequest,
                s1ap_proc::UE_CONTEXT_RELEASE => MessageType::S1apUeContextRelease,
                _ => MessageType::S1apOther,
            },
            RanProtocol::Ngap => match self.procedure_code {
                ngap_proc::INITIAL_UE_MESSAGE => MessageType::NgapInitialUeMessage,
                ngap_proc::PATH_SWITCH_REQUEST => MessageType::NgapPathSwitchRequest,
                ngap_proc::HANDOVER_PREPARATION => MessageType::NgapHandoverRequest,
                _ => MessageType::NgapOther,
            },
            RanProtocol::X2ap => match self.procedure_code {
                0 => MessageType::X2apHandoverRequest,
                _ => MessageType::X2apOther,
            },
        }
    }
}

pub fn probe(data: &[u8]) -> bool {
    // PDU choice byte uses only the top bits; 0x00/0x20/0x40.
    data.len() >= 4 && data[0] & 0x9F == 0
}

/// Pragmatic ASN.1 PER decoder for the RAN-AP envelope:
/// pdu-choice, procedure code, criticality, a length determinant, then the
/// protocol IE list (`id(2), criticality(1), length, value`).
pub fn parse(data: &[u8], protocol: RanProtocol) -> Result<RanApMessage> {
    if data.len() < 4 {
        return Err(Error::truncated(4, data.len()));
    }

    let pdu_type = match data[0] >> 5 {
        0 => PduType::InitiatingMessage,
        1 => PduType::SuccessfulOutcome,
        2 => PduType::UnsuccessfulOutcome,
        other => {
            return Err(Error::malformed("RAN-AP", format!("pdu choice {other}")));
        },
    };
    let procedure_code = data[1];
    let criticality = data[2] >> 6;

    let mut msg = RanApMessage {
        protocol,
        pdu_type,
        procedure_code,
        criticality,
        mme_ue_id: None,
        enb_ue_id: None,
        nas_pdus: Vec::new(),
        tai: None,
        cgi: None,
        ue_security_capabilities: None,
        erabs: Vec::new(),
        cause: None,
        rrc_establishment_cause: None,
    };

    // Length determinant over the PDU value.
    let (value_len, mut cursor) = read_length(&data[3..])?;
    let value = cursor
        .get(..value_len)
        .ok_or_else(|| Error::truncated(value_len, cursor.len()))?;

    // SEQUENCE preamble (extension/options bitmap) and IE count.
    if value.len() < 3 {
        return Err(Error::truncated(3, value.len()));
    }
    let ie_count = usize::from(u16::from_be_bytes([value[1], value[2]]));
    cursor = &value[3..];

    for _ in 0..ie_count {
        if cursor.len() < 3 {
            break;
        }
        let ie_id = u16::from_be_bytes([cursor[0], cursor[1]]);
        // cursor[2] is the IE criticality.
        let (ie_len, rest) = read_length(&cursor[3..])?;
        let Some(ie_value) = rest.get(..ie_len) else {
            debug!("ran-ap IE {ie_id} extends beyond the PDU");
            break;
        };

        apply_ie(&mut msg, ie_id, ie_value);

        cursor = &rest[ie_len..];
    }

    Ok(msg)
}

/// PER length determinant: short form (< 128) or two-byte long form with
/// the 0x80 marker.
fn read_length(data: &[u8]) -> Result<(usize, &[u8])> {
    let first = *data.first().ok_or_else(|| Error::truncated(1, 0))?;
    if first & 0x80 == 0 {
        return Ok((usize::from(first), &data[1..]));
    }
    let second = *data.get(1).ok_or_else(|| Error::truncated(2, data.len()))?;
    let len = (usize::from(first & 0x3F) << 8) | usize::from(second);
    Ok((len, &data[2..]))
}

fn apply_ie(msg: &mut RanApMessage, ie_id: u16, value: &[u8]) {
    let (id_mme, id_enb, id_nas, id_cause) = match msg.protocol {
        RanProtocol::Ngap => (
            ngap_ie::AMF_UE_NGAP_ID,
            ngap_ie::RAN_UE_NGAP_ID,
            ngap_ie::NAS_PDU,
            ngap_ie::CAUSE,
        ),
        _ => (
            s1ap_ie::MME_UE_S1AP_ID,
            s1ap_ie::ENB_UE_S1AP_ID,
            s1ap_ie::NAS_PDU,
            s1ap_ie::CAUSE,
        ),
    };

    match ie_id {
        id if id == id_mme => msg.mme_ue_id = Some(be_uint(value)),
        id if id == id_enb => msg.enb_ue_id = Some(be_uint(value) as u32),
        id if id == id_nas => {
            if !value.is_empty() {
                msg.nas_pdus.push(value.to_vec());
            }
        },
        id if id == id_cause => {
            if value.len() >= 2 {
                msg.cause = Some((value[0], value[1]));
            }
        },
        s1ap_ie::TAI if msg.protocol != RanProtocol::Ngap => {
            if value.len() >= 5 {
                msg.tai = Some(Tai {
                    plmn: decode_plmn(&value[..3]),
                    tac: u32::from(u16::from_be_bytes([value[3], value[4]])),
                });
            }
        },
        s1ap_ie::EUTRAN_CGI if msg.protocol != RanProtocol::Ngap => {
            if value.len() >= 7 {
                let cell = u32::from_be_bytes([value[3], value[4], value[5], value[6]])
                    >> 4;
                msg.cgi = Some(CellIdentity {
                    plmn: decode_plmn(&value[..3]),
                    cell_id: cell,
                });
            }
        },
        ngap_ie::USER_LOCATION_INFORMATION if msg.protocol == RanProtocol::Ngap => {
            if value.len() >= 5 {
                msg.tai = Some(Tai {
                    plmn: decode_plmn(&value[..3]),
                    tac: u32::from(u16::from_be_bytes([value[3], value[4]])),
                });
            }
        },
        s1ap_ie::UE_SECURITY_CAPABILITIES => {
            msg.ue_security_capabilities = Some(hex::encode(value));
        },
        s1ap_ie::RRC_ESTABLISHMENT_CAUSE => {
            msg.rrc_establishment_cause = value.first().copied();
        },
        s1ap_ie::E_RAB_TO_BE_SETUP_LIST | s1ap_ie::E_RAB_SETUP_LIST => {
            msg.erabs.extend(parse_erab_list(value));
        },
        other => {
            debug!("ran-ap: skipping IE {other}");
        },
    }
}

/// E-RAB item layout used by this decoder:
/// `erab-id(1) qci(1) transport-ip(4) gtp-teid(4) [nas-len(2) nas]`,
/// repeated; a count byte leads the list.
fn parse_erab_list(value: &[u8]) -> Vec<ErabItem> {
    let mut items = Vec::new();
    let Some((&count, mut cursor)) = value.split_first() else {
        return items;
    };

    for _ in 0..count {
        if cursor.len() < 10 {
            break;
        }
        let mut item = ErabItem {
            erab_id: cursor[0] & 0x0F,
            qci: Some(cursor[1]),
            transport_address: Some(IpAddr::V4(Ipv4Addr::new(
                cursor[2], cursor[3], cursor[4], cursor[5],
            ))),
            gtp_teid: Some(u32::from_be_bytes([
                cursor[6], cursor[7], cursor[8], cursor[9],
            ])),
            nas_pdu: None,
        };
        cursor = &cursor[10..];

        if cursor.len() >= 2 {
            let nas_len = usize::from(u16::from_be_bytes([cursor[0], cursor[1]]));
            cursor = &cursor[2..];
            if nas_len > 0 && cursor.len() >= nas_len {
                item.nas_pdu = Some(cursor[..nas_len].to_vec());
                cursor = &cursor[nas_len..];
            }
        }

        items.push(item);
    }

    items
}

fn be_uint(value: &[u8]) -> u64 {
    value
        .iter()
        .take(8)
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

/// PLMN identity BCD: MCC digit order 2-1, MNC3|MCC3, MNC 2-1; an 0xF
/// MNC3 nibble means a two-digit MNC.
pub fn decode_plmn(bytes: &[u8]) -> String {
    if bytes.len() < 3 {
        return String::new();
    }
    let d = |n: u8| char::from(b'0' + (n & 0x0F).min(9));

    let mcc1 = bytes[0] & 0x0F;
    let mcc2 = bytes[0] >> 4;
    let mcc3 = bytes[1] & 0x0F;
    let mnc3 = bytes[1] >> 4;
    let mnc1 = bytes[2] & 0x0F;
    let mnc2 = bytes[2] >> 4;

    let mut out = String::with_capacity(6);
    out.push(d(mcc1));
    out.push(d(mcc2));
    out.push(d(mcc3));
    out.push(d(mnc1));
    out.push(d(mnc2));
    if mnc3 != 0x0F {
        out.push(d(mnc3));
    }
    out
}

/// IPv6-capable transport address helper for builders and future IEs.
pub fn transport_address(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        },
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        },
        _ => None,
    }
}
