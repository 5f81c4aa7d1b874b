// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use serde::Serialize;

use crate::{
    models::{
        MessageType,
        error::{Error, Result},
    },
    utils::decode_tbcd,
};

// Protocol discriminators (TS 24.007).
pub const PD_ESM: u8 = 0x02;
pub const PD_EMM: u8 = 0x07;
pub const PD_5GSM: u8 = 0x2E;
pub const PD_5GMM: u8 = 0x7E;

// Security header types (TS 24.301 §9.3.1).
pub const SHT_PLAIN: u8 = 0;
pub const SHT_INTEGRITY: u8 = 1;
pub const SHT_INTEGRITY_CIPHERED: u8 = 2;
pub const SHT_INTEGRITY_NEW_CTX: u8 = 3;
pub const SHT_INTEGRITY_CIPHERED_NEW_CTX: u8 = 4;
pub const SHT_SERVICE_REQUEST: u8 = 12;

// EMM message types.
pub const EMM_ATTACH_REQUEST: u8 = 0x41;
pub const EMM_ATTACH_ACCEPT: u8 = 0x42;
pub const EMM_DETACH_REQUEST: u8 = 0x45;
pub const EMM_IDENTITY_RESPONSE: u8 = 0x56;

// ESM message types.
pub const ESM_ACTIVATE_DEFAULT_BEARER_REQUEST: u8 = 0xC1;
pub const ESM_PDN_CONNECTIVITY_REQUEST: u8 = 0xD0;

// 5GMM message types.
pub const MM5G_REGISTRATION_REQUEST: u8 = 0x41;

// 5GSM message types.
pub const SM5G_PDU_SESSION_ESTABLISHMENT_REQUEST: u8 = 0xC1;

/// Which stratum generation framed the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NasDomain {
    Lte,
    FiveG,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MobileIdentityKind {
    Imsi,
    Imei,
    Guti,
    Suci,
    FiveGGuti,
    FiveGSTmsi,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct MobileIdentity {
    pub kind: MobileIdentityKind,
    pub digits: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NasMessage {
    pub domain: NasDomain,
    pub protocol_discriminator: u8,
    pub security_header_type: u8,
    /// Ciphered payloads are carried opaquely.
    pub protected: bool,
    pub message_type_raw: u8,
    pub imsi: Option<String>,
    pub guti: Option<String>,
    pub suci: Option<String>,
    pub imei: Option<String>,
    pub apn: Option<String>,
    pub dnn: Option<String>,
    pub pdn_type: Option<u8>,
    pub eps_bearer_id: Option<u8>,
    pub pdu_session_id: Option<u8>,
    pub esm_cause: Option<u8>,
    pub snssai: Option<String>,
}

impl NasMessage {
    fn empty(domain: NasDomain, pd: u8, sht: u8) -> Self {
        Self {
            domain,
            protocol_discriminator: pd,
            security_header_type: sht,
            protected: false,
            message_type_raw: 0,
            imsi: None,
            guti: None,
            suci: None,
            imei: None,
            apn: None,
            dnn: None,
            pdn_type: None,
            eps_bearer_id: None,
            pdu_session_id: None,
            esm_cause: None,
            snssai: None,
        }
    }

    pub fn message_type(&self) -> MessageType {
        if self.protected {
            return MessageType::NasProtected;
        }
        match (self.domain, self.protocol_discriminator, self.message_type_raw) {
            (NasDomain::Lte, PD_EMM, EMM_ATTACH_REQUEST) => MessageType::NasAttachRequest,
            (NasDomain::Lte, PD_EMM, EMM_ATTACH_ACCEPT) => MessageType::NasAttachAccept,
            (NasDomain::Lte, PD_EMM, EMM_DETACH_REQUEST) => MessageType::NasDetachRequest,
            (NasDomain::Lte, PD_ESM, ESM_PDN_CONNECTIVITY_REQUEST) => {
                MessageType::NasPdnConnectivityRequest
            },
            (NasDomain::FiveG, PD_5GMM, MM5G_REGISTRATION_REQUEST) => {
                MessageType::NasAttachRequest
            },
            _ => MessageType::NasOther,
        }
    }
}

pub fn probe(data: &[u8]) -> bool {
    let Some(&first) = data.first() else {
        return false;
    };
    if first == PD_5GMM || first == PD_5GSM {
        return data.len() >= 3;
    }
    let pd = first & 0x0F;
    (pd == PD_EMM || pd == PD_ESM) && data.len() >= 2
}

/// Parses a NAS PDU extracted from S1AP/NGAP transport.
pub fn parse(data: &[u8]) -> Result<NasMessage> {
    let first = *data.first().ok_or_else(|| Error::truncated(1, 0))?;

    if first == PD_5GMM || first == PD_5GSM {
        return parse_5g(data);
    }
    parse_lte(data)
}

fn parse_lte(data: &[u8]) -> Result<NasMessage> {
    let first = data[0];
    let pd = first & 0x0F;
    let high = first >> 4;

    match pd {
        PD_EMM => {
            let sht = high;
            match sht {
                SHT_PLAIN => parse_emm_plain(data),
                SHT_INTEGRITY | SHT_INTEGRITY_NEW_CTX => {
                    // MAC(4) + sequence(1), then the readable inner message.
                    let inner = data
                        .get(6..)
                        .ok_or_else(|| Error::truncated(7, data.len()))?;
                    if inner.is_empty() {
                        return Err(Error::truncated(7, data.len()));
                    }
                    let mut msg = parse(inner)?;
                    msg.security_header_type = sht;
                    Ok(msg)
                },
                SHT_INTEGRITY_CIPHERED
                | SHT_INTEGRITY_CIPHERED_NEW_CTX
                | SHT_SERVICE_REQUEST => {
                    let mut msg = NasMessage::empty(NasDomain::Lte, pd, sht);
                    msg.protected = true;
                    Ok(msg)
                },
                other => Err(Error::malformed(
                    "NAS",
                    format!("security header type {other}"),
                )),
            }
        },
        PD_ESM => parse_esm(data),
        other => Err(Error::unsupported(
            "NAS",
            format!("protocol discriminator 0x{other:02x}"),
        )),
    }
}

fn parse_emm_plain(data: &[u8]) -> Result<NasMessage> {
    if data.len() < 2 {
        return Err(Error::truncated(2, data.len()));
    }
    let mut msg = NasMessage::empty(NasDomain::Lte, PD_EMM, SHT_PLAIN);
    msg.message_type_raw = data[1];

    match msg.message_type_raw {
        EMM_ATTACH_REQUEST => {
            // Attach type/NAS KSI octet, then EPS mobile identity (LV).
            if let Some(rest) = data.get(3..) {
                apply_identity(&mut msg, read_lv(rest));
            }
        },
        EMM_ATTACH_ACCEPT => {
            // Attach result, T3412, then TAI list (LV); GUTI arrives as a
            // tagged IE (0x50).
            if let Some(identity) = find_tlv(data.get(2..).unwrap_or_default(), 0x50) {
                apply_identity(&mut msg, decode_mobile_identity(identity));
            }
        },
        EMM_IDENTITY_RESPONSE => {
            if let Some(rest) = data.get(2..) {
                apply_identity(&mut msg, read_lv(rest));
            }
        },
        _ => {},
    }

    Ok(msg)
}

fn parse_esm(data: &[u8]) -> Result<NasMessage> {
    if data.len() < 3 {
        return Err(Error::truncated(3, data.len()));
    }
    let mut msg = NasMessage::empty(NasDomain::Lte, PD_ESM, SHT_PLAIN);
    msg.eps_bearer_id = Some(data[0] >> 4);
    // data[1] is the procedure transaction identity.
    msg.message_type_raw = data[2];

    let rest = data.get(3..).unwrap_or_default();
    match msg.message_type_raw {
        ESM_PDN_CONNECTIVITY_REQUEST => {
            // PDN type / request type nibble pair.
            if let Some(&b) = rest.first() {
                msg.pdn_type = Some(b >> 4 & 0x07);
            }
            if let Some(apn) = find_tlv(rest.get(1..).unwrap_or_default(), 0x28) {
                msg.apn = Some(decode_labels(apn));
            }
        },
        ESM_ACTIVATE_DEFAULT_BEARER_REQUEST => {
            // EPS QoS (LV), then APN (LV).
            if let Some((qos_len, after)) = rest
                .split_first()
                .map(|(&l, r)| (usize::from(l), r))
            {
                if let Some(after_qos) = after.get(qos_len..) {
                    if let Some((&apn_len, apn)) = after_qos.split_first() {
                        if let Some(apn) = apn.get(..usize::from(apn_len)) {
                            msg.apn = Some(decode_labels(apn));
                        }
                    }
                }
            }
            if let Some(cause) = find_tlv(rest, 0x58) {
                msg.esm_cause = cause.first().copied();
            }
        },
        _ => {},
    }

    Ok(msg)
}

fn parse_5g(data: &[u8]) -> Result<NasMessage> {
    if data.len() < 3 {
        return Err(Error::truncated(3, data.len()));
    }
    let epd = data[0];
    let sht = data[1] & 0x0F;

    if epd == PD_5GMM && sht != SHT_PLAIN {
        if sht == SHT_INTEGRITY || sht == SHT_INTEGRITY_NEW_CTX {
            let inner = data
                .get(7..)
                .ok_or_else(|| Error::truncated(8, data.len()))?;
            if inner.is_empty() {
                return Err(Error::truncated(8, data.len()));
            }
            return parse_5g(inner);
        }
        let mut msg = NasMessage::empty(NasDomain::FiveG, epd, sht);
        msg.protected = true;
        return Ok(msg);
    }

    let mut msg =
        NasMessage::empty(NasDomain::FiveG, epd, if epd == PD_5GMM { sht } else { 0 });

    if epd == PD_5GMM {
        msg.message_type_raw = data[2];
        if msg.message_type_raw == MM5G_REGISTRATION_REQUEST {
            // Registration type octet, then 5GS mobile identity (LV-E,
            // two-byte length).
            if let Some(rest) = data.get(4..) {
                if rest.len() >= 2 {
                    let len = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
                    if let Some(identity) = rest.get(2..2 + len) {
                        apply_identity(&mut msg, decode_5g_identity(identity));
                    }
                }
            }
        }
    } else {
        // 5GSM: PDU session id, PTI, message type.
        msg.pdu_session_id = Some(data[1]);
        if data.len() >= 4 {
            msg.message_type_raw = data[3];
        }
        if let Some(dnn) = find_tlv(data.get(4..).unwrap_or_default(), 0x25) {
            msg.dnn = Some(decode_labels(dnn));
        }
        if let Some(snssai) = find_tlv(data.get(4..).unwrap_or_default(), 0x22) {
            msg.snssai = Some(hex::encode(snssai));
        }
    }

    Ok(msg)
}

/// Length-prefixed value at the head of `data`.
fn read_lv(data: &[u8]) -> Option<MobileIdentity> {
    let (&len, rest) = data.split_first()?;
    let value = rest.get(..usize::from(len))?;
    decode_mobile_identity(value)
}

/// Scans for a `tag, length, value` IE. NAS optional IEs are ordered but
/// a plain scan is robust against ones this decoder does not model.
fn find_tlv(data: &[u8], tag: u8) -> Option<&[u8]> {
    let mut cursor = data;
    while cursor.len() >= 2 {
        let t = cursor[0];
        let len = usize::from(cursor[1]);
        let value = cursor.get(2..2 + len)?;
        if t == tag {
            return Some(value);
        }
        cursor = &cursor[2 + len..];
    }
    None
}

/// TS 24.008 §10.5.1.4 mobile identity: type in the low 3 bits of the
/// first octet, odd/even in bit 3, digits in TBCD nibbles.
pub fn decode_mobile_identity(value: &[u8]) -> Option<MobileIdentity> {
    let (&first, rest) = value.split_first()?;
    let kind_bits = first & 0x07;
    let odd = first & 0x08 != 0;

    let kind = match kind_bits {
        1 => MobileIdentityKind::Imsi,
        2 => MobileIdentityKind::Imei,
        6 => MobileIdentityKind::Guti,
        _ => MobileIdentityKind::Unknown,
    };

    if kind == MobileIdentityKind::Guti {
        // GUTI carries PLMN + MME ids + M-TMSI rather than digits.
        return Some(MobileIdentity {
            kind,
            digits: hex::encode(rest),
        });
    }

    let mut digits = String::with_capacity(value.len() * 2);
    digits.push(char::from(b'0' + (first >> 4).min(9)));
    digits.push_str(&decode_tbcd(rest));

    // The even indicator means the final filler nibble was padding; the
    // TBCD decoder already stopped at it.
    let _ = odd;

    Some(MobileIdentity { kind, digits })
}

/// 5GS mobile identity (TS 24.501 §9.11.3.4): type in the low 3 bits.
fn decode_5g_identity(value: &[u8]) -> Option<MobileIdentity> {
    let (&first, rest) = value.split_first()?;
    let kind_bits = first & 0x07;

    match kind_bits {
        1 => {
            // SUCI: SUPI format in bits 4-6; IMSI-format SUCI carries
            // PLMN + routing indicator + scheme before the MSIN.
            if rest.len() < 7 {
                return None;
            }
            let plmn = crate::parsers::s1ap::decode_plmn(&rest[..3]);
            let msin = decode_tbcd(&rest[7..]);
            Some(MobileIdentity {
                kind: MobileIdentityKind::Suci,
                digits: format!("{plmn}{msin}"),
            })
        },
        2 => Some(MobileIdentity {
            kind: MobileIdentityKind::FiveGGuti,
            digits: hex::encode(rest),
        }),
        4 => Some(MobileIdentity {
            kind: MobileIdentityKind::FiveGSTmsi,
            digits: hex::encode(rest),
        }),
        _ => Some(MobileIdentity {
            kind: MobileIdentityKind::Unknown,
            digits: hex::encode(rest),
        }),
    }
}

fn apply_identity(msg: &mut NasMessage, identity: Option<MobileIdentity>) {
    let Some(identity) = identity else {
        return;
    };
    match identity.kind {
        MobileIdentityKind::Imsi => msg.imsi = Some(identity.digits),
        MobileIdentityKind::Imei => msg.imei = Some(identity.digits),
        MobileIdentityKind::Guti | MobileIdentityKind::FiveGGuti => {
            msg.guti = Some(identity.digits);
        },
        MobileIdentityKind::Suci => msg.suci = Some(identity.digits),
        MobileIdentityKind::FiveGSTmsi => msg.guti = Some(identity.digits),
        MobileIdentityKind::Unknown => {},
    }
}

fn decode_labels(value: &[u8]) -> String {
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
        String::from_utf8_lossy(value).into_owned()
    } else {
        labels.join(".")
    }
}
