// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use serde::Serialize;

use crate::models::{
    MessageType,
    error::{Error, Result},
};

pub const HEADER_LEN: usize = 20;

// AVP codes.
const AVP_USER_NAME: u32 = 1;
const AVP_CALLED_STATION_ID: u32 = 30;
const AVP_SESSION_ID: u32 = 263;
const AVP_ORIGIN_HOST: u32 = 264;
const AVP_DESTINATION_REALM: u32 = 283;
const AVP_DESTINATION_HOST: u32 = 293;
const AVP_ORIGIN_REALM: u32 = 296;
const AVP_SUBSCRIPTION_ID: u32 = 443;
const AVP_SUBSCRIPTION_ID_DATA: u32 = 444;
const AVP_SUBSCRIPTION_ID_TYPE: u32 = 450;

/// Subscription-Id-Type values.
pub const SUB_ID_E164: u32 = 0;
pub const SUB_ID_IMSI: u32 = 1;

/// Grouped-AVP recursion bound.
const MAX_GROUP_DEPTH: usize = 4;

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionId {
    pub id_type: u32,
    pub data: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiameterMessage {
    pub version: u8,
    pub message_length: u32,
    pub is_request: bool,
    pub is_proxiable: bool,
    pub is_error: bool,
    pub command_code: u32,
    pub application_id: u32,
    pub hop_by_hop_id: u32,
    pub end_to_end_id: u32,
    pub session_id: Option<String>,
    pub origin_host: Option<String>,
    pub origin_realm: Option<String>,
    pub destination_host: Option<String>,
    pub destination_realm: Option<String>,
    pub user_name: Option<String>,
    pub subscription_ids: Vec<SubscriptionId>,
    /// Called-Station-Id carries the APN on Gx/Gy.
    pub called_station_id: Option<String>,
    pub avp_count: usize,
}

impl DiameterMessage {
    pub fn message_type(&self) -> MessageType {
        if self.is_request {
            MessageType::DiameterRequest
        } else {
            MessageType::DiameterAnswer
        }
    }

    /// IMSI from Subscription-Id or a User-Name of the `imsi@realm` form.
    pub fn imsi(&self) -> Option<String> {
        for sub in &self.subscription_ids {
            if sub.id_type == SUB_ID_IMSI {
                return Some(sub.data.clone());
            }
        }
        self.user_name.as_deref().and_then(|name| {
            let digits = name.split('@').next().unwrap_or(name);
            (digits.len() >= 10 && digits.bytes().all(|b| b.is_ascii_digit()))
                .then(|| digits.to_string())
        })
    }

    pub fn msisdn(&self) -> Option<String> {
        self.subscription_ids
            .iter()
            .find(|s| s.id_type == SUB_ID_E164)
            .map(|s| s.data.clone())
    }
}

pub fn probe(data: &[u8]) -> bool {
    if data.len() < HEADER_LEN {
        return false;
    }
    let length = u32::from_be_bytes([0, data[1], data[2], data[3]]) as usize;
    data[0] == 1 && length >= HEADER_LEN
}

/// Number of bytes the message at the head of `data` occupies, if the
/// header is complete. Used for TCP stream framing.
pub fn message_length(data: &[u8]) -> Option<usize> {
    if data.len() < 4 || data[0] != 1 {
        return None;
    }
    let length = u32::from_be_bytes([0, data[1], data[2], data[3]]) as usize;
    (length >= HEADER_LEN).then_some(length)
}

pub fn parse(data: &[u8]) -> Result<DiameterMessage> {
    if data.len() < HEADER_LEN {
        return Err(Error::truncated(HEADER_LEN, data.len()));
    }

    let version = data[0];
    if version != 1 {
        return Err(Error::malformed("Diameter", format!("version {version}")));
    }

    let message_length = u32::from_be_bytes([0, data[1], data[2], data[3]]);
    if (message_length as usize) > data.len() {
        return Err(Error::truncated(message_length as usize, data.len()));
    }

    let flags = data[4];
    let mut msg = DiameterMessage {
        version,
        message_length,
        is_request: flags & 0x80 != 0,
        is_proxiable: flags & 0x40 != 0,
        is_error: flags & 0x20 != 0,
        command_code: u32::from_be_bytes([0, data[5], data[6], data[7]]),
        application_id: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        hop_by_hop_id: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
        end_to_end_id: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
        ..DiameterMessage::default()
    };

    parse_avps(
        &data[HEADER_LEN..message_length as usize],
        &mut msg,
        0,
    )?;

    Ok(msg)
}

fn parse_avps(mut data: &[u8], msg: &mut DiameterMessage, depth: usize) -> Result<()> {
    if depth > MAX_GROUP_DEPTH {
        return Err(Error::Sanity("diameter grouped AVP nesting too deep"));
    }

    while data.len() >= 8 {
        let code = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let flags = data[4];
        let avp_len = u32::from_be_bytes([0, data[5], data[6], data[7]]) as usize;
        if avp_len < 8 || avp_len > data.len() {
            return Err(Error::malformed(
                "Diameter",
                format!("AVP {code} length {avp_len} out of bounds"),
            ));
        }

        let vendor_specific = flags & 0x80 != 0;
        let value_at = if vendor_specific { 12 } else { 8 };
        if avp_len < value_at {
            return Err(Error::malformed("Diameter", "AVP too short for vendor id"));
        }
        let value = &data[value_at..avp_len];
        msg.avp_count += 1;

        match code {
            AVP_SESSION_ID => msg.session_id = Some(utf8(value)),
            AVP_ORIGIN_HOST => msg.origin_host = Some(utf8(value)),
            AVP_ORIGIN_REALM => msg.origin_realm = Some(utf8(value)),
            AVP_DESTINATION_HOST => msg.destination_host = Some(utf8(value)),
            AVP_DESTINATION_REALM => msg.destination_realm = Some(utf8(value)),
            AVP_USER_NAME => msg.user_name = Some(utf8(value)),
            AVP_CALLED_STATION_ID => msg.called_station_id = Some(utf8(value)),
            AVP_SUBSCRIPTION_ID => {
                if let Some(sub) = parse_subscription_id(value, depth + 1)? {
                    msg.subscription_ids.push(sub);
                }
            },
            _ => {},
        }

        // AVPs are padded to 4 bytes.
        let padded = avp_len.div_ceil(4) * 4;
        if padded >= data.len() {
            break;
        }
        data = &data[padded..];
    }

    Ok(())
}

fn parse_subscription_id(
    mut data: &[u8],
    depth: usize,
) -> Result<Option<SubscriptionId>> {
    if depth > MAX_GROUP_DEPTH {
        return Err(Error::Sanity("diameter grouped AVP nesting too deep"));
    }

    let mut id_type = None;
    let mut id_data = None;

    while data.len() >= 8 {
        let code = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let avp_len = u32::from_be_bytes([0, data[5], data[6], data[7]]) as usize;
        if avp_len < 8 || avp_len > data.len() {
            break;
        }
        let value = &data[8..avp_len];

        match code {
            AVP_SUBSCRIPTION_ID_TYPE if value.len() >= 4 => {
                id_type = Some(u32::from_be_bytes([
                    value[0], value[1], value[2], value[3],
                ]));
            },
            AVP_SUBSCRIPTION_ID_DATA => id_data = Some(utf8(value)),
            _ => {},
        }

        let padded = avp_len.div_ceil(4) * 4;
        if padded >= data.len() {
            break;
        }
        data = &data[padded..];
    }

    Ok(match (id_type, id_data) {
        (Some(id_type), Some(data)) => Some(SubscriptionId { id_type, data }),
        _ => None,
    })
}

fn utf8(value: &[u8]) -> String {
    String::from_utf8_lossy(value).into_owned()
}
