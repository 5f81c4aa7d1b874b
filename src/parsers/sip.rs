// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::BTreeMap;

use serde::Serialize;

use crate::models::{
    MessageType,
    error::{Error, Result},
};

/// A parsed identity from From/To/P-Asserted-Identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SipIdentity {
    pub username: String,
    pub domain: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SdpMedia {
    pub media_type: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SdpInfo {
    pub session_name: Option<String>,
    pub connection_address: Option<String>,
    pub media: Vec<SdpMedia>,
    pub rtp_port: Option<u16>,
    pub rtcp_port: Option<u16>,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SipMessage {
    pub is_request: bool,
    pub method: Option<String>,
    pub request_uri: Option<String>,
    pub status_code: Option<u16>,
    pub reason_phrase: Option<String>,
    pub call_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub via: Option<String>,
    pub contact: Option<String>,
    pub cseq: Option<String>,
    pub content_type: Option<String>,
    pub p_asserted_identity: Vec<SipIdentity>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub sdp: Option<SdpInfo>,
}

impl SipMessage {
    pub fn message_type(&self) -> MessageType {
        if self.is_request {
            match self.method.as_deref() {
                Some("INVITE") => MessageType::SipInvite,
                Some("ACK") => MessageType::SipAck,
                Some("BYE") => MessageType::SipBye,
                Some("CANCEL") => MessageType::SipCancel,
                Some("REGISTER") => MessageType::SipRegister,
                Some("OPTIONS") => MessageType::SipOptions,
                Some("UPDATE") => MessageType::SipUpdate,
                Some("PRACK") => MessageType::SipPrack,
                _ => MessageType::Unknown,
            }
        } else {
            match self.status_code {
                Some(100) => MessageType::SipTrying,
                Some(180) => MessageType::SipRinging,
                Some(200) => MessageType::SipOk,
                Some(_) => MessageType::SipStatus,
                None => MessageType::Unknown,
            }
        }
    }

    /// All identities harvested from From, To, and P-Asserted-Identity,
    /// in that order.
    pub fn identities(&self) -> Vec<SipIdentity> {
        let mut out = Vec::new();
        for header in [self.from.as_deref(), self.to.as_deref()] {
            if let Some(id) = header.and_then(parse_identity) {
                out.push(id);
            }
        }
        out.extend(self.p_asserted_identity.iter().cloned());
        out
    }
}

const METHODS: &[&str] = &[
    "INVITE", "ACK", "BYE", "CANCEL", "OPTIONS", "REGISTER", "UPDATE", "PRACK",
    "SUBSCRIBE", "NOTIFY", "MESSAGE", "INFO", "REFER",
];

/// Quick identification without a full parse.
pub fn probe(data: &[u8]) -> bool {
    if data.len() < 8 {
        return false;
    }
    let head = String::from_utf8_lossy(&data[..data.len().min(200)]);
    if head.starts_with("SIP/2.0 ") {
        return true;
    }
    head.contains("SIP/2.0")
        && METHODS
            .iter()
            .any(|m| head.starts_with(m) && head.as_bytes().get(m.len()) == Some(&b' '))
}

/// Parses one SIP message assumed to be complete (UDP datagram).
pub fn parse(data: &[u8]) -> Result<SipMessage> {
    match parse_internal(data, false)? {
        Some((msg, _)) => Ok(msg),
        None => Err(Error::truncated(data.len() + 1, data.len())),
    }
}

/// Parses from a TCP stream buffer. Returns the message and the number of
/// bytes it consumed, or `None` when more bytes are needed.
pub fn parse_stream(data: &[u8]) -> Result<Option<(SipMessage, usize)>> {
    parse_internal(data, true)
}

fn parse_internal(data: &[u8], streaming: bool) -> Result<Option<(SipMessage, usize)>> {
    let text = std::str::from_utf8(data)
        .map_err(|_| Error::malformed("SIP", "message is not valid UTF-8"))?;

    let Some(header_end) = find_header_end(text) else {
        if streaming {
            return Ok(None);
        }
        return Err(Error::malformed("SIP", "missing header terminator"));
    };

    let header_text = &text[..header_end.start];
    let mut lines = unfold_lines(header_text);
    if lines.is_empty() {
        return Err(Error::malformed("SIP", "empty message"));
    }

    let first_line = lines.remove(0);
    let mut msg = SipMessage::default();

    if let Some(rest) = first_line.strip_prefix("SIP/2.0 ") {
        msg.is_request = false;
        let mut parts = rest.splitn(2, ' ');
        let code = parts
            .next()
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| Error::malformed("SIP", "bad status line"))?;
        msg.status_code = Some(code);
        msg.reason_phrase = parts.next().map(|p| p.trim().to_string());
    } else {
        let mut parts = first_line.split_whitespace();
        let method = parts.next().unwrap_or_default();
        let uri = parts.next().unwrap_or_default();
        let version = parts.next().unwrap_or_default();
        if version != "SIP/2.0" || method.is_empty() || uri.is_empty() {
            return Err(Error::malformed("SIP", "bad request line"));
        }
        msg.is_request = true;
        msg.method = Some(method.to_string());
        msg.request_uri = Some(uri.to_string());
    }

    for line in &lines {
        let Some((raw_name, raw_value)) = line.split_once(':') else {
            continue;
        };
        let name = canonical_header(raw_name.trim());
        let value = raw_value.trim().to_string();

        match name.as_str() {
            "Call-ID" => msg.call_id = Some(value.clone()),
            "From" => msg.from = Some(value.clone()),
            "To" => msg.to = Some(value.clone()),
            "Via" => msg.via = Some(value.clone()),
            "Contact" => msg.contact = Some(value.clone()),
            "CSeq" => msg.cseq = Some(value.clone()),
            "Content-Type" => msg.content_type = Some(value.clone()),
            "P-Asserted-Identity" => {
                for part in value.split(',') {
                    if let Some(id) = parse_identity(part) {
                        msg.p_asserted_identity.push(id);
                    }
                }
            },
            _ => {},
        }
        msg.headers.insert(name, value);
    }

    // Body handling: trust Content-Length when present.
    let content_length = msg
        .headers
        .get("Content-Length")
        .and_then(|v| v.parse::<usize>().ok());
    let body_start = header_end.end;
    let available = data.len() - body_start;

    let body_len = match content_length {
        Some(cl) if streaming && available < cl => return Ok(None),
        Some(cl) if available < cl => {
            return Err(Error::truncated(body_start + cl, data.len()));
        },
        Some(cl) => cl,
        None => available,
    };

    if body_len > 0 {
        let body = String::from_utf8_lossy(&data[body_start..body_start + body_len])
            .into_owned();
        if msg
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.contains("application/sdp"))
        {
            msg.sdp = Some(parse_sdp(&body));
        }
        msg.body = Some(body);
    }

    Ok(Some((msg, body_start + body_len)))
}

struct HeaderEnd {
    /// Offset of the blank line.
    start: usize,
    /// Offset just past it (body start).
    end: usize,
}

fn find_header_end(text: &str) -> Option<HeaderEnd> {
    if let Some(at) = text.find("\r\n\r\n") {
        return Some(HeaderEnd {
            start: at,
            end: at + 4,
        });
    }
    text.find("\n\n").map(|at| HeaderEnd {
        start: at,
        end: at + 2,
    })
}

/// Splits header lines, joining folded continuations (leading SP/HT).
fn unfold_lines(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in text.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(prev) = out.last_mut() {
                prev.push(' ');
                prev.push_str(line.trim_start());
                continue;
            }
        }
        out.push(line.to_string());
    }
    out
}

/// Expands compact header forms to their canonical names.
fn canonical_header(name: &str) -> String {
    match name {
        "i" | "I" => "Call-ID".to_string(),
        "f" | "F" => "From".to_string(),
        "t" | "T" => "To".to_string(),
        "v" | "V" => "Via".to_string(),
        "m" | "M" => "Contact".to_string(),
        "c" | "C" => "Content-Type".to_string(),
        "l" | "L" => "Content-Length".to_string(),
        other => {
            // Normalize case variants of well-known names.
            for known in [
                "Call-ID",
                "From",
                "To",
                "Via",
                "Contact",
                "CSeq",
                "Content-Type",
                "Content-Length",
                "P-Asserted-Identity",
            ] {
                if other.eq_ignore_ascii_case(known) {
                    return known.to_string();
                }
            }
            other.to_string()
        },
    }
}

/// Pulls `user@domain` out of a `"Display" <sip:user@domain;x>` or
/// `tel:+number` style header value.
fn parse_identity(value: &str) -> Option<SipIdentity> {
    let value = value.trim();

    let uri = match (value.find('<'), value.find('>')) {
        (Some(open), Some(close)) if close > open => &value[open + 1..close],
        _ => value,
    };

    if let Some(rest) = uri.strip_prefix("tel:") {
        let number = rest.split(';').next().unwrap_or(rest);
        if number.is_empty() {
            return None;
        }
        return Some(SipIdentity {
            username: number.to_string(),
            domain: String::new(),
        });
    }

    let rest = uri
        .strip_prefix("sip:")
        .or_else(|| uri.strip_prefix("sips:"))?;
    let rest = rest.split(';').next().unwrap_or(rest);
    let (user, domain) = rest.split_once('@')?;
    if user.is_empty() {
        return None;
    }
    Some(SipIdentity {
        username: user.to_string(),
        domain: domain.to_string(),
    })
}

fn parse_sdp(body: &str) -> SdpInfo {
    let mut sdp = SdpInfo::default();

    for raw in body.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.len() < 2 || line.as_bytes()[1] != b'=' {
            continue;
        }
        let value = &line[2..];

        match line.as_bytes()[0] {
            b's' => sdp.session_name = Some(value.to_string()),
            b'c' => {
                // c=IN IP4 192.0.2.1 / c=IN IP6 2001:db8::1
                if let Some(addr) = value.rsplit(' ').next() {
                    sdp.connection_address = Some(addr.to_string());
                }
            },
            b'm' => {
                // m=audio 49170 RTP/AVP 0
                let mut parts = value.split_whitespace();
                let media_type = parts.next().unwrap_or_default().to_string();
                if let Some(port) = parts.next().and_then(|p| p.parse::<u16>().ok()) {
                    if media_type == "audio" || media_type == "video" {
                        sdp.rtp_port = Some(port);
                        sdp.rtcp_port = Some(port.saturating_add(1));
                    }
                    sdp.media.push(SdpMedia { media_type, port });
                }
            },
            b'a' => match value.split_once(':') {
                Some((k, v)) => {
                    sdp.attributes.insert(k.to_string(), v.to_string());
                },
                None => {
                    sdp.attributes.insert(value.to_string(), String::new());
                },
            },
            _ => {},
        }
    }

    sdp
}
