// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::{BTreeMap, HashMap};

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace};

use crate::models::{
    FiveTuple,
    error::{Error, Result},
};
use crate::parsers::hpack::HpackDecoder;

/// Client connection preface (RFC 7540 §3.5).
pub const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_HEADER_LEN: usize = 9;
/// Sanity cap on a single frame payload.
const MAX_FRAME_LEN: usize = 1 << 24;
/// Sanity cap on accumulated body bytes per stream.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    Goaway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl From<u8> for FrameType {
    fn from(v: u8) -> Self {
        match v {
            0x0 => FrameType::Data,
            0x1 => FrameType::Headers,
            0x2 => FrameType::Priority,
            0x3 => FrameType::RstStream,
            0x4 => FrameType::Settings,
            0x5 => FrameType::PushPromise,
            0x6 => FrameType::Ping,
            0x7 => FrameType::Goaway,
            0x8 => FrameType::WindowUpdate,
            0x9 => FrameType::Continuation,
            other => FrameType::Unknown(other),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        const END_STREAM = 0x01;
        const END_HEADERS = 0x04;
        const PADDED = 0x08;
        const PRIORITY = 0x20;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub length: usize,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub stream_id: u32,
}

/// Parses one 9-byte frame header.
pub fn parse_frame_header(data: &[u8]) -> Result<FrameHeader> {
    if data.len() < FRAME_HEADER_LEN {
        return Err(Error::truncated(FRAME_HEADER_LEN, data.len()));
    }
    let length = usize::from(data[0]) << 16 | usize::from(data[1]) << 8
        | usize::from(data[2]);
    if length > MAX_FRAME_LEN {
        return Err(Error::Sanity("http2 frame larger than 16 MiB"));
    }
    Ok(FrameHeader {
        length,
        frame_type: FrameType::from(data[3]),
        flags: FrameFlags::from_bits_truncate(data[4]),
        stream_id: u32::from_be_bytes([data[5], data[6], data[7], data[8]])
            & 0x7FFF_FFFF,
    })
}

pub fn probe(data: &[u8]) -> bool {
    if data.len() >= PREFACE.len() && &data[..PREFACE.len()] == PREFACE {
        return true;
    }
    // A SETTINGS frame on stream 0 is the first thing either side sends.
    if data.len() >= FRAME_HEADER_LEN {
        if let Ok(header) = parse_frame_header(data) {
            return header.frame_type == FrameType::Settings && header.stream_id == 0;
        }
    }
    false
}

/// A stream that finished both directions (or was reset with data).
#[derive(Debug, Clone, Serialize)]
pub struct CompletedStream {
    pub stream_id: u32,
    pub method: Option<String>,
    pub scheme: Option<String>,
    pub authority: Option<String>,
    pub path: Option<String>,
    pub status: Option<u16>,
    pub request_headers: BTreeMap<String, String>,
    pub response_headers: BTreeMap<String, String>,
    #[serde(skip)]
    pub request_body: Vec<u8>,
    #[serde(skip)]
    pub response_body: Vec<u8>,
    pub request_at: Option<DateTime<Utc>>,
    pub response_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct StreamState {
    method: Option<String>,
    scheme: Option<String>,
    authority: Option<String>,
    path: Option<String>,
    status: Option<u16>,
    request_headers: BTreeMap<String, String>,
    response_headers: BTreeMap<String, String>,
    request_body: Vec<u8>,
    response_body: Vec<u8>,
    request_at: Option<DateTime<Utc>>,
    response_at: Option<DateTime<Utc>>,
    request_end: bool,
    response_end: bool,
    emitted: bool,
}

impl StreamState {
    fn into_completed(self, stream_id: u32) -> CompletedStream {
        CompletedStream {
            stream_id,
            method: self.method,
            scheme: self.scheme,
            authority: self.authority,
            path: self.path,
            status: self.status,
            request_headers: self.request_headers,
            response_headers: self.response_headers,
            request_body: self.request_body,
            response_body: self.response_body,
            request_at: self.request_at,
            response_at: self.response_at,
        }
    }
}

#[derive(Debug, Default)]
struct DirectionState {
    /// Unframed byte backlog (frames may span TCP segments).
    buffer: Vec<u8>,
    /// HEADERS + CONTINUATION accumulation until END_HEADERS.
    continuation: Option<(u32, Vec<u8>, FrameFlags)>,
    preface_consumed: bool,
}

/// One HTTP/2 connection, both directions.
///
/// Each sending direction owns its HPACK decoder; the dynamic table is
/// never shared across connections or directions.
pub struct Http2Connection {
    /// The side observed to send the preface (or the first bytes).
    initiator: Option<FiveTuple>,
    forward: DirectionState,
    backward: DirectionState,
    decoder_forward: HpackDecoder,
    decoder_backward: HpackDecoder,
    streams: HashMap<u32, StreamState>,
    settings: BTreeMap<u16, u32>,
    goaway_seen: bool,
}

impl Default for Http2Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Http2Connection {
    pub fn new() -> Self {
        Self {
            initiator: None,
            forward: DirectionState::default(),
            backward: DirectionState::default(),
            decoder_forward: HpackDecoder::new(),
            decoder_backward: HpackDecoder::new(),
            streams: HashMap::new(),
            settings: BTreeMap::new(),
            goaway_seen: false,
        }
    }

    pub fn settings(&self) -> &BTreeMap<u16, u32> {
        &self.settings
    }

    pub fn goaway_seen(&self) -> bool {
        self.goaway_seen
    }

    /// Feeds reassembled TCP bytes from one direction; returns streams
    /// completed by them.
    pub fn feed(
        &mut self,
        from: &FiveTuple,
        data: &[u8],
        ts: DateTime<Utc>,
    ) -> Result<Vec<CompletedStream>> {
        if self.initiator.is_none() {
            // Without a preface in the capture the first sender is taken
            // as the client.
            self.initiator = Some(from.clone());
        }
        let from_initiator = self
            .initiator
            .as_ref()
            .is_some_and(|init| init == from);

        let direction = if from_initiator {
            &mut self.forward
        } else {
            &mut self.backward
        };
        direction.buffer.extend_from_slice(data);

        if !direction.preface_consumed
            && direction.buffer.len() >= PREFACE.len()
            && &direction.buffer[..PREFACE.len()] == PREFACE
        {
            direction.buffer.drain(..PREFACE.len());
            direction.preface_consumed = true;
            self.initiator = Some(from.clone());
            trace!("http2 preface consumed");
        }

        let mut completed = Vec::new();

        loop {
            let direction = if from_initiator {
                &mut self.forward
            } else {
                &mut self.backward
            };
            if direction.buffer.len() < FRAME_HEADER_LEN {
                break;
            }
            let header = parse_frame_header(&direction.buffer)?;
            if direction.buffer.len() < FRAME_HEADER_LEN + header.length {
                break;
            }
            let payload: Vec<u8> = direction
                .buffer
                .drain(..FRAME_HEADER_LEN + header.length)
                .skip(FRAME_HEADER_LEN)
                .collect();

            self.handle_frame(from_initiator, header, &payload, ts, &mut completed)?;
        }

        Ok(completed)
    }

    fn handle_frame(
        &mut self,
        from_initiator: bool,
        header: FrameHeader,
        payload: &[u8],
        ts: DateTime<Utc>,
        completed: &mut Vec<CompletedStream>,
    ) -> Result<()> {
        match header.frame_type {
            FrameType::Data => self.handle_data(from_initiator, header, payload, completed),
            FrameType::Headers => {
                let fragment = strip_padding_and_priority(header.flags, payload)?;
                self.accumulate_headers(
                    from_initiator,
                    header.stream_id,
                    fragment,
                    header.flags,
                    ts,
                    completed,
                )
            },
            FrameType::Continuation => {
                let direction = self.direction_mut(from_initiator);
                let Some((stream_id, mut block, flags)) = direction.continuation.take()
                else {
                    return Err(Error::malformed(
                        "HTTP2",
                        "CONTINUATION without open header block",
                    ));
                };
                if stream_id != header.stream_id {
                    return Err(Error::malformed(
                        "HTTP2",
                        "CONTINUATION on a different stream",
                    ));
                }
                block.extend_from_slice(payload);
                self.accumulate_headers(
                    from_initiator,
                    stream_id,
                    block,
                    flags | (header.flags & FrameFlags::END_HEADERS),
                    ts,
                    completed,
                )
            },
            FrameType::Settings => {
                for chunk in payload.chunks_exact(6) {
                    let id = u16::from_be_bytes([chunk[0], chunk[1]]);
                    let value =
                        u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
                    self.settings.insert(id, value);
                    // SETTINGS_HEADER_TABLE_SIZE bounds the peer decoder.
                    if id == 0x1 {
                        self.decoder_for(!from_initiator)
                            .set_max_dynamic_table_size(value as usize);
                    }
                }
                Ok(())
            },
            FrameType::RstStream => {
                if let Some(state) = self.streams.remove(&header.stream_id) {
                    if !state.emitted
                        && (state.method.is_some() || state.status.is_some())
                    {
                        completed.push(state.into_completed(header.stream_id));
                    }
                }
                Ok(())
            },
            FrameType::Goaway => {
                self.goaway_seen = true;
                Ok(())
            },
            FrameType::Priority
            | FrameType::PushPromise
            | FrameType::Ping
            | FrameType::WindowUpdate => Ok(()),
            FrameType::Unknown(t) => {
                debug!("http2: ignoring unknown frame type 0x{t:02x}");
                Ok(())
            },
        }
    }

    fn handle_data(
        &mut self,
        from_initiator: bool,
        header: FrameHeader,
        payload: &[u8],
        completed: &mut Vec<CompletedStream>,
    ) -> Result<()> {
        let data = strip_padding(header.flags, payload)?;
        let state = self.streams.entry(header.stream_id).or_default();

        let body = if from_initiator {
            &mut state.request_body
        } else {
            &mut state.response_body
        };
        if body.len() + data.len() <= MAX_BODY_BYTES {
            body.extend_from_slice(&data);
        }

        if header.flags.contains(FrameFlags::END_STREAM) {
            if from_initiator {
                state.request_end = true;
            } else {
                state.response_end = true;
            }
            self.maybe_complete(header.stream_id, completed);
        }
        Ok(())
    }

    fn accumulate_headers(
        &mut self,
        from_initiator: bool,
        stream_id: u32,
        block: Vec<u8>,
        flags: FrameFlags,
        ts: DateTime<Utc>,
        completed: &mut Vec<CompletedStream>,
    ) -> Result<()> {
        if !flags.contains(FrameFlags::END_HEADERS) {
            self.direction_mut(from_initiator).continuation =
                Some((stream_id, block, flags));
            return Ok(());
        }

        let headers = self.decoder_for(from_initiator).decode(&block)?;

        let state = self.streams.entry(stream_id).or_default();
        for header in headers {
            match header.name.as_str() {
                ":method" => state.method = Some(header.value),
                ":scheme" => state.scheme = Some(header.value),
                ":authority" => state.authority = Some(header.value),
                ":path" => state.path = Some(header.value),
                ":status" => state.status = header.value.parse::<u16>().ok(),
                _ => {
                    let map = if from_initiator {
                        &mut state.request_headers
                    } else {
                        &mut state.response_headers
                    };
                    map.insert(header.name, header.value);
                },
            }
        }

        if from_initiator {
            state.request_at.get_or_insert(ts);
        } else {
            state.response_at.get_or_insert(ts);
        }

        if flags.contains(FrameFlags::END_STREAM) {
            if from_initiator {
                state.request_end = true;
            } else {
                state.response_end = true;
            }
        }
        self.maybe_complete(stream_id, completed);
        Ok(())
    }

    fn maybe_complete(&mut self, stream_id: u32, completed: &mut Vec<CompletedStream>) {
        let done = self
            .streams
            .get(&stream_id)
            .is_some_and(|s| s.request_end && s.response_end && !s.emitted);
        if done && let Some(state) = self.streams.remove(&stream_id) {
            completed.push(state.into_completed(stream_id));
        }
    }

    fn direction_mut(&mut self, from_initiator: bool) -> &mut DirectionState {
        if from_initiator {
            &mut self.forward
        } else {
            &mut self.backward
        }
    }

    fn decoder_for(&mut self, from_initiator: bool) -> &mut HpackDecoder {
        if from_initiator {
            &mut self.decoder_forward
        } else {
            &mut self.decoder_backward
        }
    }
}

fn strip_padding(flags: FrameFlags, payload: &[u8]) -> Result<Vec<u8>> {
    if !flags.contains(FrameFlags::PADDED) {
        return Ok(payload.to_vec());
    }
    let pad = usize::from(
        *payload
            .first()
            .ok_or_else(|| Error::truncated(1, 0))?,
    );
    let body = &payload[1..];
    if pad > body.len() {
        return Err(Error::malformed("HTTP2", "padding exceeds frame"));
    }
    Ok(body[..body.len() - pad].to_vec())
}

fn strip_padding_and_priority(flags: FrameFlags, payload: &[u8]) -> Result<Vec<u8>> {
    let mut body = strip_padding(flags, payload)?;
    if flags.contains(FrameFlags::PRIORITY) {
        if body.len() < 5 {
            return Err(Error::truncated(5, body.len()));
        }
        body.drain(..5);
    }
    Ok(body)
}
