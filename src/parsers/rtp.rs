// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use chrono::{DateTime, Utc};
use serde::Serialize;
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16, U32,
};

use crate::models::error::{Error, Result};

/// Fixed 12-byte RTP header (RFC 3550 §5.1).
#[repr(C)]
#[derive(Debug, Default, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RtpFixedHeader {
    /// V(2) P(1) X(1) CC(4)
    pub vpxcc: u8,
    /// M(1) PT(7)
    pub mpt: u8,
    pub sequence_number: U16<BigEndian>,
    pub timestamp: U32<BigEndian>,
    pub ssrc: U32<BigEndian>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc_list: Vec<u32>,
    pub header_length: usize,
    pub payload_length: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RtcpHeader {
    pub version: u8,
    pub padding: bool,
    pub report_count: u8,
    pub packet_type: u8,
    pub length_words: u16,
    pub ssrc: u32,
}

/// RTP payload types stay at or below 95; RTCP packet types occupy
/// 200..=204, which would alias RTP PT 72..76 with the marker bit set.
pub fn probe_rtp(data: &[u8]) -> bool {
    if data.len() < 12 {
        return false;
    }
    if (200..=204).contains(&data[1]) {
        return false;
    }
    (data[0] >> 6) == 2 && (data[1] & 0x7F) <= 95
}

pub fn probe_rtcp(data: &[u8]) -> bool {
    if data.len() < 8 {
        return false;
    }
    (data[0] >> 6) == 2 && (200..=204).contains(&data[1])
}

pub fn parse_rtp(data: &[u8]) -> Result<RtpHeader> {
    let (fixed, _rest) = RtpFixedHeader::ref_from_prefix(data)
        .map_err(|_| Error::truncated(12, data.len()))?;

    let version = fixed.vpxcc >> 6;
    if version != 2 {
        return Err(Error::malformed("RTP", format!("version {version}")));
    }

    let csrc_count = fixed.vpxcc & 0x0F;
    let mut header_length = 12 + usize::from(csrc_count) * 4;
    if data.len() < header_length {
        return Err(Error::truncated(header_length, data.len()));
    }

    let mut csrc_list = Vec::with_capacity(usize::from(csrc_count));
    for i in 0..usize::from(csrc_count) {
        let at = 12 + i * 4;
        csrc_list.push(u32::from_be_bytes([
            data[at],
            data[at + 1],
            data[at + 2],
            data[at + 3],
        ]));
    }

    let extension = fixed.vpxcc & 0x10 != 0;
    if extension {
        if data.len() < header_length + 4 {
            return Err(Error::truncated(header_length + 4, data.len()));
        }
        let ext_words = u16::from_be_bytes([
            data[header_length + 2],
            data[header_length + 3],
        ]);
        header_length += 4 + usize::from(ext_words) * 4;
        if data.len() < header_length {
            return Err(Error::truncated(header_length, data.len()));
        }
    }

    Ok(RtpHeader {
        version,
        padding: fixed.vpxcc & 0x20 != 0,
        extension,
        csrc_count,
        marker: fixed.mpt & 0x80 != 0,
        payload_type: fixed.mpt & 0x7F,
        sequence_number: fixed.sequence_number.get(),
        timestamp: fixed.timestamp.get(),
        ssrc: fixed.ssrc.get(),
        csrc_list,
        header_length,
        payload_length: data.len().saturating_sub(header_length),
    })
}

pub fn parse_rtcp(data: &[u8]) -> Result<RtcpHeader> {
    if data.len() < 8 {
        return Err(Error::truncated(8, data.len()));
    }

    let version = data[0] >> 6;
    if version != 2 {
        return Err(Error::malformed("RTCP", format!("version {version}")));
    }
    let packet_type = data[1];
    if !(200..=204).contains(&packet_type) {
        return Err(Error::malformed(
            "RTCP",
            format!("packet type {packet_type}"),
        ));
    }

    Ok(RtcpHeader {
        version,
        padding: data[0] & 0x20 != 0,
        report_count: data[0] & 0x1F,
        packet_type,
        length_words: u16::from_be_bytes([data[2], data[3]]),
        ssrc: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
    })
}

/// Per-SSRC receiver statistics: loss from extended sequence numbers,
/// interarrival jitter per RFC 3550 §6.4.1 with an 8 kHz media clock.
#[derive(Debug, Clone)]
pub struct RtpStreamTracker {
    ssrc: u32,
    packets_received: u64,
    base_seq: u32,
    max_seq: u16,
    cycles: u32,
    last_timestamp: u32,
    last_arrival: DateTime<Utc>,
    /// Jitter estimate in timestamp-clock microseconds.
    jitter_us: f64,
    initialized: bool,
}

/// 8 kHz audio clock: one timestamp tick is 125 us.
const TICK_US: i64 = 125;

impl RtpStreamTracker {
    pub fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            packets_received: 0,
            base_seq: 0,
            max_seq: 0,
            cycles: 0,
            last_timestamp: 0,
            last_arrival: DateTime::<Utc>::MIN_UTC,
            jitter_us: 0.0,
            initialized: false,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    pub fn packets_expected(&self) -> u64 {
        if !self.initialized {
            return 0;
        }
        let extended_max = u64::from(self.cycles) << 16 | u64::from(self.max_seq);
        extended_max.saturating_sub(u64::from(self.base_seq)) + 1
    }

    pub fn process_packet(&mut self, header: &RtpHeader, arrival: DateTime<Utc>) {
        let seq = header.sequence_number;

        if !self.initialized {
            self.initialized = true;
            self.base_seq = u32::from(seq);
            self.max_seq = seq;
            self.last_timestamp = header.timestamp;
            self.last_arrival = arrival;
            self.packets_received = 1;
            return;
        }

        self.packets_received += 1;

        // Sequence wrap: a small new number right after a large max means
        // the 16-bit space rolled over.
        if seq < self.max_seq && self.max_seq - seq > 0x8000 {
            self.cycles += 1;
            self.max_seq = seq;
        } else if seq > self.max_seq {
            self.max_seq = seq;
        }

        self.update_jitter(header.timestamp, arrival);

        self.last_timestamp = header.timestamp;
        self.last_arrival = arrival;
    }

    /// Fraction of expected packets not received, in [0, 1].
    pub fn packet_loss(&self) -> f64 {
        let expected = self.packets_expected();
        if expected == 0 {
            return 0.0;
        }
        let lost = expected.saturating_sub(self.packets_received);
        lost as f64 / expected as f64
    }

    pub fn jitter_ms(&self) -> f64 {
        self.jitter_us / 1000.0
    }

    fn update_jitter(&mut self, timestamp: u32, arrival: DateTime<Utc>) {
        let arrival_diff_us = (arrival - self.last_arrival)
            .num_microseconds()
            .unwrap_or(i64::MAX);
        let ts_diff = i64::from(timestamp) - i64::from(self.last_timestamp);
        let ts_diff_us = ts_diff * TICK_US;

        let d = (arrival_diff_us - ts_diff_us).abs();
        self.jitter_us += (d as f64 - self.jitter_us) / 16.0;
    }
}
