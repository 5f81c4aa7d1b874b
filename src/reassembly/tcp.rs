// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use tracing::trace;

use crate::models::FiveTuple;

/// Out-of-order buffer bound per stream.
const MAX_BUFFERED_SEGMENTS: usize = 100;

/// One TCP segment as seen by the reassembler.
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    pub seq: u32,
    pub payload: &'a [u8],
    pub syn: bool,
    pub fin: bool,
}

#[derive(Debug, Default)]
struct TcpStream {
    next_seq: u32,
    syn_seen: bool,
    /// Set once a baseline sequence number exists. Separate from
    /// `syn_seen` so a mid-stream pickup at seq 0 still counts.
    synced: bool,
    fin_seen: bool,
    out_of_order: BTreeMap<u32, Vec<u8>>,
    last_update: DateTime<Utc>,
}

/// Per-flow byte-stream reassembly.
///
/// Mid-stream pickup is unconditional: without a SYN, the first observed
/// sequence number becomes the baseline. Retransmit storms arriving
/// before the true stream start can therefore mis-seed the baseline; the
/// stream re-syncs once the table entry times out.
pub struct TcpReassembler {
    streams: HashMap<FiveTuple, TcpStream>,
    timeout: Duration,
    sanity_drops: u64,
}

impl TcpReassembler {
    pub fn new(timeout_sec: u32) -> Self {
        Self {
            streams: HashMap::new(),
            timeout: Duration::seconds(i64::from(timeout_sec)),
            sanity_drops: 0,
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Segments dropped against the out-of-order bound.
    pub fn sanity_drops(&self) -> u64 {
        self.sanity_drops
    }

    pub fn cleanup(&mut self, now: DateTime<Utc>) {
        let timeout = self.timeout;
        self.streams
            .retain(|_, s| now - s.last_update <= timeout);
    }

    /// Whether the stream saw a FIN and has nothing buffered, i.e. it can
    /// be finalized by the caller.
    pub fn is_drained(&self, flow: &FiveTuple) -> bool {
        self.streams
            .get(flow)
            .is_some_and(|s| s.fin_seen && s.out_of_order.is_empty())
    }

    pub fn remove(&mut self, flow: &FiveTuple) {
        self.streams.remove(flow);
    }

    /// Feeds one segment; returns the bytes that became contiguous.
    pub fn process_segment(
        &mut self,
        flow: &FiveTuple,
        segment: TcpSegment<'_>,
        now: DateTime<Utc>,
    ) -> Vec<u8> {
        let stream = self.streams.entry(flow.clone()).or_default();
        stream.last_update = now;

        if segment.syn {
            stream.syn_seen = true;
            stream.synced = true;
            stream.next_seq = segment.seq.wrapping_add(1);
            stream.out_of_order.clear();
        } else if !stream.synced {
            // Mid-stream pickup: adopt the first observed seq.
            stream.next_seq = segment.seq;
            stream.synced = true;
        }

        // SYN consumes one sequence number; payload starts after it.
        let effective_seq = if segment.syn {
            segment.seq.wrapping_add(1)
        } else {
            segment.seq
        };

        if segment.payload.is_empty() {
            if segment.fin {
                stream.fin_seen = true;
                if effective_seq == stream.next_seq {
                    stream.next_seq = stream.next_seq.wrapping_add(1);
                }
            }
            return Vec::new();
        }

        let mut emitted = Vec::new();
        let diff = effective_seq.wrapping_sub(stream.next_seq) as i32;

        if diff == 0 {
            emitted.extend_from_slice(segment.payload);
            stream.next_seq =
                stream.next_seq.wrapping_add(segment.payload.len() as u32);

            if segment.fin {
                stream.fin_seen = true;
                stream.next_seq = stream.next_seq.wrapping_add(1);
            }

            // Drain whatever became contiguous.
            loop {
                let Some((&buffered_seq, _)) = stream.out_of_order.first_key_value()
                else {
                    break;
                };
                let buf_diff = buffered_seq.wrapping_sub(stream.next_seq) as i32;
                if buf_diff == 0 {
                    let data = stream
                        .out_of_order
                        .remove(&buffered_seq)
                        .unwrap_or_default();
                    stream.next_seq = stream.next_seq.wrapping_add(data.len() as u32);
                    emitted.extend_from_slice(&data);
                } else if buf_diff < 0 {
                    // Already delivered; stale buffer entry.
                    stream.out_of_order.remove(&buffered_seq);
                } else {
                    break;
                }
            }
        } else if diff > 0 {
            if stream.out_of_order.len() < MAX_BUFFERED_SEGMENTS {
                stream
                    .out_of_order
                    .insert(effective_seq, segment.payload.to_vec());
            } else {
                self.sanity_drops += 1;
                trace!("tcp {flow}: out-of-order buffer full, dropping segment");
            }
            if segment.fin {
                stream.fin_seen = true;
            }
        } else {
            // Past or duplicate data.
            trace!("tcp {flow}: duplicate segment seq={}", segment.seq);
        }

        emitted
    }
}
