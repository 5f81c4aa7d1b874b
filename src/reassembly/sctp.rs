// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashMap;

use bitflags::bitflags;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16, U32,
};

use crate::models::{
    FiveTuple,
    error::{Error, Result},
};

pub const PPID_S1AP: u32 = 18;
pub const PPID_X2AP: u32 = 27;
pub const PPID_DIAMETER: u32 = 46;
pub const PPID_NGAP: u32 = 60;

const CHUNK_DATA: u8 = 0;

/// SCTP common header (RFC 4960 §3.1).
#[repr(C)]
#[derive(Debug, Default, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SctpCommonHeader {
    pub src_port: U16<BigEndian>,
    pub dst_port: U16<BigEndian>,
    pub verification_tag: U32<BigEndian>,
    /// CRC32c over the packet with this field zeroed, stored LE.
    pub checksum: [u8; 4],
}

/// Chunk header preceding every chunk.
#[repr(C)]
#[derive(Debug, Default, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SctpChunkHeader {
    pub chunk_type: u8,
    pub flags: u8,
    pub length: U16<BigEndian>,
}

/// Fixed part of a DATA chunk after the chunk header.
#[repr(C)]
#[derive(Debug, Default, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SctpDataChunkFixed {
    pub tsn: U32<BigEndian>,
    pub stream_id: U16<BigEndian>,
    pub ssn: U16<BigEndian>,
    pub ppid: U32<BigEndian>,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DataChunkFlags: u8 {
        const ENDING = 0x01;
        const BEGINNING = 0x02;
        const UNORDERED = 0x04;
        const IMMEDIATE = 0x08;
    }
}

/// One fully reassembled upper-layer message with its PPID for routing.
#[derive(Debug, Clone)]
pub struct SctpMessage {
    pub ppid: u32,
    pub stream_id: u16,
    pub ssn: u16,
    pub src_port: u16,
    pub dst_port: u16,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct PendingMessage {
    /// (tsn, is_begin, is_end, payload) in arrival order.
    fragments: Vec<(u32, bool, bool, Vec<u8>)>,
}

#[derive(Debug)]
struct SctpAssociation {
    /// Keyed by (stream id, SSN).
    pending: HashMap<(u16, u16), PendingMessage>,
    last_update: DateTime<Utc>,
}

/// Per-association per-stream chunk reassembly; completed messages carry
/// their PPID so the caller can route them to the right parser.
pub struct SctpReassembler {
    /// Keyed by directional flow plus verification tag.
    associations: HashMap<(FiveTuple, u32), SctpAssociation>,
    timeout: Duration,
}

impl SctpReassembler {
    pub fn new(timeout_sec: u32) -> Self {
        Self {
            associations: HashMap::new(),
            timeout: Duration::seconds(i64::from(timeout_sec)),
        }
    }

    pub fn association_count(&self) -> usize {
        self.associations.len()
    }

    pub fn cleanup(&mut self, now: DateTime<Utc>) {
        let timeout = self.timeout;
        self.associations
            .retain(|_, a| now - a.last_update <= timeout);
    }

    /// Feeds one SCTP packet (starting at the common header); returns all
    /// messages completed by its DATA chunks.
    pub fn process_packet(
        &mut self,
        flow: &FiveTuple,
        packet: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Vec<SctpMessage>> {
        let (header, mut rest) = SctpCommonHeader::ref_from_prefix(packet)
            .map_err(|_| Error::truncated(12, packet.len()))?;

        verify_checksum(packet, header);

        let src_port = header.src_port.get();
        let dst_port = header.dst_port.get();
        let vtag = header.verification_tag.get();

        let mut completed = Vec::new();

        while !rest.is_empty() {
            let (chunk_header, body) = SctpChunkHeader::ref_from_prefix(rest)
                .map_err(|_| Error::truncated(4, rest.len()))?;
            let chunk_len = chunk_header.length.get() as usize;
            if chunk_len < 4 {
                return Err(Error::malformed("sctp", "chunk length below header"));
            }
            let value_len = chunk_len - 4;
            if body.len() < value_len {
                return Err(Error::truncated(value_len, body.len()));
            }
            let value = &body[..value_len];

            if chunk_header.chunk_type == CHUNK_DATA {
                let flags = DataChunkFlags::from_bits_truncate(chunk_header.flags);
                if let Some(msg) = self.process_data_chunk(
                    flow, vtag, flags, value, src_port, dst_port, now,
                )? {
                    completed.push(msg);
                }
            }

            // Chunks are padded to 4 bytes.
            let padded = value_len.div_ceil(4) * 4;
            if body.len() < padded {
                break;
            }
            rest = &body[padded..];
        }

        Ok(completed)
    }

    #[allow(clippy::too_many_arguments)]
    fn process_data_chunk(
        &mut self,
        flow: &FiveTuple,
        vtag: u32,
        flags: DataChunkFlags,
        value: &[u8],
        src_port: u16,
        dst_port: u16,
        now: DateTime<Utc>,
    ) -> Result<Option<SctpMessage>> {
        let (fixed, payload) = SctpDataChunkFixed::ref_from_prefix(value)
            .map_err(|_| Error::truncated(12, value.len()))?;

        let stream_id = fixed.stream_id.get();
        let ssn = fixed.ssn.get();
        let ppid = fixed.ppid.get();
        let tsn = fixed.tsn.get();

        let is_begin = flags.contains(DataChunkFlags::BEGINNING);
        let is_end = flags.contains(DataChunkFlags::ENDING);

        // Unfragmented chunk: the whole message in one piece.
        if is_begin && is_end {
            return Ok(Some(SctpMessage {
                ppid,
                stream_id,
                ssn,
                src_port,
                dst_port,
                data: payload.to_vec(),
            }));
        }

        let assoc = self
            .associations
            .entry((flow.clone(), vtag))
            .or_insert_with(|| SctpAssociation {
                pending: HashMap::new(),
                last_update: now,
            });
        assoc.last_update = now;

        let pending = assoc
            .pending
            .entry((stream_id, ssn))
            .or_insert_with(|| PendingMessage {
                fragments: Vec::new(),
            });
        pending
            .fragments
            .push((tsn, is_begin, is_end, payload.to_vec()));

        // Try to assemble: sort by TSN, require B on the first, E on the
        // last, and consecutive TSNs in between.
        pending.fragments.sort_by_key(|(tsn, ..)| *tsn);
        let have_begin = pending.fragments.first().is_some_and(|f| f.1);
        let have_end = pending.fragments.last().is_some_and(|f| f.2);
        let consecutive = pending
            .fragments
            .windows(2)
            .all(|w| w[1].0 == w[0].0.wrapping_add(1));

        if have_begin && have_end && consecutive {
            let mut data = Vec::new();
            for (_, _, _, frag) in &pending.fragments {
                data.extend_from_slice(frag);
            }
            assoc.pending.remove(&(stream_id, ssn));
            debug!(
                "sctp message reassembled: stream={stream_id} ssn={ssn} ppid={ppid} \
                 {} bytes",
                data.len()
            );
            return Ok(Some(SctpMessage {
                ppid,
                stream_id,
                ssn,
                src_port,
                dst_port,
                data,
            }));
        }

        Ok(None)
    }
}

/// Routes a PPID to the protocol it selects. `None` means the caller
/// should fall back to payload heuristics.
pub fn protocol_for_ppid(ppid: u32) -> Option<crate::models::ProtocolType> {
    use crate::models::ProtocolType;
    match ppid {
        PPID_S1AP => Some(ProtocolType::S1ap),
        PPID_X2AP => Some(ProtocolType::X2ap),
        PPID_DIAMETER => Some(ProtocolType::Diameter),
        PPID_NGAP => Some(ProtocolType::Ngap),
        _ => None,
    }
}

/// CRC32c check; offloaded checksums are common in captures, so a
/// mismatch is logged, not fatal.
fn verify_checksum(packet: &[u8], header: &SctpCommonHeader) {
    if packet.len() < 12 {
        return;
    }
    let stored = u32::from_le_bytes(header.checksum);
    if stored == 0 {
        return;
    }

    let mut zeroed = packet.to_vec();
    zeroed[8..12].fill(0);
    let computed = crc32c::crc32c(&zeroed);
    if computed != stored {
        warn!(
            "sctp checksum mismatch: stored=0x{stored:08x} computed=0x{computed:08x}"
        );
    }
}
