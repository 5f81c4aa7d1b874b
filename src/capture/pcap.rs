// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::io::Read;

use bytes::Bytes;
use chrono::DateTime;

use crate::{
    capture::{
        format::{
            PCAP_MAGIC, PCAP_MAGIC_SWAPPED, PCAP_NSEC_MAGIC, PCAP_NSEC_MAGIC_SWAPPED,
        },
        reader::{InterfaceInfo, PacketRecord, RecordSource, read_exact_or_eof},
    },
    models::error::{Error, Result},
};

/// Largest record body the reader will accept.
const MAX_RECORD_LEN: u32 = 0x0FFF_FFFF;

/// Classic PCAP reader: 24-byte global header followed by
/// 16-byte-per-record frames, byte order and timestamp unit chosen by the
/// file magic.
pub struct PcapReader {
    input: Box<dyn Read + Send>,
    swapped: bool,
    nanos: bool,
    interfaces: Vec<InterfaceInfo>,
    frame: u32,
}

impl PcapReader {
    pub fn new(mut input: Box<dyn Read + Send>) -> Result<Self> {
        let mut header = [0u8; 24];
        if !read_exact_or_eof(&mut input, &mut header, "pcap global header")? {
            return Err(Error::TruncatedBlock("empty pcap file".to_string()));
        }

        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let (swapped, nanos) = match magic {
            PCAP_MAGIC => (false, false),
            PCAP_MAGIC_SWAPPED => (true, false),
            PCAP_NSEC_MAGIC => (false, true),
            PCAP_NSEC_MAGIC_SWAPPED => (true, true),
            other => {
                return Err(Error::malformed(
                    "pcap",
                    format!("bad magic 0x{other:08x}"),
                ));
            },
        };

        let read_u32 = |b: [u8; 4]| {
            if swapped {
                u32::from_be_bytes(b)
            } else {
                u32::from_le_bytes(b)
            }
        };

        let snap_len = read_u32([header[16], header[17], header[18], header[19]]);
        let link_type =
            read_u32([header[20], header[21], header[22], header[23]]) as u16;

        let units_per_sec = if nanos { 1_000_000_000 } else { 1_000_000 };

        Ok(Self {
            input,
            swapped,
            nanos,
            interfaces: vec![InterfaceInfo::synthetic(
                link_type,
                snap_len,
                units_per_sec,
            )],
            frame: 0,
        })
    }

    fn u32(&self, b: [u8; 4]) -> u32 {
        if self.swapped {
            u32::from_be_bytes(b)
        } else {
            u32::from_le_bytes(b)
        }
    }
}

impl RecordSource for PcapReader {
    fn next_record(&mut self) -> Result<Option<PacketRecord>> {
        let mut hdr = [0u8; 16];
        if !read_exact_or_eof(&mut self.input, &mut hdr, "pcap record header")? {
            return Ok(None);
        }

        let ts_sec = self.u32([hdr[0], hdr[1], hdr[2], hdr[3]]);
        let ts_frac = self.u32([hdr[4], hdr[5], hdr[6], hdr[7]]);
        let incl_len = self.u32([hdr[8], hdr[9], hdr[10], hdr[11]]);
        let orig_len = self.u32([hdr[12], hdr[13], hdr[14], hdr[15]]);

        if incl_len > MAX_RECORD_LEN {
            return Err(Error::malformed(
                "pcap",
                format!("record length {incl_len} out of range"),
            ));
        }

        let mut data = vec![0u8; incl_len as usize];
        if !read_exact_or_eof(&mut self.input, &mut data, "pcap record body")? {
            return Err(Error::TruncatedBlock(
                "pcap record body missing".to_string(),
            ));
        }

        let nanos = if self.nanos {
            ts_frac
        } else {
            if ts_frac >= 1_000_000 {
                return Err(Error::malformed(
                    "pcap",
                    format!("microsecond fraction {ts_frac} out of range"),
                ));
            }
            ts_frac * 1_000
        };
        let timestamp = DateTime::from_timestamp(i64::from(ts_sec), nanos)
            .ok_or_else(|| Error::malformed("pcap", "timestamp out of range"))?;

        self.frame += 1;

        Ok(Some(PacketRecord {
            timestamp,
            interface_id: None,
            link_type: self.interfaces[0].link_type,
            data: Bytes::from(data),
            original_length: orig_len,
            frame_number: self.frame,
        }))
    }

    fn interfaces(&self) -> &[InterfaceInfo] {
        &self.interfaces
    }
}
