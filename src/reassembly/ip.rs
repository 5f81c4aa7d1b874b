// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::{BTreeMap, HashMap},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use chrono::{DateTime, Duration, Utc};
use tracing::trace;

use crate::models::error::{Error, Result};

const IPPROTO_HOPOPTS: u8 = 0;
const IPPROTO_ROUTING: u8 = 43;
const IPPROTO_FRAGMENT: u8 = 44;
const IPPROTO_DSTOPTS: u8 = 60;

/// Bound on IPv6 extension-header chains.
const MAX_EXTENSION_HEADERS: usize = 10;

/// Reassembly bucket key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub id: u32,
    pub protocol: u8,
    pub is_ipv6: bool,
}

#[derive(Debug)]
struct FragmentList {
    /// Payload slices keyed by byte offset.
    fragments: BTreeMap<u32, Vec<u8>>,
    seen_last_fragment: bool,
    total_length: u32,
    last_update: DateTime<Utc>,
}

impl FragmentList {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            fragments: BTreeMap::new(),
            seen_last_fragment: false,
            total_length: 0,
            last_update: now,
        }
    }

    /// Contiguous [0, total_length) cover check.
    fn complete_payload(&self) -> Option<Vec<u8>> {
        if !self.seen_last_fragment {
            return None;
        }
        let mut current = 0u32;
        for (&offset, data) in &self.fragments {
            if offset != current {
                return None;
            }
            current += data.len() as u32;
        }
        if current != self.total_length {
            return None;
        }

        let mut payload = Vec::with_capacity(self.total_length as usize);
        for data in self.fragments.values() {
            payload.extend_from_slice(data);
        }
        Some(payload)
    }
}

/// Result of feeding one IP datagram into the reassembler.
#[derive(Debug, PartialEq, Eq)]
pub enum IpDatagram {
    /// The datagram was not fragmented; use it as captured.
    Intact,
    /// A fragment completed its datagram; the synthesized whole is returned
    /// and the bucket is gone.
    Reassembled(Vec<u8>),
    /// A fragment was buffered; nothing to process yet.
    Pending,
}

/// IPv4/IPv6 defragmentation with timeout-based eviction.
///
/// Emission happens exactly once, on the fragment completing a contiguous
/// cover; the bucket is erased in the same call.
pub struct IpReassembler {
    table: HashMap<FragmentKey, FragmentList>,
    timeout: Duration,
}

impl IpReassembler {
    pub fn new(timeout_sec: u32) -> Self {
        Self {
            table: HashMap::new(),
            timeout: Duration::seconds(i64::from(timeout_sec)),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.table.len()
    }

    /// Drops buckets older than the timeout.
    pub fn cleanup(&mut self, now: DateTime<Utc>) {
        let timeout = self.timeout;
        self.table
            .retain(|_, list| now - list.last_update <= timeout);
    }

    /// Feeds one raw IP datagram (starting at the IP header).
    pub fn process(&mut self, ip_data: &[u8], now: DateTime<Utc>) -> Result<IpDatagram> {
        let version = ip_data
            .first()
            .map(|b| b >> 4)
            .ok_or_else(|| Error::truncated(1, 0))?;

        match version {
            4 => self.process_v4(ip_data, now),
            6 => self.process_v6(ip_data, now),
            other => Err(Error::malformed(
                "ip",
                format!("unknown IP version {other}"),
            )),
        }
    }

    fn process_v4(&mut self, ip_data: &[u8], now: DateTime<Utc>) -> Result<IpDatagram> {
        if ip_data.len() < 20 {
            return Err(Error::truncated(20, ip_data.len()));
        }

        let off_field = u16::from_be_bytes([ip_data[6], ip_data[7]]);
        let more_fragments = off_field & 0x2000 != 0;
        let offset = u32::from(off_field & 0x1FFF) * 8;

        if !more_fragments && offset == 0 {
            return Ok(IpDatagram::Intact);
        }

        let header_len = usize::from(ip_data[0] & 0x0F) * 4;
        if header_len < 20 || ip_data.len() < header_len {
            return Err(Error::malformed("ipv4", "bad IHL on fragment"));
        }

        let payload = &ip_data[header_len..];
        let payload_len = payload.len() as u32;

        if offset.checked_add(payload_len).is_none()
            || offset + payload_len > 65_535
        {
            return Err(Error::Sanity("ipv4 fragment beyond datagram bound"));
        }

        let protocol = ip_data[9];
        let src = Ipv4Addr::new(ip_data[12], ip_data[13], ip_data[14], ip_data[15]);
        let dst = Ipv4Addr::new(ip_data[16], ip_data[17], ip_data[18], ip_data[19]);

        let key = FragmentKey {
            src_ip: IpAddr::V4(src),
            dst_ip: IpAddr::V4(dst),
            id: u32::from(u16::from_be_bytes([ip_data[4], ip_data[5]])),
            protocol,
            is_ipv6: false,
        };

        let list = self
            .table
            .entry(key.clone())
            .or_insert_with(|| FragmentList::new(now));
        list.last_update = now;
        list.fragments.insert(offset, payload.to_vec());

        if !more_fragments {
            let total = offset + payload_len;
            if list.seen_last_fragment && list.total_length != total {
                self.table.remove(&key);
                return Err(Error::Sanity("contradictory ipv4 total length"));
            }
            list.seen_last_fragment = true;
            list.total_length = total;
        }

        if let Some(payload) = list.complete_payload() {
            self.table.remove(&key);
            trace!("ipv4 datagram reassembled: {} bytes", payload.len());
            return Ok(IpDatagram::Reassembled(synthesize_v4(
                src, dst, key.id as u16, protocol, &payload,
            )));
        }

        Ok(IpDatagram::Pending)
    }

    fn process_v6(&mut self, ip_data: &[u8], now: DateTime<Utc>) -> Result<IpDatagram> {
        if ip_data.len() < 40 {
            return Err(Error::truncated(40, ip_data.len()));
        }

        // Walk extension headers looking for a Fragment header.
        let mut next_header = ip_data[6];
        let mut cursor = 40usize;
        let mut frag_at: Option<usize> = None;

        for _ in 0..MAX_EXTENSION_HEADERS {
            match next_header {
                IPPROTO_FRAGMENT => {
                    if ip_data.len() < cursor + 8 {
                        return Err(Error::truncated(cursor + 8, ip_data.len()));
                    }
                    frag_at = Some(cursor);
                    break;
                },
                IPPROTO_HOPOPTS | IPPROTO_ROUTING | IPPROTO_DSTOPTS => {
                    if ip_data.len() < cursor + 2 {
                        return Err(Error::truncated(cursor + 2, ip_data.len()));
                    }
                    let hdr_len = (usize::from(ip_data[cursor + 1]) + 1) * 8;
                    if ip_data.len() < cursor + hdr_len {
                        return Err(Error::truncated(cursor + hdr_len, ip_data.len()));
                    }
                    next_header = ip_data[cursor];
                    cursor += hdr_len;
                },
                _ => break,
            }
        }

        let Some(frag_at) = frag_at else {
            if matches!(
                next_header,
                IPPROTO_HOPOPTS | IPPROTO_ROUTING | IPPROTO_DSTOPTS
            ) {
                // Chain longer than the bound and still in options.
                return Err(Error::Sanity("ipv6 extension header chain too long"));
            }
            return Ok(IpDatagram::Intact);
        };

        let frag_next = ip_data[frag_at];
        let offlg = u16::from_be_bytes([ip_data[frag_at + 2], ip_data[frag_at + 3]]);
        let offset = u32::from(offlg & 0xFFF8);
        let more_fragments = offlg & 0x0001 != 0;
        let id = u32::from_be_bytes([
            ip_data[frag_at + 4],
            ip_data[frag_at + 5],
            ip_data[frag_at + 6],
            ip_data[frag_at + 7],
        ]);

        let payload = &ip_data[frag_at + 8..];
        let payload_len = payload.len() as u32;
        if offset.checked_add(payload_len).is_none() {
            return Err(Error::Sanity("ipv6 fragment offset overflow"));
        }

        let mut src = [0u8; 16];
        src.copy_from_slice(&ip_data[8..24]);
        let mut dst = [0u8; 16];
        dst.copy_from_slice(&ip_data[24..40]);

        let key = FragmentKey {
            src_ip: IpAddr::V6(Ipv6Addr::from(src)),
            dst_ip: IpAddr::V6(Ipv6Addr::from(dst)),
            id,
            protocol: frag_next,
            is_ipv6: true,
        };

        let list = self
            .table
            .entry(key.clone())
            .or_insert_with(|| FragmentList::new(now));
        list.last_update = now;
        list.fragments.insert(offset, payload.to_vec());

        if !more_fragments {
            let total = offset + payload_len;
            if list.seen_last_fragment && list.total_length != total {
                self.table.remove(&key);
                return Err(Error::Sanity("contradictory ipv6 total length"));
            }
            list.seen_last_fragment = true;
            list.total_length = total;
        }

        if let Some(payload) = list.complete_payload() {
            self.table.remove(&key);
            trace!("ipv6 datagram reassembled: {} bytes", payload.len());
            // Reuse the first 40 header bytes, patching next-header and
            // payload length.
            let mut datagram = Vec::with_capacity(40 + payload.len());
            datagram.extend_from_slice(&ip_data[..40]);
            datagram[4..6].copy_from_slice(&(payload.len() as u16).to_be_bytes());
            datagram[6] = frag_next;
            datagram.extend_from_slice(&payload);
            return Ok(IpDatagram::Reassembled(datagram));
        }

        Ok(IpDatagram::Pending)
    }
}

/// Builds a fresh IPv4 header (IHL=5, no fragmentation bits) over the
/// reassembled payload.
fn synthesize_v4(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    id: u16,
    protocol: u8,
    payload: &[u8],
) -> Vec<u8> {
    let total_len = 20 + payload.len() as u16;

    let mut datagram = Vec::with_capacity(20 + payload.len());
    datagram.push(0x45);
    datagram.push(0);
    datagram.extend_from_slice(&total_len.to_be_bytes());
    datagram.extend_from_slice(&id.to_be_bytes());
    datagram.extend_from_slice(&[0, 0]); // flags/offset cleared
    datagram.push(64); // ttl
    datagram.push(protocol);
    datagram.extend_from_slice(&[0, 0]); // checksum placeholder
    datagram.extend_from_slice(&src.octets());
    datagram.extend_from_slice(&dst.octets());

    let checksum = ipv4_header_checksum(&datagram[..20]);
    datagram[10..12].copy_from_slice(&checksum.to_be_bytes());

    datagram.extend_from_slice(payload);
    datagram
}

fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in header.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += u32::from(word);
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_fragment(
        id: u16,
        offset_units: u16,
        more: bool,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut pkt = vec![0u8; 20];
        pkt[0] = 0x45;
        let total = 20 + payload.len() as u16;
        pkt[2..4].copy_from_slice(&total.to_be_bytes());
        pkt[4..6].copy_from_slice(&id.to_be_bytes());
        let off_field = offset_units | if more { 0x2000 } else { 0 };
        pkt[6..8].copy_from_slice(&off_field.to_be_bytes());
        pkt[8] = 64;
        pkt[9] = 17;
        pkt[12..16].copy_from_slice(&[10, 0, 0, 1]);
        pkt[16..20].copy_from_slice(&[10, 0, 0, 2]);
        pkt.extend_from_slice(payload);
        pkt
    }

    #[test]
    fn test_unfragmented_passes_through() {
        let mut r = IpReassembler::new(30);
        let pkt = v4_fragment(7, 0, false, b"hello");
        assert_eq!(
            r.process(&pkt, Utc::now()).expect("intact"),
            IpDatagram::Intact
        );
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_two_fragments_reassemble_once() {
        let mut r = IpReassembler::new(30);
        let now = Utc::now();

        let first = v4_fragment(7, 0, true, &[0xAA; 8]);
        assert_eq!(r.process(&first, now).expect("pending"), IpDatagram::Pending);
        assert_eq!(r.pending_count(), 1);

        let second = v4_fragment(7, 1, false, &[0xBB; 4]);
        match r.process(&second, now).expect("complete") {
            IpDatagram::Reassembled(data) => {
                assert_eq!(data.len(), 20 + 12);
                assert_eq!(&data[20..28], &[0xAA; 8]);
                assert_eq!(&data[28..32], &[0xBB; 4]);
                // Header is synthesized clean.
                assert_eq!(data[0], 0x45);
                assert_eq!(u16::from_be_bytes([data[6], data[7]]), 0);
            },
            other => panic!("expected reassembly, got {other:?}"),
        }
        // Bucket is erased after the emit.
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_out_of_order_fragments() {
        let mut r = IpReassembler::new(30);
        let now = Utc::now();

        let last = v4_fragment(9, 1, false, &[2; 8]);
        assert_eq!(r.process(&last, now).expect("pending"), IpDatagram::Pending);
        let first = v4_fragment(9, 0, true, &[1; 8]);
        match r.process(&first, now).expect("complete") {
            IpDatagram::Reassembled(data) => assert_eq!(data.len(), 20 + 16),
            other => panic!("expected reassembly, got {other:?}"),
        }
    }

    #[test]
    fn test_timeout_sweep() {
        let mut r = IpReassembler::new(30);
        let start = Utc::now();
        let frag = v4_fragment(1, 0, true, &[0; 8]);
        r.process(&frag, start).expect("pending");
        assert_eq!(r.pending_count(), 1);

        r.cleanup(start + Duration::seconds(31));
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_ipv6_fragment_pair() {
        let mut r = IpReassembler::new(30);
        let now = Utc::now();

        let build = |offset: u16, more: bool, payload: &[u8]| {
            let mut pkt = vec![0u8; 40];
            pkt[0] = 0x60;
            pkt[4..6].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
            pkt[6] = IPPROTO_FRAGMENT;
            pkt[7] = 64;
            pkt[8..24].copy_from_slice(&[1; 16]);
            pkt[24..40].copy_from_slice(&[2; 16]);
            // Fragment header: next=UDP, reserved, offlg, ident.
            pkt.push(17);
            pkt.push(0);
            let offlg = (offset & 0xFFF8) | u16::from(more);
            pkt.extend_from_slice(&offlg.to_be_bytes());
            pkt.extend_from_slice(&0xDEADu32.to_be_bytes());
            pkt.extend_from_slice(payload);
            pkt
        };

        assert_eq!(
            r.process(&build(0, true, &[3; 8]), now).expect("pending"),
            IpDatagram::Pending
        );
        match r.process(&build(8, false, &[4; 8]), now).expect("complete") {
            IpDatagram::Reassembled(data) => {
                assert_eq!(data.len(), 40 + 16);
                // next_header patched to the fragment's inner protocol
                assert_eq!(data[6], 17);
                assert_eq!(u16::from_be_bytes([data[4], data[5]]), 16);
            },
            other => panic!("expected reassembly, got {other:?}"),
        }
    }
}
