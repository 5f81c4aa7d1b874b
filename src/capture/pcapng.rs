// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io::Read,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::{
    capture::reader::{InterfaceInfo, PacketRecord, RecordSource, read_exact_or_eof},
    models::error::{Error, Result},
};

// Block types.
const BLOCK_SECTION_HEADER: u32 = 0x0A0D_0D0A;
const BLOCK_INTERFACE_DESCRIPTION: u32 = 0x0000_0001;
const BLOCK_SIMPLE_PACKET: u32 = 0x0000_0003;
const BLOCK_NAME_RESOLUTION: u32 = 0x0000_0004;
const BLOCK_INTERFACE_STATISTICS: u32 = 0x0000_0005;
const BLOCK_ENHANCED_PACKET: u32 = 0x0000_0006;
const BLOCK_DECRYPTION_SECRETS: u32 = 0x0000_000A;
const BLOCK_CUSTOM: u32 = 0x0000_0BAD;
const BLOCK_CUSTOM_NOCOPY: u32 = 0x4000_0BAD;

const BYTE_ORDER_MAGIC: u32 = 0x1A2B_3C4D;
const BYTE_ORDER_MAGIC_SWAPPED: u32 = 0x4D3C_2B1A;

// Option codes.
const OPT_ENDOFOPT: u16 = 0;
const OPT_COMMENT: u16 = 1;

const SHB_HARDWARE: u16 = 2;
const SHB_OS: u16 = 3;
const SHB_USERAPPL: u16 = 4;

const IF_NAME: u16 = 2;
const IF_DESCRIPTION: u16 = 3;
const IF_SPEED: u16 = 8;
const IF_TSRESOL: u16 = 9;
const IF_FILTER: u16 = 11;
const IF_OS: u16 = 12;
const IF_HARDWARE: u16 = 15;

const ISB_IFRECV: u16 = 4;
const ISB_IFDROP: u16 = 5;
const ISB_FILTERACCEPT: u16 = 6;
const ISB_OSDROP: u16 = 7;
const ISB_USRDELIV: u16 = 8;

const NRB_RECORD_END: u16 = 0;
const NRB_RECORD_IPV4: u16 = 1;
const NRB_RECORD_IPV6: u16 = 2;

/// Sanity cap for one block.
const MAX_BLOCK_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct SectionHeader {
    pub major_version: u16,
    pub minor_version: u16,
    pub section_length: i64,
    pub hardware: Option<String>,
    pub os: Option<String>,
    pub user_application: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NameResolutionRecord {
    pub address: IpAddr,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InterfaceStatistics {
    pub interface_id: u32,
    pub timestamp_units: u64,
    pub packets_received: Option<u64>,
    pub packets_dropped: Option<u64>,
    pub filter_accepted: Option<u64>,
    pub os_dropped: Option<u64>,
    pub delivered_to_user: Option<u64>,
    pub comment: Option<String>,
}

/// Per-kind block counters, exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReaderStats {
    pub total_blocks: u64,
    pub section_headers: u64,
    pub interface_descriptions: u64,
    pub enhanced_packets: u64,
    pub simple_packets: u64,
    pub name_resolution_blocks: u64,
    pub interface_statistics_blocks: u64,
    pub decryption_secrets_blocks: u64,
    pub custom_blocks: u64,
    pub unknown_blocks: u64,
    pub bytes_read: u64,
}

/// Block-level streaming PCAPNG reader.
///
/// Every block's trailing length is checked against the leading length;
/// a mismatch fails the block with `TruncatedBlock`.
pub struct PcapngReader {
    input: Box<dyn Read + Send>,
    big_endian: bool,
    interfaces: Vec<InterfaceInfo>,
    section: SectionHeader,
    name_resolutions: Vec<NameResolutionRecord>,
    interface_stats: Vec<InterfaceStatistics>,
    stats: ReaderStats,
    frame: u32,
}

impl PcapngReader {
    pub fn new(mut input: Box<dyn Read + Send>) -> Result<Self> {
        let mut reader = Self {
            input: Box::new(std::io::empty()),
            big_endian: false,
            interfaces: Vec::new(),
            section: SectionHeader::default(),
            name_resolutions: Vec::new(),
            interface_stats: Vec::new(),
            stats: ReaderStats::default(),
            frame: 0,
        };

        // The first block decides the section byte order.
        let first = read_block_raw(&mut input, &mut reader)?;
        reader.input = input;
        match first {
            Some((BLOCK_SECTION_HEADER, body)) => reader.parse_section_header(&body)?,
            _ => {
                return Err(Error::malformed(
                    "pcapng",
                    "file does not start with a Section Header Block",
                ));
            },
        }

        Ok(reader)
    }

    pub fn stats(&self) -> ReaderStats {
        self.stats
    }

    pub fn section(&self) -> &SectionHeader {
        &self.section
    }

    pub fn name_resolutions(&self) -> &[NameResolutionRecord] {
        &self.name_resolutions
    }

    pub fn interface_stats(&self) -> &[InterfaceStatistics] {
        &self.interface_stats
    }

    fn u16_at(&self, data: &[u8], at: usize) -> Result<u16> {
        let b: [u8; 2] = data
            .get(at..at + 2)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| Error::truncated(at + 2, data.len()))?;
        Ok(if self.big_endian {
            u16::from_be_bytes(b)
        } else {
            u16::from_le_bytes(b)
        })
    }

    fn u32_at(&self, data: &[u8], at: usize) -> Result<u32> {
        let b: [u8; 4] = data
            .get(at..at + 4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| Error::truncated(at + 4, data.len()))?;
        Ok(if self.big_endian {
            u32::from_be_bytes(b)
        } else {
            u32::from_le_bytes(b)
        })
    }

    fn u64_at(&self, data: &[u8], at: usize) -> Result<u64> {
        let b: [u8; 8] = data
            .get(at..at + 8)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| Error::truncated(at + 8, data.len()))?;
        Ok(if self.big_endian {
            u64::from_be_bytes(b)
        } else {
            u64::from_le_bytes(b)
        })
    }

    /// Walks the option list at `data`, invoking `cb` per option.
    fn walk_options(
        &self,
        data: &[u8],
        mut cb: impl FnMut(u16, &[u8]),
    ) -> Result<()> {
        let mut offset = 0usize;
        while offset + 4 <= data.len() {
            let code = self.u16_at(data, offset)?;
            let len = self.u16_at(data, offset + 2)? as usize;
            offset += 4;

            if code == OPT_ENDOFOPT {
                break;
            }
            if offset + len > data.len() {
                warn!("pcapng option {code} extends beyond block, truncating");
                break;
            }

            cb(code, &data[offset..offset + len]);

            offset += len.div_ceil(4) * 4;
        }
        Ok(())
    }

    fn parse_section_header(&mut self, body: &[u8]) -> Result<()> {
        if body.len() < 16 {
            return Err(Error::TruncatedBlock(
                "Section Header Block too small".to_string(),
            ));
        }

        // body[0..4] is the byte-order magic, already consumed for
        // endianness during the raw read.
        let mut section = SectionHeader {
            major_version: self.u16_at(body, 4)?,
            minor_version: self.u16_at(body, 6)?,
            section_length: self.u64_at(body, 8)? as i64,
            ..SectionHeader::default()
        };

        self.walk_options(&body[16..], |code, value| match code {
            SHB_HARDWARE => section.hardware = Some(opt_string(value)),
            SHB_OS => section.os = Some(opt_string(value)),
            SHB_USERAPPL => section.user_application = Some(opt_string(value)),
            OPT_COMMENT => section.comment = Some(opt_string(value)),
            _ => {},
        })?;

        debug!(
            "pcapng section v{}.{}",
            section.major_version, section.minor_version
        );
        self.section = section;
        self.stats.section_headers += 1;
        Ok(())
    }

    fn parse_interface_description(&mut self, body: &[u8]) -> Result<()> {
        if body.len() < 8 {
            return Err(Error::TruncatedBlock(
                "Interface Description Block too small".to_string(),
            ));
        }

        let mut info = InterfaceInfo {
            interface_id: self.interfaces.len() as u32,
            link_type: self.u16_at(body, 0)?,
            snap_len: self.u32_at(body, 4)?,
            name: None,
            description: None,
            os: None,
            hardware: None,
            filter: None,
            speed: None,
            units_per_sec: 1_000_000,
        };

        let mut tsresol: Option<u8> = None;
        let big_endian = self.big_endian;
        self.walk_options(&body[8..], |code, value| match code {
            IF_NAME => info.name = Some(opt_string(value)),
            IF_DESCRIPTION => info.description = Some(opt_string(value)),
            IF_OS => info.os = Some(opt_string(value)),
            IF_HARDWARE => info.hardware = Some(opt_string(value)),
            IF_FILTER => {
                // First octet is the filter kind; the rest is the text.
                if value.len() > 1 {
                    info.filter = Some(opt_string(&value[1..]));
                }
            },
            IF_SPEED => {
                if let Ok(b) = <[u8; 8]>::try_from(value) {
                    info.speed = Some(if big_endian {
                        u64::from_be_bytes(b)
                    } else {
                        u64::from_le_bytes(b)
                    });
                }
            },
            IF_TSRESOL => {
                if let Some(&v) = value.first() {
                    tsresol = Some(v);
                }
            },
            _ => {},
        })?;

        if let Some(v) = tsresol {
            info.units_per_sec = tsresol_units_per_sec(v)?;
        }

        debug!(
            "pcapng interface {} linktype={} name={:?} units_per_sec={}",
            info.interface_id, info.link_type, info.name, info.units_per_sec
        );
        self.interfaces.push(info);
        self.stats.interface_descriptions += 1;
        Ok(())
    }

    fn parse_enhanced_packet(&mut self, body: &[u8]) -> Result<PacketRecord> {
        if body.len() < 20 {
            return Err(Error::TruncatedBlock(
                "Enhanced Packet Block too small".to_string(),
            ));
        }

        let interface_id = self.u32_at(body, 0)?;
        let ts_high = self.u32_at(body, 4)?;
        let ts_low = self.u32_at(body, 8)?;
        let captured_len = self.u32_at(body, 12)? as usize;
        let original_len = self.u32_at(body, 16)?;

        let padded = captured_len.div_ceil(4) * 4;
        if body.len() < 20 + padded {
            return Err(Error::TruncatedBlock(
                "Enhanced Packet Block data truncated".to_string(),
            ));
        }

        let iface = self
            .interfaces
            .get(interface_id as usize)
            .ok_or_else(|| {
                Error::malformed(
                    "pcapng",
                    format!("packet references unknown interface {interface_id}"),
                )
            })?;

        let units = (u64::from(ts_high) << 32) | u64::from(ts_low);
        let timestamp = iface.resolve_timestamp(units)?;
        let link_type = iface.link_type;

        self.frame += 1;
        self.stats.enhanced_packets += 1;

        Ok(PacketRecord {
            timestamp,
            interface_id: Some(interface_id),
            link_type,
            data: Bytes::copy_from_slice(&body[20..20 + captured_len]),
            original_length: original_len,
            frame_number: self.frame,
        })
    }

    fn parse_simple_packet(&mut self, body: &[u8]) -> Result<PacketRecord> {
        if body.len() < 4 {
            return Err(Error::TruncatedBlock(
                "Simple Packet Block too small".to_string(),
            ));
        }

        let original_len = self.u32_at(body, 0)?;
        let iface = self.interfaces.first().ok_or_else(|| {
            Error::malformed("pcapng", "Simple Packet Block before any interface")
        })?;

        let captured = (body.len() - 4).min(original_len as usize);
        self.frame += 1;
        self.stats.simple_packets += 1;

        Ok(PacketRecord {
            // Simple Packet Blocks carry no timestamp.
            timestamp: DateTime::<Utc>::from_timestamp(0, 0)
                .unwrap_or_else(Utc::now),
            interface_id: Some(0),
            link_type: iface.link_type,
            data: Bytes::copy_from_slice(&body[4..4 + captured]),
            original_length: original_len,
            frame_number: self.frame,
        })
    }

    fn parse_name_resolution(&mut self, body: &[u8]) -> Result<()> {
        let mut offset = 0usize;

        while offset + 4 <= body.len() {
            let record_type = self.u16_at(body, offset)?;
            let record_len = self.u16_at(body, offset + 2)? as usize;
            offset += 4;

            if record_type == NRB_RECORD_END {
                break;
            }
            if offset + record_len > body.len() {
                warn!("pcapng name resolution record extends beyond block");
                break;
            }

            let value = &body[offset..offset + record_len];
            match record_type {
                NRB_RECORD_IPV4 if record_len >= 4 => {
                    let addr =
                        Ipv4Addr::new(value[0], value[1], value[2], value[3]);
                    self.name_resolutions.push(NameResolutionRecord {
                        address: IpAddr::V4(addr),
                        names: split_names(&value[4..]),
                    });
                },
                NRB_RECORD_IPV6 if record_len >= 16 => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&value[..16]);
                    self.name_resolutions.push(NameResolutionRecord {
                        address: IpAddr::V6(Ipv6Addr::from(octets)),
                        names: split_names(&value[16..]),
                    });
                },
                _ => {},
            }

            offset += record_len.div_ceil(4) * 4;
        }

        self.stats.name_resolution_blocks += 1;
        Ok(())
    }

    fn parse_interface_statistics(&mut self, body: &[u8]) -> Result<()> {
        if body.len() < 12 {
            return Err(Error::TruncatedBlock(
                "Interface Statistics Block too small".to_string(),
            ));
        }

        let mut stats = InterfaceStatistics {
            interface_id: self.u32_at(body, 0)?,
            timestamp_units: (u64::from(self.u32_at(body, 4)?) << 32)
                | u64::from(self.u32_at(body, 8)?),
            ..InterfaceStatistics::default()
        };

        let big_endian = self.big_endian;
        let read_u64 = |value: &[u8]| {
            <[u8; 8]>::try_from(value).ok().map(|b| {
                if big_endian {
                    u64::from_be_bytes(b)
                } else {
                    u64::from_le_bytes(b)
                }
            })
        };

        self.walk_options(&body[12..], |code, value| match code {
            ISB_IFRECV => stats.packets_received = read_u64(value),
            ISB_IFDROP => stats.packets_dropped = read_u64(value),
            ISB_FILTERACCEPT => stats.filter_accepted = read_u64(value),
            ISB_OSDROP => stats.os_dropped = read_u64(value),
            ISB_USRDELIV => stats.delivered_to_user = read_u64(value),
            OPT_COMMENT => stats.comment = Some(opt_string(value)),
            _ => {},
        })?;

        self.interface_stats.push(stats);
        self.stats.interface_statistics_blocks += 1;
        Ok(())
    }
}

impl RecordSource for PcapngReader {
    fn next_record(&mut self) -> Result<Option<PacketRecord>> {
        loop {
            let mut input = std::mem::replace(&mut self.input, Box::new(std::io::empty()));
            let block = read_block_raw(&mut input, self);
            self.input = input;

            let (block_type, body) = match block? {
                Some(b) => b,
                None => return Ok(None),
            };

            match block_type {
                BLOCK_SECTION_HEADER => self.parse_section_header(&body)?,
                BLOCK_INTERFACE_DESCRIPTION => {
                    self.parse_interface_description(&body)?
                },
                BLOCK_ENHANCED_PACKET => {
                    return self.parse_enhanced_packet(&body).map(Some);
                },
                BLOCK_SIMPLE_PACKET => {
                    return self.parse_simple_packet(&body).map(Some);
                },
                BLOCK_NAME_RESOLUTION => self.parse_name_resolution(&body)?,
                BLOCK_INTERFACE_STATISTICS => self.parse_interface_statistics(&body)?,
                BLOCK_DECRYPTION_SECRETS => {
                    self.stats.decryption_secrets_blocks += 1;
                },
                BLOCK_CUSTOM | BLOCK_CUSTOM_NOCOPY => {
                    self.stats.custom_blocks += 1;
                },
                other => {
                    debug!("pcapng: skipping unknown block type 0x{other:08x}");
                    self.stats.unknown_blocks += 1;
                },
            }
        }
    }

    fn interfaces(&self) -> &[InterfaceInfo] {
        &self.interfaces
    }
}

/// Reads one raw block: `(type, body)` where the body excludes the type
/// and both length fields. Handles mid-stream Section Header Blocks that
/// flip the byte order.
fn read_block_raw(
    input: &mut (dyn Read + Send),
    reader: &mut PcapngReader,
) -> Result<Option<(u32, Vec<u8>)>> {
    let mut type_bytes = [0u8; 4];
    if !read_exact_or_eof(input, &mut type_bytes, "pcapng block type")? {
        return Ok(None);
    }

    let mut len_bytes = [0u8; 4];
    if !read_exact_or_eof(input, &mut len_bytes, "pcapng block length")? {
        return Err(Error::TruncatedBlock("block length missing".to_string()));
    }

    // The SHB type value is a byte-order palindrome, so it is recognized
    // before the endianness is known.
    let is_shb = type_bytes == 0x0A0D_0D0Au32.to_le_bytes();

    let block_type;
    let mut body: Vec<u8>;

    if is_shb {
        let mut bom_bytes = [0u8; 4];
        if !read_exact_or_eof(input, &mut bom_bytes, "pcapng byte-order magic")? {
            return Err(Error::TruncatedBlock(
                "byte-order magic missing".to_string(),
            ));
        }
        let bom = u32::from_le_bytes(bom_bytes);
        reader.big_endian = match bom {
            BYTE_ORDER_MAGIC => false,
            BYTE_ORDER_MAGIC_SWAPPED => true,
            other => {
                return Err(Error::malformed(
                    "pcapng",
                    format!("invalid byte-order magic 0x{other:08x}"),
                ));
            },
        };

        block_type = BLOCK_SECTION_HEADER;
        let total_len = if reader.big_endian {
            u32::from_be_bytes(len_bytes)
        } else {
            u32::from_le_bytes(len_bytes)
        };
        validate_block_len(total_len)?;

        // Body starts at the byte-order magic, which was already consumed.
        let body_len = total_len as usize - 12;
        body = vec![0u8; body_len];
        body[..4].copy_from_slice(&bom_bytes);
        if body_len > 4
            && !read_exact_or_eof(input, &mut body[4..], "pcapng SHB body")?
        {
            return Err(Error::TruncatedBlock("SHB body missing".to_string()));
        }

        check_trailing(input, reader.big_endian, total_len)?;
        reader.stats.total_blocks += 1;
        reader.stats.bytes_read += u64::from(total_len);
        return Ok(Some((block_type, body)));
    }

    block_type = if reader.big_endian {
        u32::from_be_bytes(type_bytes)
    } else {
        u32::from_le_bytes(type_bytes)
    };
    let total_len = if reader.big_endian {
        u32::from_be_bytes(len_bytes)
    } else {
        u32::from_le_bytes(len_bytes)
    };
    validate_block_len(total_len)?;

    let body_len = total_len as usize - 12;
    body = vec![0u8; body_len];
    if body_len > 0 && !read_exact_or_eof(input, &mut body, "pcapng block body")? {
        return Err(Error::TruncatedBlock("block body missing".to_string()));
    }

    check_trailing(input, reader.big_endian, total_len)?;
    reader.stats.total_blocks += 1;
    reader.stats.bytes_read += u64::from(total_len);
    Ok(Some((block_type, body)))
}

fn validate_block_len(total_len: u32) -> Result<()> {
    if total_len < 12 || total_len % 4 != 0 {
        return Err(Error::malformed(
            "pcapng",
            format!("invalid block length {total_len}"),
        ));
    }
    if total_len > MAX_BLOCK_LEN {
        return Err(Error::Sanity("pcapng block larger than 64 MiB"));
    }
    Ok(())
}

fn check_trailing(
    input: &mut (dyn Read + Send),
    big_endian: bool,
    expected: u32,
) -> Result<()> {
    let mut trailing = [0u8; 4];
    if !read_exact_or_eof(input, &mut trailing, "pcapng trailing length")? {
        return Err(Error::TruncatedBlock("trailing length missing".to_string()));
    }
    let trailing = if big_endian {
        u32::from_be_bytes(trailing)
    } else {
        u32::from_le_bytes(trailing)
    };
    if trailing != expected {
        return Err(Error::TruncatedBlock(format!(
            "block length mismatch: {expected} vs {trailing}"
        )));
    }
    Ok(())
}

/// `if_tsresol` semantics: low 7 bits are the exponent; high bit selects
/// base 2 over base 10.
fn tsresol_units_per_sec(v: u8) -> Result<u64> {
    let exp = u32::from(v & 0x7F);
    let base: u64 = if v & 0x80 != 0 { 2 } else { 10 };
    base.checked_pow(exp)
        .ok_or_else(|| Error::unsupported("pcapng", "timestamp resolution too high"))
}

fn opt_string(value: &[u8]) -> String {
    let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
    String::from_utf8_lossy(&value[..end]).into_owned()
}

fn split_names(value: &[u8]) -> Vec<String> {
    value
        .split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tsresol_decoding() {
        assert_eq!(tsresol_units_per_sec(6).expect("10^6"), 1_000_000);
        assert_eq!(tsresol_units_per_sec(9).expect("10^9"), 1_000_000_000);
        assert_eq!(tsresol_units_per_sec(0x8A).expect("2^10"), 1024);
        assert!(tsresol_units_per_sec(0x7F).is_err());
    }
}
