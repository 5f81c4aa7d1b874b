// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs::File, io::Read};

use crate::models::error::{Error, Result};

/// Classic PCAP, microsecond timestamps, native byte order.
pub const PCAP_MAGIC: u32 = 0xA1B2_C3D4;
/// Classic PCAP, microsecond timestamps, byte-swapped.
pub const PCAP_MAGIC_SWAPPED: u32 = 0xD4C3_B2A1;
/// Classic PCAP, nanosecond timestamps.
pub const PCAP_NSEC_MAGIC: u32 = 0xA1B2_3C4D;
/// Classic PCAP, nanosecond timestamps, byte-swapped.
pub const PCAP_NSEC_MAGIC_SWAPPED: u32 = 0x4D3C_B2A1;
/// PCAPNG Section Header Block type.
pub const PCAPNG_MAGIC: u32 = 0x0A0D_0D0A;
/// PCAPNG byte-order magic, as written by a little-endian producer.
pub const PCAPNG_BYTE_ORDER_MAGIC: u32 = 0x1A2B_3C4D;

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
const BZIP2_MAGIC: [u8; 2] = [b'B', b'Z'];
const SNOOP_MAGIC: &[u8; 8] = b"snoop\0\0\0";

/// Container format recognized from leading magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFormat {
    PcapClassic { swapped: bool, nanos: bool },
    Pcapng,
    /// Sun Snoop. Detected, not parsed.
    Snoop,
    /// Endace ERF. Detected by structure, not parsed.
    Erf,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Bzip2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDetection {
    pub format: CaptureFormat,
    pub compression: Option<Compression>,
}

/// Detects the container format from a peeked header.
///
/// `header` should hold at least 16 bytes for reliable ERF rejection;
/// shorter buffers only resolve magic-number formats.
pub fn detect(header: &[u8]) -> FormatDetection {
    if header.len() >= 2 {
        if header[..2] == GZIP_MAGIC {
            return FormatDetection {
                format: CaptureFormat::Unknown,
                compression: Some(Compression::Gzip),
            };
        }
        if header[..2] == BZIP2_MAGIC {
            return FormatDetection {
                format: CaptureFormat::Unknown,
                compression: Some(Compression::Bzip2),
            };
        }
    }

    if header.len() >= 8 && &header[..8] == SNOOP_MAGIC {
        return FormatDetection {
            format: CaptureFormat::Snoop,
            compression: None,
        };
    }

    if header.len() >= 4 {
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let format = match magic {
            PCAPNG_MAGIC => Some(CaptureFormat::Pcapng),
            PCAP_MAGIC => Some(CaptureFormat::PcapClassic {
                swapped: false,
                nanos: false,
            }),
            PCAP_MAGIC_SWAPPED => Some(CaptureFormat::PcapClassic {
                swapped: true,
                nanos: false,
            }),
            PCAP_NSEC_MAGIC => Some(CaptureFormat::PcapClassic {
                swapped: false,
                nanos: true,
            }),
            PCAP_NSEC_MAGIC_SWAPPED => Some(CaptureFormat::PcapClassic {
                swapped: true,
                nanos: true,
            }),
            _ => None,
        };
        if let Some(format) = format {
            return FormatDetection {
                format,
                compression: None,
            };
        }
    }

    // ERF has no magic. The record header starts with an 8-byte timestamp
    // followed by a type byte in 1..30 for every known record kind.
    if header.len() >= 16 {
        let erf_type = header[8] & 0x7F;
        if (1..30).contains(&erf_type) {
            return FormatDetection {
                format: CaptureFormat::Erf,
                compression: None,
            };
        }
    }

    FormatDetection {
        format: CaptureFormat::Unknown,
        compression: None,
    }
}

/// Detects the format of a capture file, looking through gzip if needed.
pub fn detect_file(path: &std::path::Path) -> Result<FormatDetection> {
    let mut file = File::open(path)?;
    let mut header = [0u8; 64];
    let n = read_up_to(&mut file, &mut header)?;
    let mut detection = detect(&header[..n]);

    if detection.compression == Some(Compression::Gzip) {
        // Peek at the decompressed prefix to resolve the inner format.
        let file = File::open(path)?;
        let mut gz = flate2::read::GzDecoder::new(file);
        let mut inner = [0u8; 16];
        let n = read_up_to(&mut gz, &mut inner)
            .map_err(|e| Error::malformed("gzip", e.to_string()))?;
        let inner_detection = detect(&inner[..n]);
        detection.format = inner_detection.format;
    }

    Ok(detection)
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
