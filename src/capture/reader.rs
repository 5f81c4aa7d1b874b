// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs::File, io::BufReader, io::Read, path::Path};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use enum_dispatch::enum_dispatch;
use tracing::debug;

use crate::{
    capture::{
        format::{self, CaptureFormat, Compression},
        pcap::PcapReader,
        pcapng::PcapngReader,
    },
    models::error::{Error, Result},
};

/// One captured frame, as yielded by the pull iterator.
#[derive(Debug, Clone)]
pub struct PacketRecord {
    pub timestamp: DateTime<Utc>,
    /// PCAPNG interface id; `None` for classic PCAP.
    pub interface_id: Option<u32>,
    /// Link type the frame was captured with (DLT).
    pub link_type: u16,
    pub data: Bytes,
    pub original_length: u32,
    pub frame_number: u32,
}

/// Description of a capture interface.
///
/// Classic PCAP exposes a single synthetic entry carrying the file-level
/// link type; PCAPNG fills one entry per Interface Description Block.
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub interface_id: u32,
    pub link_type: u16,
    pub snap_len: u32,
    pub name: Option<String>,
    pub description: Option<String>,
    pub os: Option<String>,
    pub hardware: Option<String>,
    pub filter: Option<String>,
    pub speed: Option<u64>,
    /// Timestamp units per second derived from `if_tsresol`.
    pub units_per_sec: u64,
}

impl InterfaceInfo {
    pub fn synthetic(link_type: u16, snap_len: u32, units_per_sec: u64) -> Self {
        Self {
            interface_id: 0,
            link_type,
            snap_len,
            name: None,
            description: None,
            os: None,
            hardware: None,
            filter: None,
            speed: None,
            units_per_sec,
        }
    }

    /// Converts a raw timestamp count into wall-clock time using this
    /// interface's resolution.
    pub fn resolve_timestamp(&self, units: u64) -> Result<DateTime<Utc>> {
        let ups = self.units_per_sec.max(1);
        let secs = (units / ups) as i64;
        let rem = units % ups;
        let nanos = (u128::from(rem) * 1_000_000_000 / u128::from(ups)) as u32;
        DateTime::from_timestamp(secs, nanos)
            .ok_or_else(|| Error::malformed("pcapng", "timestamp out of range"))
    }
}

/// Common surface of the capture backends.
#[enum_dispatch]
pub trait RecordSource {
    /// Pulls the next packet record, or `None` at end of stream.
    fn next_record(&mut self) -> Result<Option<PacketRecord>>;

    /// Interfaces described so far. For PCAPNG this grows as Interface
    /// Description Blocks are encountered.
    fn interfaces(&self) -> &[InterfaceInfo];
}

#[enum_dispatch(RecordSource)]
pub enum CaptureBackend {
    Pcap(PcapReader),
    Pcapng(PcapngReader),
}

/// Pull-iterator over a capture file, transparent to gzip compression and
/// container format.
pub struct CaptureReader {
    backend: CaptureBackend,
}

impl CaptureReader {
    /// Opens a capture file, auto-detecting compression and container.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let detection = format::detect_file(path)?;

        let input: Box<dyn Read + Send> = match detection.compression {
            Some(Compression::Gzip) => {
                debug!("gzip-wrapped capture: {path:?}");
                Box::new(BufReader::new(flate2::read::GzDecoder::new(File::open(
                    path,
                )?)))
            },
            Some(Compression::Bzip2) => {
                return Err(Error::unsupported("capture", "bzip2-compressed input"));
            },
            None => Box::new(BufReader::new(File::open(path)?)),
        };

        let backend = match detection.format {
            CaptureFormat::PcapClassic { .. } => {
                CaptureBackend::Pcap(PcapReader::new(input)?)
            },
            CaptureFormat::Pcapng => CaptureBackend::Pcapng(PcapngReader::new(input)?),
            CaptureFormat::Snoop => {
                return Err(Error::unsupported("capture", "Sun Snoop container"));
            },
            CaptureFormat::Erf => {
                return Err(Error::unsupported("capture", "Endace ERF container"));
            },
            CaptureFormat::Unknown => {
                return Err(Error::malformed("capture", "unrecognized magic number"));
            },
        };

        Ok(Self { backend })
    }

    pub fn from_backend(backend: CaptureBackend) -> Self {
        Self { backend }
    }

    pub fn next_record(&mut self) -> Result<Option<PacketRecord>> {
        self.backend.next_record()
    }

    pub fn interfaces(&self) -> &[InterfaceInfo] {
        self.backend.interfaces()
    }
}

impl Iterator for CaptureReader {
    type Item = Result<PacketRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.backend.next_record().transpose()
    }
}

/// Fills `buf` completely, or reports a clean end-of-stream when no bytes
/// were available at all. A partial fill is a truncation.
pub(crate) fn read_exact_or_eof<R: Read + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
    what: &str,
) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Error::TruncatedBlock(format!(
                "{what}: expected {} bytes, got {filled}",
                buf.len()
            )));
        }
        filled += n;
    }
    Ok(true)
}
