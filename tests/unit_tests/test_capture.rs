// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::io::Write;

use anyhow::Result;
use telflow_rs::capture::{
    format::{self, CaptureFormat, Compression},
    reader::{CaptureBackend, CaptureReader, RecordSource},
};

/// Classic PCAP bytes: little-endian microsecond format, Ethernet link.
fn classic_pcap(records: &[(u32, u32, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0xA1B2_C3D4u32.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&4u16.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&65_535u32.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());

    for (ts_sec, ts_usec, data) in records {
        out.extend_from_slice(&ts_sec.to_le_bytes());
        out.extend_from_slice(&ts_usec.to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
    }
    out
}

/// Minimal PCAPNG: SHB, one IDB with a name and tsresol, EPBs.
fn pcapng(if_name: &str, tsresol: u8, packets: &[(u64, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();

    let mut shb_body = Vec::new();
    shb_body.extend_from_slice(&0x1A2B_3C4Du32.to_le_bytes());
    shb_body.extend_from_slice(&1u16.to_le_bytes());
    shb_body.extend_from_slice(&0u16.to_le_bytes());
    shb_body.extend_from_slice(&(-1i64).to_le_bytes());
    push_block(&mut out, 0x0A0D_0D0A, &shb_body);

    let mut idb_body = Vec::new();
    idb_body.extend_from_slice(&1u16.to_le_bytes()); // ethernet
    idb_body.extend_from_slice(&0u16.to_le_bytes());
    idb_body.extend_from_slice(&65_535u32.to_le_bytes());
    push_option(&mut idb_body, 2, if_name.as_bytes()); // if_name
    push_option(&mut idb_body, 9, &[tsresol]); // if_tsresol
    push_option(&mut idb_body, 0, &[]);
    push_block(&mut out, 0x0000_0001, &idb_body);

    for (units, data) in packets {
        let mut epb_body = Vec::new();
        epb_body.extend_from_slice(&0u32.to_le_bytes());
        epb_body.extend_from_slice(&((units >> 32) as u32).to_le_bytes());
        epb_body.extend_from_slice(&((units & 0xFFFF_FFFF) as u32).to_le_bytes());
        epb_body.extend_from_slice(&(data.len() as u32).to_le_bytes());
        epb_body.extend_from_slice(&(data.len() as u32).to_le_bytes());
        epb_body.extend_from_slice(data);
        let pad = (4 - data.len() % 4) % 4;
        epb_body.extend(std::iter::repeat_n(0u8, pad));
        push_block(&mut out, 0x0000_0006, &epb_body);
    }

    out
}

fn push_block(out: &mut Vec<u8>, block_type: u32, body: &[u8]) {
    let total = (12 + body.len()) as u32;
    out.extend_from_slice(&block_type.to_le_bytes());
    out.extend_from_slice(&total.to_le_bytes());
    out.extend_from_slice(body);
    out.extend_from_slice(&total.to_le_bytes());
}

fn push_option(out: &mut Vec<u8>, code: u16, value: &[u8]) {
    out.extend_from_slice(&code.to_le_bytes());
    out.extend_from_slice(&(value.len() as u16).to_le_bytes());
    out.extend_from_slice(value);
    let pad = (4 - value.len() % 4) % 4;
    out.extend(std::iter::repeat_n(0u8, pad));
}

fn temp_file(name: &str, bytes: &[u8]) -> Result<std::path::PathBuf> {
    let path = std::env::temp_dir().join(format!(
        "telflow-test-{}-{name}",
        std::process::id()
    ));
    std::fs::write(&path, bytes)?;
    Ok(path)
}

#[test]
fn test_classic_pcap_roundtrip() -> Result<()> {
    let frame = [0u8; 60];
    let bytes = classic_pcap(&[(1_700_000_000, 250_000, &frame), (1_700_000_001, 0, &frame)]);
    let path = temp_file("classic.pcap", &bytes)?;

    let mut reader = CaptureReader::open(&path)?;
    let first = reader.next_record()?.expect("first record");
    assert_eq!(first.frame_number, 1);
    assert_eq!(first.link_type, 1);
    assert_eq!(first.data.len(), 60);
    assert_eq!(first.timestamp.timestamp(), 1_700_000_000);
    assert_eq!(first.timestamp.timestamp_subsec_micros(), 250_000);

    let second = reader.next_record()?.expect("second record");
    assert_eq!(second.frame_number, 2);
    assert!(reader.next_record()?.is_none());

    std::fs::remove_file(path)?;
    Ok(())
}

#[test]
fn test_pcapng_interface_and_tsresol() -> Result<()> {
    // tsresol 9 => nanosecond units.
    let units = 1_700_000_000_000_000_123u64;
    let bytes = pcapng("s1-mme", 9, &[(units, &[0u8; 42])]);
    let path = temp_file("iface.pcapng", &bytes)?;

    let mut reader = CaptureReader::open(&path)?;
    let record = reader.next_record()?.expect("record");
    assert_eq!(record.interface_id, Some(0));
    assert_eq!(record.timestamp.timestamp(), 1_700_000_000);
    assert_eq!(record.timestamp.timestamp_subsec_nanos(), 123);

    let interfaces = reader.interfaces();
    assert_eq!(interfaces.len(), 1);
    assert_eq!(interfaces[0].name.as_deref(), Some("s1-mme"));
    assert_eq!(interfaces[0].units_per_sec, 1_000_000_000);

    std::fs::remove_file(path)?;
    Ok(())
}

#[test]
fn test_pcapng_trailing_length_mismatch() -> Result<()> {
    let mut bytes = pcapng("x", 6, &[(0, &[0u8; 16])]);
    // Corrupt the trailing length of the last block.
    let len = bytes.len();
    bytes[len - 1] ^= 0xFF;
    let path = temp_file("broken.pcapng", &bytes)?;

    let mut reader = CaptureReader::open(&path)?;
    assert!(reader.next_record().is_err());

    std::fs::remove_file(path)?;
    Ok(())
}

#[test]
fn test_gzip_wrapped_pcap() -> Result<()> {
    let inner = classic_pcap(&[(1_700_000_000, 0, &[0u8; 20])]);
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&inner)?;
    let compressed = encoder.finish()?;
    let path = temp_file("wrapped.pcap.gz", &compressed)?;

    let detection = format::detect_file(&path)?;
    assert_eq!(detection.compression, Some(Compression::Gzip));
    assert!(matches!(detection.format, CaptureFormat::PcapClassic { .. }));

    let mut reader = CaptureReader::open(&path)?;
    let record = reader.next_record()?.expect("record");
    assert_eq!(record.data.len(), 20);
    assert!(reader.next_record()?.is_none());

    std::fs::remove_file(path)?;
    Ok(())
}

#[test]
fn test_unknown_format_rejected() -> Result<()> {
    let path = temp_file("garbage.bin", &[0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 0])?;
    assert!(CaptureReader::open(&path).is_err());
    std::fs::remove_file(path)?;
    Ok(())
}

#[test]
fn test_backend_enum_dispatch() -> Result<()> {
    let input: Box<dyn std::io::Read + Send> =
        Box::new(std::io::Cursor::new(classic_pcap(&[(1, 0, &[0u8; 14])])));
    let mut backend =
        CaptureBackend::Pcap(telflow_rs::capture::pcap::PcapReader::new(input)?);
    assert_eq!(backend.interfaces().len(), 1);
    assert!(backend.next_record()?.is_some());
    assert!(backend.next_record()?.is_none());
    Ok(())
}
