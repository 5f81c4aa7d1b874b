// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared fixture builders: a classic-PCAP writer, Ethernet/IPv4 frame
//! builders, and wire-level message builders for the protocols the
//! scenarios exercise.

use std::{
    net::Ipv4Addr,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use telflow_rs::{
    capture::reader::CaptureReader,
    cfg::config::Config,
    correlation::{correlator::SessionCorrelator, tunnel::manager::TunnelManager},
    pipeline::processor::{PacketProcessor, ProcessorCounters},
};

/// Fixed capture epoch so scenarios are deterministic.
pub const BASE_SEC: u32 = 1_700_000_000;

// ---------------------------------------------------------------- pcap

pub struct PcapWriter {
    buf: Vec<u8>,
}

impl Default for PcapWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl PcapWriter {
    /// Little-endian classic PCAP, microsecond timestamps, Ethernet.
    pub fn new() -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0xA1B2_C3D4u32.to_le_bytes());
        buf.extend_from_slice(&2u16.to_le_bytes());
        buf.extend_from_slice(&4u16.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&65_535u32.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        Self { buf }
    }

    /// Appends a frame at `BASE_SEC + offset_ms`.
    pub fn frame(&mut self, offset_ms: u32, data: &[u8]) {
        let sec = BASE_SEC + offset_ms / 1_000;
        let usec = (offset_ms % 1_000) * 1_000;
        self.buf.extend_from_slice(&sec.to_le_bytes());
        self.buf.extend_from_slice(&usec.to_le_bytes());
        self.buf
            .extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.buf
            .extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(data);
    }

    pub fn write_temp(&self, name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "telflow-it-{}-{name}.pcap",
            std::process::id()
        ));
        std::fs::write(&path, &self.buf).expect("write capture fixture");
        path
    }
}

// -------------------------------------------------------------- frames

fn ipv4_header(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload_len: usize) -> Vec<u8> {
    let mut hdr = vec![0u8; 20];
    hdr[0] = 0x45;
    hdr[2..4].copy_from_slice(&((20 + payload_len) as u16).to_be_bytes());
    hdr[8] = 64;
    hdr[9] = protocol;
    hdr[12..16].copy_from_slice(&src.octets());
    hdr[16..20].copy_from_slice(&dst.octets());
    hdr
}

fn ethernet(ip_packet: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; 12];
    frame.extend_from_slice(&0x0800u16.to_be_bytes());
    frame.extend_from_slice(ip_packet);
    frame
}

pub fn udp_frame(
    src: Ipv4Addr,
    sport: u16,
    dst: Ipv4Addr,
    dport: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut udp = Vec::with_capacity(8 + payload.len());
    udp.extend_from_slice(&sport.to_be_bytes());
    udp.extend_from_slice(&dport.to_be_bytes());
    udp.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(payload);

    let mut packet = ipv4_header(src, dst, 17, udp.len());
    packet.extend_from_slice(&udp);
    ethernet(&packet)
}

pub fn tcp_frame(
    src: Ipv4Addr,
    sport: u16,
    dst: Ipv4Addr,
    dport: u16,
    seq: u32,
    payload: &[u8],
) -> Vec<u8> {
    let mut tcp = vec![0u8; 20];
    tcp[0..2].copy_from_slice(&sport.to_be_bytes());
    tcp[2..4].copy_from_slice(&dport.to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[12] = 0x50;
    tcp[13] = 0x18; // PSH|ACK
    tcp.extend_from_slice(payload);

    let mut packet = ipv4_header(src, dst, 6, tcp.len());
    packet.extend_from_slice(&tcp);
    ethernet(&packet)
}

/// Fragments one UDP datagram (header + payload) into Ethernet frames
/// with the given IP-payload chunk size.
pub fn fragmented_udp_frames(
    src: Ipv4Addr,
    sport: u16,
    dst: Ipv4Addr,
    dport: u16,
    payload: &[u8],
    chunk: usize,
    ip_id: u16,
) -> Vec<Vec<u8>> {
    let mut datagram = Vec::with_capacity(8 + payload.len());
    datagram.extend_from_slice(&sport.to_be_bytes());
    datagram.extend_from_slice(&dport.to_be_bytes());
    datagram.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    datagram.extend_from_slice(&[0, 0]);
    datagram.extend_from_slice(payload);

    let mut frames = Vec::new();
    let mut offset = 0usize;
    while offset < datagram.len() {
        let end = (offset + chunk).min(datagram.len());
        let more = end < datagram.len();

        let mut hdr = ipv4_header(src, dst, 17, end - offset);
        hdr[4..6].copy_from_slice(&ip_id.to_be_bytes());
        let field = ((offset / 8) as u16) | if more { 0x2000 } else { 0 };
        hdr[6..8].copy_from_slice(&field.to_be_bytes());

        let mut packet = hdr;
        packet.extend_from_slice(&datagram[offset..end]);
        frames.push(ethernet(&packet));
        offset = end;
    }
    frames
}

// ------------------------------------------------------------ gtpv2 wire

pub mod gtp {
    use std::net::Ipv4Addr;

    pub const ECHO_REQUEST: u8 = 1;
    pub const ECHO_RESPONSE: u8 = 2;
    pub const CREATE_SESSION_REQUEST: u8 = 32;
    pub const CREATE_SESSION_RESPONSE: u8 = 33;
    pub const MODIFY_BEARER_RESPONSE: u8 = 35;
    pub const DELETE_SESSION_REQUEST: u8 = 36;
    pub const DELETE_SESSION_RESPONSE: u8 = 37;

    pub const IF_S1U_ENODEB: u8 = 0;
    pub const IF_S1U_SGW: u8 = 1;

    pub fn header(message_type: u8, teid: Option<u32>, seq: u32, ies: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(0x40 | if teid.is_some() { 0x08 } else { 0x00 });
        out.push(message_type);
        let body_len = ies.len() + if teid.is_some() { 8 } else { 4 };
        out.extend_from_slice(&(body_len as u16).to_be_bytes());
        if let Some(teid) = teid {
            out.extend_from_slice(&teid.to_be_bytes());
        }
        out.extend_from_slice(&seq.to_be_bytes()[1..]);
        out.push(0);
        out.extend_from_slice(ies);
        out
    }

    pub fn ie(ie_type: u8, value: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + value.len());
        out.push(ie_type);
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.push(0);
        out.extend_from_slice(value);
        out
    }

    pub fn tbcd(digits: &str) -> Vec<u8> {
        let nibbles: Vec<u8> = digits.bytes().map(|b| b - b'0').collect();
        let mut out = Vec::new();
        for pair in nibbles.chunks(2) {
            let low = pair[0];
            let high = pair.get(1).copied().unwrap_or(0x0F);
            out.push(high << 4 | low);
        }
        out
    }

    pub fn imsi_ie(imsi: &str) -> Vec<u8> {
        ie(1, &tbcd(imsi))
    }

    pub fn apn_ie(apn: &str) -> Vec<u8> {
        let mut value = Vec::new();
        for label in apn.split('.') {
            value.push(label.len() as u8);
            value.extend_from_slice(label.as_bytes());
        }
        ie(71, &value)
    }

    pub fn paa_v4_ie(addr: Ipv4Addr) -> Vec<u8> {
        let mut value = vec![1u8];
        value.extend_from_slice(&addr.octets());
        ie(79, &value)
    }

    pub fn fteid(interface_type: u8, teid: u32, addr: Ipv4Addr) -> Vec<u8> {
        let mut value = vec![0x80 | interface_type];
        value.extend_from_slice(&teid.to_be_bytes());
        value.extend_from_slice(&addr.octets());
        value
    }

    pub fn bearer_context_ie(
        ebi: u8,
        qci: Option<u8>,
        fteids: &[(u8, u32, Ipv4Addr)],
    ) -> Vec<u8> {
        let mut inner = ie(73, &[ebi]);
        if let Some(qci) = qci {
            let mut qos = vec![0u8, qci];
            qos.extend_from_slice(&[0; 20]);
            inner.extend_from_slice(&ie(80, &qos));
        }
        for (itype, teid, addr) in fteids {
            inner.extend_from_slice(&ie(87, &fteid(*itype, *teid, *addr)));
        }
        ie(93, &inner)
    }
}

// --------------------------------------------------------- diameter wire

pub mod dia {
    pub fn avp(code: u32, value: &[u8]) -> Vec<u8> {
        let len = 8 + value.len();
        let mut out = Vec::with_capacity(len.div_ceil(4) * 4);
        out.extend_from_slice(&code.to_be_bytes());
        out.push(0x40);
        out.extend_from_slice(&(len as u32).to_be_bytes()[1..]);
        out.extend_from_slice(value);
        out.resize(len.div_ceil(4) * 4, 0);
        out
    }

    pub fn subscription_id(id_type: u32, data: &str) -> Vec<u8> {
        let mut inner = avp(450, &id_type.to_be_bytes());
        inner.extend_from_slice(&avp(444, data.as_bytes()));
        avp(443, &inner)
    }

    pub fn message(
        is_request: bool,
        command_code: u32,
        application_id: u32,
        avps: &[Vec<u8>],
    ) -> Vec<u8> {
        let mut body = Vec::new();
        for avp in avps {
            body.extend_from_slice(avp);
        }
        let total = 20 + body.len();

        let mut out = Vec::with_capacity(total);
        out.push(1);
        out.extend_from_slice(&(total as u32).to_be_bytes()[1..]);
        out.push(if is_request { 0x80 } else { 0x00 });
        out.extend_from_slice(&command_code.to_be_bytes()[1..]);
        out.extend_from_slice(&application_id.to_be_bytes());
        out.extend_from_slice(&0x1010u32.to_be_bytes());
        out.extend_from_slice(&0x2020u32.to_be_bytes());
        out.extend_from_slice(&body);
        out
    }
}

// ------------------------------------------------------------ http2 wire

pub mod h2 {
    pub const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

    pub fn frame(frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + payload.len());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes()[1..]);
        out.push(frame_type);
        out.push(flags);
        out.extend_from_slice(&stream_id.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    /// Literal never-indexed header block with plain string encoding.
    pub fn headers_block(pairs: &[(&str, &str)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, value) in pairs {
            out.push(0x10);
            out.push(name.len() as u8);
            out.extend_from_slice(name.as_bytes());
            out.push(value.len() as u8);
            out.extend_from_slice(value.as_bytes());
        }
        out
    }
}

// -------------------------------------------------------------- rtp wire

pub fn rtp_packet(seq: u16, ts: u32, ssrc: u32) -> Vec<u8> {
    let mut pkt = vec![0x80, 0x00];
    pkt.extend_from_slice(&seq.to_be_bytes());
    pkt.extend_from_slice(&ts.to_be_bytes());
    pkt.extend_from_slice(&ssrc.to_be_bytes());
    pkt.extend_from_slice(&[0u8; 160]);
    pkt
}

// ------------------------------------------------------------ pipeline

pub struct CaptureRun {
    pub correlator: Arc<Mutex<SessionCorrelator>>,
    pub tunnels: Arc<Mutex<TunnelManager>>,
    pub counters: ProcessorCounters,
    pub warnings: Vec<String>,
}

/// Runs a capture file through the full single-worker pipeline.
pub fn run_capture(path: &std::path::Path) -> CaptureRun {
    let config = Config::default();
    let correlator = Arc::new(Mutex::new(SessionCorrelator::new(&config)));
    let tunnels = Arc::new(Mutex::new(TunnelManager::new(&config)));
    let mut processor =
        PacketProcessor::new(&config, Arc::clone(&correlator), Arc::clone(&tunnels));

    let mut reader = CaptureReader::open(path).expect("open capture");
    processor.register_interfaces(reader.interfaces());
    while let Some(record) = reader.next_record().expect("read record") {
        processor.process_record(&record);
    }
    processor.finalize();

    CaptureRun {
        correlator,
        tunnels,
        counters: processor.counters(),
        warnings: processor.take_warnings(),
    }
}

pub fn cleanup(path: &std::path::Path) {
    let _ = std::fs::remove_file(path);
}
