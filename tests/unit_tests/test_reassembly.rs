// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use chrono::{DateTime, Duration, Utc};
use telflow_rs::{
    models::FiveTuple,
    reassembly::{
        ip::{IpDatagram, IpReassembler},
        sctp::SctpReassembler,
        tcp::{TcpReassembler, TcpSegment},
    },
};

fn now() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).expect("time")
}

fn ipv4_fragment(id: u16, offset_bytes: u16, more: bool, payload: &[u8]) -> Vec<u8> {
    assert_eq!(offset_bytes % 8, 0);
    let mut pkt = vec![0u8; 20];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(20 + payload.len() as u16).to_be_bytes());
    pkt[4..6].copy_from_slice(&id.to_be_bytes());
    let field = (offset_bytes / 8) | if more { 0x2000 } else { 0 };
    pkt[6..8].copy_from_slice(&field.to_be_bytes());
    pkt[8] = 64;
    pkt[9] = 17;
    pkt[12..16].copy_from_slice(&[192, 0, 2, 1]);
    pkt[16..20].copy_from_slice(&[192, 0, 2, 2]);
    pkt.extend_from_slice(payload);
    pkt
}

/// The §8 invariant: when a completed datagram is returned, the key is no
/// longer present in the table, and emission happened exactly once.
#[test]
fn test_emit_exactly_once_then_erased() {
    let mut reassembler = IpReassembler::new(30);
    let ts = now();

    let f1 = ipv4_fragment(42, 0, true, &[1u8; 1480]);
    let f2 = ipv4_fragment(42, 1480, true, &[2u8; 1480]);
    let f3 = ipv4_fragment(42, 2960, false, &[3u8; 100]);

    assert_eq!(
        reassembler.process(&f1, ts).expect("f1"),
        IpDatagram::Pending
    );
    assert_eq!(
        reassembler.process(&f2, ts).expect("f2"),
        IpDatagram::Pending
    );
    let complete = reassembler.process(&f3, ts).expect("f3");
    match complete {
        IpDatagram::Reassembled(datagram) => {
            assert_eq!(datagram.len(), 20 + 1480 + 1480 + 100);
            assert_eq!(datagram[9], 17);
        },
        other => panic!("expected datagram, got {other:?}"),
    }
    assert_eq!(reassembler.pending_count(), 0);

    // Re-sending the last fragment starts a fresh bucket, not a repeat
    // emission.
    assert_eq!(
        reassembler.process(&f3, ts).expect("resend"),
        IpDatagram::Pending
    );
    assert_eq!(reassembler.pending_count(), 1);
}

#[test]
fn test_distinct_ids_do_not_mix() {
    let mut reassembler = IpReassembler::new(30);
    let ts = now();

    reassembler
        .process(&ipv4_fragment(1, 0, true, &[0u8; 8]), ts)
        .expect("a0");
    reassembler
        .process(&ipv4_fragment(2, 0, true, &[0u8; 8]), ts)
        .expect("b0");
    assert_eq!(reassembler.pending_count(), 2);

    let done = reassembler
        .process(&ipv4_fragment(1, 8, false, &[0u8; 8]), ts)
        .expect("a1");
    assert!(matches!(done, IpDatagram::Reassembled(_)));
    assert_eq!(reassembler.pending_count(), 1);
}

/// TCP invariant: after any call, buffered segments sit strictly above
/// `next_seq` (observable through what later drains).
#[test]
fn test_tcp_mid_stream_pickup_no_data_loss() {
    let mut tcp = TcpReassembler::new(120);
    let flow = FiveTuple {
        src_ip: "10.0.0.1".parse().expect("ip"),
        dst_ip: "10.0.0.2".parse().expect("ip"),
        src_port: 40000,
        dst_port: 5060,
        ip_protocol: 6,
    };
    let ts = now();

    // No SYN captured: the first observed seq becomes the baseline.
    let out = tcp.process_segment(
        &flow,
        TcpSegment {
            seq: 700_000,
            payload: b"INVITE ",
            syn: false,
            fin: false,
        },
        ts,
    );
    assert_eq!(out, b"INVITE ");

    let out = tcp.process_segment(
        &flow,
        TcpSegment {
            seq: 700_007,
            payload: b"sip:bob",
            syn: false,
            fin: false,
        },
        ts,
    );
    assert_eq!(out, b"sip:bob");
}

#[test]
fn test_tcp_interleaved_flows_stay_separate() {
    let mut tcp = TcpReassembler::new(120);
    let ts = now();
    let flow_a = FiveTuple {
        src_ip: "10.0.0.1".parse().expect("ip"),
        dst_ip: "10.0.0.2".parse().expect("ip"),
        src_port: 1111,
        dst_port: 5060,
        ip_protocol: 6,
    };
    let flow_b = flow_a.reversed();

    assert_eq!(
        tcp.process_segment(
            &flow_a,
            TcpSegment {
                seq: 10,
                payload: b"aaa",
                syn: false,
                fin: false
            },
            ts
        ),
        b"aaa"
    );
    assert_eq!(
        tcp.process_segment(
            &flow_b,
            TcpSegment {
                seq: 900,
                payload: b"bbb",
                syn: false,
                fin: false
            },
            ts
        ),
        b"bbb"
    );
    assert_eq!(tcp.stream_count(), 2);
}

#[test]
fn test_sctp_interleaved_streams() {
    let mut sctp = SctpReassembler::new(300);
    let flow = FiveTuple {
        src_ip: "10.2.0.1".parse().expect("ip"),
        dst_ip: "10.2.0.2".parse().expect("ip"),
        src_port: 36412,
        dst_port: 36412,
        ip_protocol: 132,
    };
    let ts = now();

    let packet = |flags: u8, tsn: u32, sid: u16, ssn: u16, payload: &[u8]| {
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&36412u16.to_be_bytes());
        pkt.extend_from_slice(&36412u16.to_be_bytes());
        pkt.extend_from_slice(&7u32.to_be_bytes());
        pkt.extend_from_slice(&[0; 4]);
        let chunk_len = 16 + payload.len();
        pkt.push(0);
        pkt.push(flags);
        pkt.extend_from_slice(&(chunk_len as u16).to_be_bytes());
        pkt.extend_from_slice(&tsn.to_be_bytes());
        pkt.extend_from_slice(&sid.to_be_bytes());
        pkt.extend_from_slice(&ssn.to_be_bytes());
        pkt.extend_from_slice(&18u32.to_be_bytes());
        pkt.extend_from_slice(payload);
        let pad = (4 - payload.len() % 4) % 4;
        pkt.extend(std::iter::repeat_n(0u8, pad));
        pkt
    };

    // Fragments of two different streams interleave on one association.
    assert!(sctp
        .process_packet(&flow, &packet(0x02, 1, 1, 0, b"S1-a"), ts)
        .expect("p")
        .is_empty());
    assert!(sctp
        .process_packet(&flow, &packet(0x02, 10, 2, 0, b"S2-a"), ts)
        .expect("p")
        .is_empty());

    let done = sctp
        .process_packet(&flow, &packet(0x01, 2, 1, 0, b"S1-b"), ts)
        .expect("p");
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].stream_id, 1);
    assert_eq!(done[0].data, b"S1-aS1-b");

    let done = sctp
        .process_packet(&flow, &packet(0x01, 11, 2, 0, b"S2-b"), ts)
        .expect("p");
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].stream_id, 2);
    assert_eq!(done[0].data, b"S2-aS2-b");
}

#[test]
fn test_fragment_timeout_drops_partial() {
    let mut reassembler = IpReassembler::new(30);
    let t0 = now();

    reassembler
        .process(&ipv4_fragment(5, 0, true, &[0u8; 16]), t0)
        .expect("frag");
    reassembler.cleanup(t0 + Duration::seconds(29));
    assert_eq!(reassembler.pending_count(), 1);
    reassembler.cleanup(t0 + Duration::seconds(31));
    assert_eq!(reassembler.pending_count(), 0);
}
