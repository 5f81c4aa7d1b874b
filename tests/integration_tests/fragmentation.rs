// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A SIP INVITE split across three IPv4 fragments reassembles into one
//! message.

use std::net::Ipv4Addr;

use telflow_rs::models::{MessageType, ProtocolType};

use super::common::{self, PcapWriter, fragmented_udp_frames};

const UE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 10);
const PCSCF: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 30);

#[test]
fn test_fragmented_invite_parses_once() {
    // A body large enough to need three 1480-byte fragments.
    let body = "x".repeat(3_300);
    let invite = format!(
        "INVITE sip:bob@ims.example.com SIP/2.0\r\n\
         Via: SIP/2.0/UDP 10.0.0.10:5060\r\n\
         From: <sip:alice@ims.example.com>;tag=f1\r\n\
         To: <sip:bob@ims.example.com>\r\n\
         Call-ID: frag@x\r\n\
         CSeq: 1 INVITE\r\n\
         Content-Length: {}\r\n\r\n{body}",
        body.len()
    );

    let frames = fragmented_udp_frames(
        UE,
        5060,
        PCSCF,
        5060,
        invite.as_bytes(),
        1_480,
        0x7711,
    );
    assert_eq!(frames.len(), 3, "fixture should produce three fragments");

    let mut pcap = PcapWriter::new();
    for (i, frame) in frames.iter().enumerate() {
        pcap.frame(i as u32, frame);
    }

    let path = pcap.write_temp("fragmentation");
    let run = common::run_capture(&path);
    common::cleanup(&path);

    assert!(run.warnings.is_empty(), "warnings: {:?}", run.warnings);

    let correlator = run.correlator.lock().expect("correlator");
    assert_eq!(correlator.session_count(), 1);

    // Exactly one SIP message came out of the three fragments.
    let master = correlator.sessions().next().expect("master");
    assert_eq!(master.timeline.len(), 1);
    assert_eq!(master.timeline[0].protocol, ProtocolType::Sip);
    assert_eq!(master.timeline[0].message_type, MessageType::SipInvite);
    assert_eq!(master.key.sip_call_id.as_deref(), Some("frag@x"));

    let call = correlator.sip_call("frag@x").expect("sip call");
    assert_eq!(call.message_count, 1);
}

#[test]
fn test_out_of_order_fragments_also_reassemble() {
    let body = "y".repeat(3_300);
    let invite = format!(
        "OPTIONS sip:ping@x SIP/2.0\r\n\
         Call-ID: frag2@x\r\n\
         CSeq: 7 OPTIONS\r\n\
         Content-Length: {}\r\n\r\n{body}",
        body.len()
    );

    let frames = fragmented_udp_frames(
        UE,
        5060,
        PCSCF,
        5060,
        invite.as_bytes(),
        1_480,
        0x7712,
    );

    let mut pcap = PcapWriter::new();
    // Last fragment first, then the rest.
    pcap.frame(0, &frames[2]);
    pcap.frame(1, &frames[0]);
    pcap.frame(2, &frames[1]);

    let path = pcap.write_temp("fragmentation-ooo");
    let run = common::run_capture(&path);
    common::cleanup(&path);

    let correlator = run.correlator.lock().expect("correlator");
    let master = correlator.sessions().next().expect("master");
    assert_eq!(master.timeline.len(), 1);
    assert_eq!(master.key.sip_call_id.as_deref(), Some("frag2@x"));
}
