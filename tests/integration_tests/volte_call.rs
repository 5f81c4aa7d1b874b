// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A simple VoLTE call: INVITE, 180 Ringing, 200 OK with SDP, 20 RTP
//! packets on the negotiated port, BYE.

use std::net::Ipv4Addr;

use telflow_rs::{
    correlation::children::SipCallState,
    models::{MessageType, ProtocolType},
};

use super::common::{self, PcapWriter, rtp_packet, udp_frame};

const UE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 10);
const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 20);

fn sip(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}

#[test]
fn test_simple_volte_call() {
    let invite = sip(
        "INVITE sip:bob@ims.example.com SIP/2.0\r\n\
         Via: SIP/2.0/UDP 10.0.0.10:5060\r\n\
         From: \"Alice\" <sip:+441234567890@ims.example.com>;tag=a1\r\n\
         To: <sip:bob@ims.example.com>\r\n\
         Call-ID: abc@x\r\n\
         CSeq: 1 INVITE\r\n\
         Content-Length: 0\r\n\r\n",
    );
    let ringing = sip(
        "SIP/2.0 180 Ringing\r\n\
         Call-ID: abc@x\r\n\
         CSeq: 1 INVITE\r\n\
         Content-Length: 0\r\n\r\n",
    );
    let sdp_body = "v=0\r\n\
         s=call\r\n\
         c=IN IP4 10.0.0.20\r\n\
         m=audio 49170 RTP/AVP 0\r\n";
    let ok = sip(&format!(
        "SIP/2.0 200 OK\r\n\
         Call-ID: abc@x\r\n\
         CSeq: 1 INVITE\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: {}\r\n\r\n{sdp_body}",
        sdp_body.len()
    ));
    let bye = sip(
        "BYE sip:bob@ims.example.com SIP/2.0\r\n\
         Call-ID: abc@x\r\n\
         CSeq: 2 BYE\r\n\
         Content-Length: 0\r\n\r\n",
    );

    let mut pcap = PcapWriter::new();
    pcap.frame(0, &udp_frame(UE, 5060, PEER, 5060, &invite));
    pcap.frame(500, &udp_frame(PEER, 5060, UE, 5060, &ringing));
    pcap.frame(2_000, &udp_frame(PEER, 5060, UE, 5060, &ok));
    for i in 0..20u32 {
        pcap.frame(
            3_000 + i * 20,
            &udp_frame(UE, 49170, PEER, 49170, &rtp_packet(i as u16, i * 160, 0x1234)),
        );
    }
    pcap.frame(10_000, &udp_frame(UE, 5060, PEER, 5060, &bye));

    let path = pcap.write_temp("volte");
    let run = common::run_capture(&path);
    common::cleanup(&path);

    assert!(run.warnings.is_empty(), "warnings: {:?}", run.warnings);

    let correlator = run.correlator.lock().expect("correlator");
    assert_eq!(correlator.session_count(), 1, "expected one master session");

    let master = correlator.sessions().next().expect("master");
    assert_eq!(master.timeline.len(), 24);
    assert_eq!(master.key.sip_call_id.as_deref(), Some("abc@x"));
    assert_eq!(master.key.msisdn.as_deref(), Some("441234567890"));

    // Timeline is timestamp-ordered: INVITE first, BYE last.
    let sorted = master.sorted_timeline();
    assert_eq!(sorted[0].message_type, MessageType::SipInvite);
    assert_eq!(sorted[23].message_type, MessageType::SipBye);
    let rtp_count = sorted
        .iter()
        .filter(|m| m.protocol == ProtocolType::Rtp)
        .count();
    assert_eq!(rtp_count, 20);

    let call = correlator.sip_call("abc@x").expect("sip call child");
    assert_eq!(call.state, SipCallState::Terminated);
    assert_eq!(call.setup_time_ms, Some(2_000));
    assert_eq!(call.rtp_packets, 20);
    assert_eq!(call.rtp_packet_loss, 0.0);
    assert!(call.rtp_jitter_ms >= 0.0);

    assert_eq!(master.metrics.setup_time_ms, Some(2_000));
    assert_eq!(master.metrics.rtp_packet_loss, 0.0);
    assert_eq!(master.metrics.total_packets, 24);
}
