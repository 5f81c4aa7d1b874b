// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use hex_literal::hex;
use telflow_rs::{
    models::{MessageType, ProtocolType},
    parsers::{self, diameter, gtpv2, nas, rtp, s1ap, sip},
};

/// Each probe must reject the other protocols' framing.
#[test]
fn test_probe_matrix() {
    let sip_bytes = b"INVITE sip:bob@x SIP/2.0\r\nCall-ID: 1\r\n\r\n".to_vec();
    // GTPv2 echo request: version 2, no TEID.
    let gtp_bytes = hex!("40 01 0004 000001 00").to_vec();
    // Diameter CER header only.
    let mut dia_bytes = vec![0x01, 0x00, 0x00, 0x14];
    dia_bytes.extend_from_slice(&hex!("80 000101 00000000 00001111 00002222"));
    // RTP packet, PT 0.
    let mut rtp_bytes = hex!("80 00 0001 00000000 1234abcd").to_vec();
    rtp_bytes.extend_from_slice(&[0u8; 16]);

    let samples: Vec<(&[u8], ProtocolType)> = vec![
        (&sip_bytes[..], ProtocolType::Sip),
        (&gtp_bytes[..], ProtocolType::GtpC),
        (&dia_bytes[..], ProtocolType::Diameter),
        (&rtp_bytes[..], ProtocolType::Rtp),
    ];

    for (bytes, expected) in &samples {
        assert_eq!(parsers::detect(bytes), *expected);
    }
}

#[test]
fn test_gtpv2_echo_wire_format() -> Result<()> {
    // flags(version 2), type 1, length 4, sequence 0x000001, spare.
    let raw = hex!("40 01 0004 000001 00");
    let msg = gtpv2::parse(&raw)?;
    assert_eq!(msg.message_type(), MessageType::GtpEchoRequest);
    assert_eq!(msg.sequence, 1);
    assert!(msg.teid.is_none());
    Ok(())
}

#[test]
fn test_gtpv2_imsi_ie_wire_format() -> Result<()> {
    // Create Session Request with TEID 0 and one IMSI IE holding
    // 001010123456789 in TBCD.
    let raw = hex!(
        "48 20 0014 00000000 000002 00"
        "01 0008 00 00 01 01 21 43 65 87 f9"
    );
    let msg = gtpv2::parse(&raw)?;
    assert_eq!(msg.message_type(), MessageType::GtpCreateSessionRequest);
    assert_eq!(msg.imsi.as_deref(), Some("001010123456789"));
    Ok(())
}

#[test]
fn test_diameter_header_fields() -> Result<()> {
    // Version 1, length 20, R flag, command 257 (CER), app 0.
    let raw = hex!("01 000014 80 000101 00000000 0000aaaa 0000bbbb");
    let msg = diameter::parse(&raw)?;
    assert!(msg.is_request);
    assert_eq!(msg.command_code, 257);
    assert_eq!(msg.application_id, 0);
    assert_eq!(msg.hop_by_hop_id, 0xAAAA);
    assert_eq!(msg.end_to_end_id, 0xBBBB);
    Ok(())
}

#[test]
fn test_rtp_rejects_rtcp_payload_types() {
    // PT 72..76 with marker bit would alias RTCP 200..204.
    let mut pkt = hex!("80 c8 0001 00000000 00000001").to_vec();
    pkt.extend_from_slice(&[0u8; 8]);
    assert!(!rtp::probe_rtp(&pkt));
    assert!(rtp::probe_rtcp(&pkt));
}

#[test]
fn test_nas_in_s1ap_transport() -> Result<()> {
    // An Initial UE Message wrapping an Attach Request; the NAS identity
    // surfaces through the transport parse.
    let nas_pdu = {
        // Plain EMM attach request, IMSI 001010000000001.
        let mut out = vec![0x07, 0x41, 0x71];
        let identity = hex!("09 10 10 00 00 00 00 10");
        out.push(identity.len() as u8);
        out.extend_from_slice(&identity);
        out
    };

    let mut body = vec![0u8];
    body.extend_from_slice(&1u16.to_be_bytes());
    // IE: id 26 (NAS-PDU), criticality, short length.
    body.extend_from_slice(&26u16.to_be_bytes());
    body.push(0x40);
    body.push(nas_pdu.len() as u8);
    body.extend_from_slice(&nas_pdu);

    let mut raw = vec![0x00, 12, 0x40];
    raw.push(body.len() as u8);
    raw.extend_from_slice(&body);

    let msg = s1ap::parse(&raw, s1ap::RanProtocol::S1ap)?;
    assert_eq!(msg.message_type(), MessageType::S1apInitialUeMessage);
    assert_eq!(msg.nas_pdus.len(), 1);

    let nas = nas::parse(&msg.nas_pdus[0])?;
    assert_eq!(nas.imsi.as_deref(), Some("001010000000001"));
    Ok(())
}

#[test]
fn test_sip_deterministic_reparse() -> Result<()> {
    let raw = b"INVITE sip:bob@example.com SIP/2.0\r\n\
        Call-ID: det@x\r\n\
        From: <sip:alice@example.com>\r\n\
        CSeq: 1 INVITE\r\n\
        Content-Length: 0\r\n\r\n";

    let first = sip::parse(raw)?;
    let second = sip::parse(raw)?;
    assert_eq!(
        serde_json::to_value(&first)?,
        serde_json::to_value(&second)?
    );
    Ok(())
}
