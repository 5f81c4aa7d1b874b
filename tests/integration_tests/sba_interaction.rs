// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! 5G SBA over HTTP/2: a UDM authentication request/response pair.

use std::net::Ipv4Addr;

use telflow_rs::models::MessageType;

use super::common::{self, PcapWriter, h2, tcp_frame};

const AMF: Ipv4Addr = Ipv4Addr::new(10, 9, 0, 1);
const UDM: Ipv4Addr = Ipv4Addr::new(10, 9, 0, 2);
const PATH: &str =
    "/nudm-ueau/v1/supi-001010000000001/security-information/generate-auth-data";

#[test]
fn test_udm_auth_interaction() {
    let request_body = br#"{"servingNetworkName":"5G:mnc001.mcc001.3gppnetwork.org"}"#;
    let response_body = br#"{"authType":"5G_AKA","authenticationVector":{"rand":"00"}}"#;

    // Client side: preface, SETTINGS, HEADERS, DATA (END_STREAM).
    let mut client = h2::PREFACE.to_vec();
    client.extend_from_slice(&h2::frame(0x4, 0, 0, &[]));
    let request_headers = h2::headers_block(&[
        (":method", "POST"),
        (":scheme", "http"),
        (":authority", "udm.5gc.example.org"),
        (":path", PATH),
        ("content-type", "application/json"),
    ]);
    client.extend_from_slice(&h2::frame(0x1, 0x4, 1, &request_headers));
    client.extend_from_slice(&h2::frame(0x0, 0x1, 1, request_body));

    // Server side: SETTINGS, HEADERS, DATA (END_STREAM).
    let mut server = h2::frame(0x4, 0, 0, &[]);
    let response_headers = h2::headers_block(&[
        (":status", "200"),
        ("content-type", "application/json"),
    ]);
    server.extend_from_slice(&h2::frame(0x1, 0x4, 1, &response_headers));
    server.extend_from_slice(&h2::frame(0x0, 0x1, 1, response_body));

    let mut pcap = PcapWriter::new();
    // Split the client bytes mid-frame to exercise stream reassembly.
    let cut = client.len() / 2;
    pcap.frame(0, &tcp_frame(AMF, 51000, UDM, 80, 1_000, &client[..cut]));
    pcap.frame(
        5,
        &tcp_frame(AMF, 51000, UDM, 80, 1_000 + cut as u32, &client[cut..]),
    );
    pcap.frame(40, &tcp_frame(UDM, 80, AMF, 51000, 9_000, &server));

    let path = pcap.write_temp("sba");
    let run = common::run_capture(&path);
    common::cleanup(&path);

    assert!(run.warnings.is_empty(), "warnings: {:?}", run.warnings);

    let correlator = run.correlator.lock().expect("correlator");
    assert_eq!(correlator.session_count(), 1);

    let master = correlator.sessions().next().expect("master");
    assert_eq!(master.timeline.len(), 1);
    assert_eq!(master.timeline[0].message_type, MessageType::SbaInteraction);
    assert_eq!(master.sba_interactions.len(), 1);

    let interaction = correlator.sba_interaction(0).expect("interaction");
    assert_eq!(interaction.service, "nudm-ueau");
    assert_eq!(interaction.nf_type, "UDM");
    assert_eq!(interaction.api, "POST");
    assert_eq!(interaction.status, Some(200));
    assert_eq!(
        interaction.resource,
        "supi-001010000000001/security-information/generate-auth-data"
    );

    let request = interaction.request_body.as_ref().expect("request body");
    assert_eq!(
        request.pointer("/servingNetworkName").and_then(|v| v.as_str()),
        Some("5G:mnc001.mcc001.3gppnetwork.org")
    );
    let response = interaction.response_body.as_ref().expect("response body");
    assert_eq!(
        response.pointer("/authType").and_then(|v| v.as_str()),
        Some("5G_AKA")
    );
    assert!(interaction.latency_ms.is_some());
}
