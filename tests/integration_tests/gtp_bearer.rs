// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! GTP bearer setup and teardown with a keep-alive stream in between.

use std::net::Ipv4Addr;

use telflow_rs::correlation::tunnel::types::TunnelState;

use super::common::{self, PcapWriter, gtp, udp_frame};

const SGW: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 1);
const PGW: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 2);
const ENB_IP: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
const IMSI: &str = "001010000000001";
const UPLINK: u32 = 0x1111_1111;
const DOWNLINK: u32 = 0x2222_2222;

#[test]
fn test_bearer_lifecycle_with_keepalives() {
    let mut create_req_ies = gtp::imsi_ie(IMSI);
    create_req_ies.extend_from_slice(&gtp::apn_ie("internet"));
    create_req_ies.extend_from_slice(&gtp::paa_v4_ie(Ipv4Addr::new(10, 45, 0, 2)));
    create_req_ies.extend_from_slice(&gtp::bearer_context_ie(
        5,
        Some(9),
        &[(gtp::IF_S1U_ENODEB, UPLINK, ENB_IP)],
    ));
    let create_req = gtp::header(gtp::CREATE_SESSION_REQUEST, Some(0), 1, &create_req_ies);

    let create_rsp_ies = gtp::bearer_context_ie(
        5,
        None,
        &[
            (gtp::IF_S1U_ENODEB, UPLINK, ENB_IP),
            (gtp::IF_S1U_SGW, DOWNLINK, PGW),
        ],
    );
    let create_rsp =
        gtp::header(gtp::CREATE_SESSION_RESPONSE, Some(1), 1, &create_rsp_ies);

    let mut pcap = PcapWriter::new();
    pcap.frame(0, &udp_frame(SGW, 2123, PGW, 2123, &create_req));
    pcap.frame(20, &udp_frame(PGW, 2123, SGW, 2123, &create_rsp));

    // Five echo pairs at 300 s intervals.
    for i in 0..5u32 {
        let at = 10_000 + i * 300_000;
        let echo_req = gtp::header(gtp::ECHO_REQUEST, None, 100 + i, &[]);
        let echo_rsp = gtp::header(gtp::ECHO_RESPONSE, None, 100 + i, &[]);
        pcap.frame(at, &udp_frame(SGW, 2123, PGW, 2123, &echo_req));
        pcap.frame(at + 15, &udp_frame(PGW, 2123, SGW, 2123, &echo_rsp));
    }

    let delete_req = gtp::header(gtp::DELETE_SESSION_REQUEST, Some(UPLINK), 9, &[]);
    let delete_rsp = gtp::header(gtp::DELETE_SESSION_RESPONSE, Some(UPLINK), 9, &[]);
    pcap.frame(1_500_000, &udp_frame(SGW, 2123, PGW, 2123, &delete_req));
    pcap.frame(1_500_020, &udp_frame(PGW, 2123, SGW, 2123, &delete_rsp));

    let path = pcap.write_temp("gtp-bearer");
    let run = common::run_capture(&path);
    common::cleanup(&path);

    let tunnels = run.tunnels.lock().expect("tunnels");
    let tunnel = tunnels.tunnel(UPLINK).expect("tunnel exists");

    assert_eq!(tunnel.state, TunnelState::Deleted);
    assert!(tunnel.deleted.is_some());
    assert_eq!(tunnel.teid_downlink, DOWNLINK);
    assert_eq!(tunnel.imsi.as_deref(), Some(IMSI));
    assert_eq!(tunnel.apn.as_deref(), Some("internet"));
    assert_eq!(tunnel.qci, Some(9));
    assert_eq!(tunnel.echo_request_count, 5);
    assert_eq!(tunnel.echo_response_count, 5);

    // First and last echoes are flagged; the middle three aggregate.
    let runs = tunnels.aggregated_keepalives(UPLINK);
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].echo_count, 3);
    assert!(runs[0].all_successful);
    assert_eq!(runs[0].avg_interval_sec, 300);

    let stats = tunnels.statistics();
    assert_eq!(stats.total_tunnels, 1);
    assert_eq!(stats.deleted_tunnels, 1);
    assert_eq!(stats.echo_requests, 5);
    assert_eq!(stats.echo_responses, 5);
    drop(tunnels);

    // The whole exchange correlates into one master session.
    let correlator = run.correlator.lock().expect("correlator");
    assert_eq!(correlator.session_count(), 1);
    let master = correlator.sessions().next().expect("master");
    assert_eq!(master.key.imsi.as_deref(), Some(IMSI));
    assert_eq!(master.timeline.len(), 14);
    assert!(master.tunnels.contains(&UPLINK));
}
