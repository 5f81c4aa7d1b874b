// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! X2 handover: a Modify Bearer Response flips the uplink TEID for an
//! IMSI that already owns a tunnel.

use std::net::Ipv4Addr;

use telflow_rs::correlation::tunnel::types::{HandoverQuality, HandoverType, TunnelState};

use super::common::{self, PcapWriter, gtp, udp_frame};

const SGW: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 1);
const PGW: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 2);
const OLD_ENB: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
const NEW_ENB: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 77);
const IMSI: &str = "001010000000001";
const OLD_TEID: u32 = 0x1111_1111;
const NEW_TEID: u32 = 0x3333_3333;
const SGW_TEID: u32 = 0x2222_2222;

#[test]
fn test_x2_handover_detected() {
    let mut create_req_ies = gtp::imsi_ie(IMSI);
    create_req_ies.extend_from_slice(&gtp::apn_ie("internet"));
    create_req_ies.extend_from_slice(&gtp::paa_v4_ie(Ipv4Addr::new(10, 45, 0, 9)));
    create_req_ies.extend_from_slice(&gtp::bearer_context_ie(
        5,
        Some(9),
        &[(gtp::IF_S1U_ENODEB, OLD_TEID, OLD_ENB)],
    ));
    let create_req = gtp::header(gtp::CREATE_SESSION_REQUEST, Some(0), 1, &create_req_ies);

    let create_rsp_ies = gtp::bearer_context_ie(
        5,
        None,
        &[
            (gtp::IF_S1U_ENODEB, OLD_TEID, OLD_ENB),
            (gtp::IF_S1U_SGW, SGW_TEID, PGW),
        ],
    );
    let create_rsp =
        gtp::header(gtp::CREATE_SESSION_RESPONSE, Some(1), 1, &create_rsp_ies);

    // Keep-alive at t=30 s marks the old tunnel's last activity.
    let echo_req = gtp::header(gtp::ECHO_REQUEST, None, 50, &[]);
    let echo_rsp = gtp::header(gtp::ECHO_RESPONSE, None, 50, &[]);

    // Modify Bearer Response at t=60 s carries the new eNodeB F-TEID.
    let mut modify_ies = gtp::imsi_ie(IMSI);
    modify_ies.extend_from_slice(&gtp::bearer_context_ie(
        5,
        None,
        &[
            (gtp::IF_S1U_ENODEB, NEW_TEID, NEW_ENB),
            (gtp::IF_S1U_SGW, SGW_TEID, PGW),
        ],
    ));
    let modify_rsp = gtp::header(gtp::MODIFY_BEARER_RESPONSE, Some(1), 2, &modify_ies);

    let mut pcap = PcapWriter::new();
    pcap.frame(0, &udp_frame(SGW, 2123, PGW, 2123, &create_req));
    pcap.frame(1_000, &udp_frame(PGW, 2123, SGW, 2123, &create_rsp));
    pcap.frame(30_000, &udp_frame(SGW, 2123, PGW, 2123, &echo_req));
    pcap.frame(30_015, &udp_frame(PGW, 2123, SGW, 2123, &echo_rsp));
    pcap.frame(60_000, &udp_frame(PGW, 2123, SGW, 2123, &modify_rsp));

    let path = pcap.write_temp("handover");
    let run = common::run_capture(&path);
    common::cleanup(&path);

    let tunnels = run.tunnels.lock().expect("tunnels");

    let old = tunnels.tunnel(OLD_TEID).expect("old tunnel");
    assert_eq!(old.handovers.len(), 1);
    let handover = &old.handovers[0];
    assert_eq!(handover.old_teid_uplink, OLD_TEID);
    assert_eq!(handover.new_teid_uplink, NEW_TEID);
    assert_eq!(handover.handover_type, HandoverType::X2);
    assert_eq!(handover.quality, HandoverQuality::Normal);
    // Interruption = handover time minus the old tunnel's last activity
    // (the echo at t=30.015 s).
    assert_eq!(handover.interruption_ms, 60_000 - 30_015);
    assert_eq!(handover.new_enb_ip, Some(NEW_ENB.into()));

    let new = tunnels.tunnel(NEW_TEID).expect("new tunnel");
    assert_eq!(new.state, TunnelState::Active);
    assert_eq!(new.imsi.as_deref(), Some(IMSI));
    assert_eq!(new.apn.as_deref(), Some("internet"));
    assert_eq!(new.qci, Some(9));

    // Both tunnels carry the same IMSI.
    assert_eq!(tunnels.tunnels_by_imsi(IMSI).len(), 2);
    drop(tunnels);

    // The master session references both tunnels.
    let correlator = run.correlator.lock().expect("correlator");
    assert_eq!(correlator.session_count(), 1);
    let master = correlator.sessions().next().expect("master");
    assert!(master.tunnels.contains(&OLD_TEID));
    assert!(master.tunnels.contains(&NEW_TEID));
}
