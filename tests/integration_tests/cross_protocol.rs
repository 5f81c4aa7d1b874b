// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Cross-protocol correlation: GTP bearer, SIP call from the UE address,
//! and a Diameter dialog all collapse into one master session.

use std::net::Ipv4Addr;

use super::common::{self, PcapWriter, dia, gtp, tcp_frame, udp_frame};

const SGW: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 1);
const PGW: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 2);
const ENB_IP: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
const UE_IP: Ipv4Addr = Ipv4Addr::new(10, 45, 0, 2);
const PCSCF: Ipv4Addr = Ipv4Addr::new(10, 7, 0, 1);
const PCEF: Ipv4Addr = Ipv4Addr::new(10, 3, 0, 1);
const PCRF: Ipv4Addr = Ipv4Addr::new(10, 3, 0, 2);

const IMSI: &str = "001010000000001";
const MSISDN: &str = "441234567890";
const CALL_ID: &str = "abc@x";
const DIA_SESSION: &str = "pgw.example.org;1;1";
const UPLINK: u32 = 0x1111_1111;

#[test]
fn test_one_master_session_across_protocols() {
    // GTP: bearer for IMSI with UE IP allocation.
    let mut create_ies = gtp::imsi_ie(IMSI);
    create_ies.extend_from_slice(&gtp::apn_ie("ims"));
    create_ies.extend_from_slice(&gtp::paa_v4_ie(UE_IP));
    create_ies.extend_from_slice(&gtp::bearer_context_ie(
        5,
        Some(5),
        &[(gtp::IF_S1U_ENODEB, UPLINK, ENB_IP)],
    ));
    let create_req = gtp::header(gtp::CREATE_SESSION_REQUEST, Some(0), 1, &create_ies);
    let create_rsp = gtp::header(
        gtp::CREATE_SESSION_RESPONSE,
        Some(1),
        1,
        &gtp::bearer_context_ie(
            5,
            None,
            &[
                (gtp::IF_S1U_ENODEB, UPLINK, ENB_IP),
                (gtp::IF_S1U_SGW, 0x2222_2222, PGW),
            ],
        ),
    );

    // SIP: INVITE sourced from the UE's allocated address.
    let invite = format!(
        "INVITE sip:bob@ims.example.com SIP/2.0\r\n\
         Via: SIP/2.0/UDP 10.45.0.2:5060\r\n\
         From: <sip:alice@ims.example.com>;tag=c1\r\n\
         To: <sip:bob@ims.example.com>\r\n\
         Call-ID: {CALL_ID}\r\n\
         CSeq: 1 INVITE\r\n\
         Content-Length: 0\r\n\r\n"
    );

    // Diameter: CCR carrying the subscriber MSISDN.
    let ccr = dia::message(
        true,
        272,
        16_777_238,
        &[
            dia::avp(263, DIA_SESSION.as_bytes()),
            dia::avp(264, b"pcef.example.org"),
            dia::avp(296, b"example.org"),
            dia::subscription_id(0, MSISDN),
        ],
    );
    let cca = dia::message(
        false,
        272,
        16_777_238,
        &[dia::avp(263, DIA_SESSION.as_bytes())],
    );

    // SIP: 200 OK asserting the same MSISDN, bridging call and dialog.
    let ok = format!(
        "SIP/2.0 200 OK\r\n\
         Call-ID: {CALL_ID}\r\n\
         CSeq: 1 INVITE\r\n\
         P-Asserted-Identity: <tel:+{MSISDN}>\r\n\
         Content-Length: 0\r\n\r\n"
    );

    let mut pcap = PcapWriter::new();
    pcap.frame(0, &udp_frame(SGW, 2123, PGW, 2123, &create_req));
    pcap.frame(30, &udp_frame(PGW, 2123, SGW, 2123, &create_rsp));
    pcap.frame(1_000, &udp_frame(UE_IP, 5060, PCSCF, 5060, invite.as_bytes()));
    pcap.frame(1_100, &tcp_frame(PCEF, 45_000, PCRF, 3868, 500, &ccr));
    pcap.frame(1_150, &tcp_frame(PCRF, 3868, PCEF, 45_000, 900, &cca));
    pcap.frame(2_500, &udp_frame(PCSCF, 5060, UE_IP, 5060, ok.as_bytes()));

    let path = pcap.write_temp("cross-protocol");
    let run = common::run_capture(&path);
    common::cleanup(&path);

    assert!(run.warnings.is_empty(), "warnings: {:?}", run.warnings);

    let correlator = run.correlator.lock().expect("correlator");
    assert_eq!(
        correlator.session_count(),
        1,
        "all protocols should merge into one master"
    );

    let master = correlator.sessions().next().expect("master");
    assert_eq!(master.key.imsi.as_deref(), Some(IMSI));
    assert_eq!(master.key.ue_ipv4, Some(UE_IP));
    assert_eq!(master.key.msisdn.as_deref(), Some(MSISDN));
    assert_eq!(master.key.sip_call_id.as_deref(), Some(CALL_ID));
    assert_eq!(master.key.diameter_session_id.as_deref(), Some(DIA_SESSION));

    assert!(master.tunnels.contains(&UPLINK));
    assert_eq!(master.sip_calls.len(), 1);
    assert_eq!(master.diameter_dialogs.len(), 1);
    assert_eq!(master.timeline.len(), 6);

    let dialog = correlator.diameter_dialog(DIA_SESSION).expect("dialog");
    assert_eq!(dialog.requests, 1);
    assert_eq!(dialog.answers, 1);
    assert_eq!(dialog.outstanding_requests, 0);
}
