// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use telflow_rs::{
    capture::interface::{InterfaceClassifier, TrafficObservation},
    models::{ProtocolType, TelecomInterface},
};

#[test]
fn test_name_match_beats_traffic() {
    let mut obs = TrafficObservation::default();
    obs.observe_ports(17, 2152, 40000);
    // Traffic says S1-U, the name says Gx; the name wins.
    assert_eq!(
        InterfaceClassifier::classify("gx-pcrf", "", &obs),
        TelecomInterface::Gx
    );
    assert_eq!(
        InterfaceClassifier::classify("eth3", "", &obs),
        TelecomInterface::S1U
    );
}

#[test]
fn test_priority_order_sctp_before_gtp() {
    let mut obs = TrafficObservation::default();
    obs.observe_ports(132, 36412, 50000);
    obs.observe_ports(17, 2152, 50001);
    assert_eq!(
        InterfaceClassifier::classify_by_traffic(&obs),
        TelecomInterface::S1Mme
    );
}

#[test]
fn test_diameter_needs_observed_framing() {
    // Port 3868 alone is not enough without Diameter messages seen.
    let mut obs = TrafficObservation::default();
    obs.observe_ports(6, 45000, 3868);
    assert_eq!(
        InterfaceClassifier::classify_by_traffic(&obs),
        TelecomInterface::Unknown
    );

    obs.observe_protocol(ProtocolType::Diameter);
    assert_eq!(
        InterfaceClassifier::classify_by_traffic(&obs),
        TelecomInterface::S6a
    );
}

#[test]
fn test_diagnostics_for_every_kind() {
    for kind in [
        TelecomInterface::S1Mme,
        TelecomInterface::S1U,
        TelecomInterface::S5S8C,
        TelecomInterface::S6a,
        TelecomInterface::Gx,
        TelecomInterface::X2C,
        TelecomInterface::N2,
        TelecomInterface::N4,
        TelecomInterface::SGi,
        TelecomInterface::ImsSip,
        TelecomInterface::RtpMedia,
    ] {
        assert!(
            !InterfaceClassifier::well_known_ports(kind).is_empty(),
            "{kind} has no ports"
        );
        assert!(
            !InterfaceClassifier::expected_protocols(kind).is_empty(),
            "{kind} has no protocols"
        );
    }
}
