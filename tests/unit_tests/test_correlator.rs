// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use telflow_rs::{
    correlation::{CorrelationKey, SessionMessageRef, master::MasterSession},
    models::{FiveTuple, MessageType, ProtocolType, TelecomInterface},
};

fn base() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).expect("time")
}

fn msg(ts: DateTime<Utc>, frame: u32, key: CorrelationKey) -> SessionMessageRef {
    SessionMessageRef::new(
        ts,
        TelecomInterface::Unknown,
        ProtocolType::Sip,
        MessageType::SipStatus,
        &FiveTuple::default(),
        frame,
        Value::Null,
        key,
    )
}

fn session(id: u64, imsi: &str, frames: &[u32]) -> MasterSession {
    let t0 = base();
    let mut master = MasterSession::new(id, t0);
    master.key.imsi = Some(imsi.to_string());
    for &frame in frames {
        let key = CorrelationKey {
            imsi: Some(imsi.to_string()),
            ..CorrelationKey::default()
        };
        master.record(&msg(t0 + Duration::seconds(i64::from(frame)), frame, key), 10);
    }
    master
}

fn timeline_frames(master: &MasterSession) -> Vec<u32> {
    master
        .sorted_timeline()
        .into_iter()
        .map(|m| m.frame_number)
        .collect()
}

/// Merge law: ids(A ∪ B) = ids(A) ∪ ids(B) and the timeline equals
/// sort(A.timeline ++ B.timeline).
#[test]
fn test_merge_identifier_union_and_timeline_sort() {
    let mut a = session(1, "001", &[5, 1]);
    a.key.msisdn = Some("441".to_string());
    let mut b = session(2, "001", &[3, 2]);
    b.key.sip_call_id = Some("c".to_string());

    a.absorb(b);

    assert_eq!(a.key.imsi.as_deref(), Some("001"));
    assert_eq!(a.key.msisdn.as_deref(), Some("441"));
    assert_eq!(a.key.sip_call_id.as_deref(), Some("c"));
    assert_eq!(timeline_frames(&a), vec![1, 2, 3, 5]);
}

/// Merging is commutative up to the surviving id: the identifier set and
/// sorted timeline agree both ways.
#[test]
fn test_merge_commutative() {
    let make_pair = || {
        let mut a = session(1, "001", &[1, 4]);
        a.key.msisdn = Some("111".to_string());
        let mut b = session(2, "001", &[2, 3]);
        b.key.sip_call_id = Some("c2".to_string());
        (a, b)
    };

    let (mut ab, b) = make_pair();
    ab.absorb(b);
    let (a, mut ba) = make_pair();
    ba.absorb(a);

    assert_eq!(ab.key, ba.key);
    assert_eq!(timeline_frames(&ab), timeline_frames(&ba));
    assert_eq!(ab.start_time, ba.start_time);
    assert_eq!(ab.metrics.total_packets, ba.metrics.total_packets);
}

/// Merging is associative: (A + B) + C == A + (B + C).
#[test]
fn test_merge_associative() {
    let make = || {
        (
            session(1, "001", &[1]),
            session(2, "001", &[2]),
            session(3, "001", &[3]),
        )
    };

    let (mut left, b, c) = make();
    left.absorb(b);
    left.absorb(c);

    let (a, mut right, c) = make();
    right.absorb(c);
    let mut a = a;
    a.absorb(right);

    assert_eq!(left.key, a.key);
    assert_eq!(timeline_frames(&left), timeline_frames(&a));
    assert_eq!(left.metrics.total_packets, a.metrics.total_packets);
}

/// Timeline superset invariant: every child-set element the master names
/// stays after a merge, and no timeline entry is dropped.
#[test]
fn test_merge_discards_nothing() {
    let mut a = session(1, "001", &[1, 2, 3]);
    a.tunnels.insert(0x11);
    a.sip_calls.insert("call-a".to_string());

    let mut b = session(2, "001", &[4, 5]);
    b.tunnels.insert(0x33);
    b.diameter_dialogs.insert("dia-b".to_string());

    let a_len = a.timeline.len();
    let b_len = b.timeline.len();
    a.absorb(b);

    assert_eq!(a.timeline.len(), a_len + b_len);
    assert!(a.tunnels.contains(&0x11));
    assert!(a.tunnels.contains(&0x33));
    assert!(a.sip_calls.contains("call-a"));
    assert!(a.diameter_dialogs.contains("dia-b"));
}
