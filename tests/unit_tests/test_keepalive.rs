// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use chrono::{DateTime, Duration, Utc};
use telflow_rs::correlation::tunnel::keepalive::KeepAliveAggregator;

fn base() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).expect("base time")
}

/// A long steady stream collapses into one run covering everything but
/// the first and last echo.
#[test]
fn test_long_stream_collapses() {
    let mut agg = KeepAliveAggregator::new(3);
    let t0 = base();
    const TEID: u32 = 0xAB;
    const COUNT: i64 = 200;

    for i in 0..COUNT {
        let req = t0 + Duration::seconds(300 * i);
        agg.add_echo_request(TEID, req);
        agg.add_echo_response(TEID, req + Duration::milliseconds(12));
    }
    agg.finalize_tunnel(TEID);

    let runs = agg.aggregates(TEID);
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].echo_count, (COUNT - 2) as u32);
    assert!(runs[0].all_successful);
    assert_eq!(runs[0].avg_interval_sec, 300);

    // First and last stay individually visible.
    let flagged = agg.individual_echoes(TEID);
    assert_eq!(flagged.len(), 2);
    assert_eq!(flagged[0].request_time, t0);
    assert_eq!(
        flagged[1].request_time,
        t0 + Duration::seconds(300 * (COUNT - 1))
    );
}

/// An interval change splits the stream into two runs around the flagged
/// echo.
#[test]
fn test_interval_change_splits_runs() {
    let mut agg = KeepAliveAggregator::new(3);
    let t0 = base();
    const TEID: u32 = 0xCD;

    let mut ts = t0;
    for i in 0..10 {
        if i > 0 {
            ts += Duration::seconds(60);
        }
        agg.add_echo_request(TEID, ts);
        agg.add_echo_response(TEID, ts + Duration::milliseconds(5));
    }
    // Jump to a 300 s cadence.
    for _ in 0..10 {
        ts += Duration::seconds(300);
        agg.add_echo_request(TEID, ts);
        agg.add_echo_response(TEID, ts + Duration::milliseconds(5));
    }
    agg.finalize_tunnel(TEID);

    let runs = agg.aggregates(TEID);
    assert_eq!(runs.len(), 2, "expected a split around the cadence change");
    assert_eq!(runs[0].avg_interval_sec, 60);
    assert_eq!(runs[1].avg_interval_sec, 300);

    let stats = agg.echo_stats(TEID);
    assert_eq!(stats.request_count, 20);
    assert_eq!(stats.response_count, 20);
}

/// Unanswered echo in the middle becomes a timeout and breaks the run.
#[test]
fn test_timeout_breaks_run_and_counts() {
    let mut agg = KeepAliveAggregator::new(3);
    let t0 = base();
    const TEID: u32 = 0xEF;

    for i in 0..4 {
        let req = t0 + Duration::seconds(60 * i);
        agg.add_echo_request(TEID, req);
        agg.add_echo_response(TEID, req + Duration::milliseconds(8));
    }
    // Lost echo: no response, and the next request comes 400 s later
    // (over 3 x 60 s).
    agg.add_echo_request(TEID, t0 + Duration::seconds(240));
    let resume = t0 + Duration::seconds(640);
    for i in 0..4 {
        let req = resume + Duration::seconds(60 * i);
        agg.add_echo_request(TEID, req);
        agg.add_echo_response(TEID, req + Duration::milliseconds(8));
    }
    agg.finalize_tunnel(TEID);

    let stats = agg.echo_stats(TEID);
    assert_eq!(stats.request_count, 9);
    assert_eq!(stats.response_count, 8);
    assert_eq!(stats.timeout_count, 1);

    let runs = agg.aggregates(TEID);
    assert!(runs.len() >= 2);
    for run in &runs {
        assert!(run.echo_count >= 1);
        assert!(run.start_time <= run.end_time);
    }
}
