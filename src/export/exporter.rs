// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::BTreeSet, fs, path::Path};

use serde_json::{Value, json};
use tracing::info;

use crate::{
    correlation::{
        correlator::SessionCorrelator, master::MasterSession, tunnel::manager::TunnelManager,
    },
    models::error::Result,
};

/// Materializes master sessions as self-contained JSON records:
/// identifiers, participants, metrics, the timestamp-sorted timeline, and
/// per-child detail blocks (tunnels include their event timelines).
pub struct EventExporter;

impl EventExporter {
    /// One record per master session, ordered by start time.
    pub fn session_records(
        correlator: &SessionCorrelator,
        tunnels: &TunnelManager,
    ) -> Vec<Value> {
        let mut masters: Vec<&MasterSession> = correlator.sessions().collect();
        masters.sort_by_key(|m| (m.start_time, m.id));

        masters
            .iter()
            .map(|master| Self::session_record(master, correlator, tunnels))
            .collect()
    }

    pub fn session_record(
        master: &MasterSession,
        correlator: &SessionCorrelator,
        tunnels: &TunnelManager,
    ) -> Value {
        let timeline: Vec<Value> = master
            .sorted_timeline()
            .into_iter()
            .map(|m| {
                json!({
                    "timestamp_ms": m.timestamp.timestamp_millis(),
                    "interface": m.interface.as_str(),
                    "protocol": m.protocol.as_str(),
                    "message_type": m.message_type.as_str(),
                    "src": format!("{}:{}", m.src_ip, m.src_port),
                    "dst": format!("{}:{}", m.dst_ip, m.dst_port),
                    "frame": m.frame_number,
                    "details": m.parsed_data,
                })
            })
            .collect();

        let mut participants: BTreeSet<String> = BTreeSet::new();
        for m in &master.timeline {
            participants.insert(format!("{}:{}", m.src_ip, m.src_port));
            participants.insert(format!("{}:{}", m.dst_ip, m.dst_port));
        }

        let sip_calls: Vec<Value> = master
            .sip_calls
            .iter()
            .filter_map(|call_id| correlator.sip_call(call_id))
            .filter_map(|call| serde_json::to_value(call).ok())
            .collect();

        let diameter_dialogs: Vec<Value> = master
            .diameter_dialogs
            .iter()
            .filter_map(|id| correlator.diameter_dialog(id))
            .filter_map(|dialog| serde_json::to_value(dialog).ok())
            .collect();

        let ue_contexts: Vec<Value> = master
            .ue_contexts
            .iter()
            .filter_map(|key| correlator.ue_context(key))
            .filter_map(|context| serde_json::to_value(context).ok())
            .collect();

        let sba: Vec<Value> = master
            .sba_interactions
            .iter()
            .filter_map(|&index| correlator.sba_interaction(index))
            .filter_map(|interaction| serde_json::to_value(interaction).ok())
            .collect();

        let tunnel_records: Vec<Value> = master
            .tunnels
            .iter()
            .filter_map(|&teid| tunnels.tunnel(teid))
            .map(|tunnel| {
                let events: Vec<Value> = tunnels
                    .event_timeline(tunnel.teid_uplink)
                    .iter()
                    .filter_map(|e| serde_json::to_value(e).ok())
                    .collect();
                let stats = tunnels.echo_stats(tunnel.teid_uplink);
                let mut record = serde_json::to_value(tunnel).unwrap_or(Value::Null);
                if let Value::Object(map) = &mut record {
                    map.insert("events".to_string(), Value::Array(events));
                    map.insert(
                        "echo_stats".to_string(),
                        serde_json::to_value(stats).unwrap_or(Value::Null),
                    );
                }
                record
            })
            .collect();

        json!({
            "session_id": master.id,
            "start_time_ms": master.start_time.timestamp_millis(),
            "last_activity_ms": master.last_activity.timestamp_millis(),
            "identifiers": master.key,
            "participants": participants,
            "metrics": master.metrics,
            "children": {
                "gtp_tunnels": tunnel_records,
                "sip_calls": sip_calls,
                "diameter_dialogs": diameter_dialogs,
                "ue_contexts": ue_contexts,
                "sba_interactions": sba,
            },
            "timeline": timeline,
        })
    }

    /// Writes the record array as pretty JSON.
    pub fn export_to_file<P: AsRef<Path>>(path: P, records: &[Value]) -> Result<()> {
        if let Some(parent) = path.as_ref().parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(&Value::Array(records.to_vec()))
            .unwrap_or_else(|_| "[]".to_string());
        fs::write(path.as_ref(), body)?;
        info!(
            "exported {} session records to {:?}",
            records.len(),
            path.as_ref()
        );
        Ok(())
    }
}
