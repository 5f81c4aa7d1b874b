// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::{
    models::{MessageType, ProtocolType},
    parsers::{nas::NasMessage, sip::SipMessage},
};

/// SIP dialog lifecycle, driven by methods and status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SipCallState {
    Initial,
    Inviting,
    Ringing,
    Answered,
    Terminated,
}

#[derive(Debug, Clone, Serialize)]
pub struct SipCall {
    pub call_id: String,
    pub state: SipCallState,
    pub invite_at: Option<DateTime<Utc>>,
    pub answered_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    /// First INVITE to first 200 OK.
    pub setup_time_ms: Option<i64>,
    pub msisdns: BTreeSet<String>,
    pub rtp_packets: u64,
    pub rtp_packet_loss: f64,
    pub rtp_jitter_ms: f64,
    pub message_count: u64,
}

impl SipCall {
    pub fn new(call_id: String) -> Self {
        Self {
            call_id,
            state: SipCallState::Initial,
            invite_at: None,
            answered_at: None,
            terminated_at: None,
            setup_time_ms: None,
            msisdns: BTreeSet::new(),
            rtp_packets: 0,
            rtp_packet_loss: 0.0,
            rtp_jitter_ms: 0.0,
            message_count: 0,
        }
    }

    pub fn on_message(&mut self, msg: &SipMessage, ts: DateTime<Utc>) {
        self.message_count += 1;

        for identity in msg.identities() {
            let digits = identity.username.trim_start_matches('+');
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                self.msisdns.insert(digits.to_string());
            }
        }

        match msg.message_type() {
            MessageType::SipInvite => {
                if self.invite_at.is_none() {
                    self.invite_at = Some(ts);
                }
                if self.state == SipCallState::Initial {
                    self.state = SipCallState::Inviting;
                }
            },
            MessageType::SipRinging => {
                if self.state == SipCallState::Inviting {
                    self.state = SipCallState::Ringing;
                }
            },
            MessageType::SipOk => {
                if matches!(
                    self.state,
                    SipCallState::Inviting | SipCallState::Ringing
                ) {
                    self.state = SipCallState::Answered;
                    self.answered_at = Some(ts);
                    if let Some(invite_at) = self.invite_at {
                        self.setup_time_ms =
                            Some((ts - invite_at).num_milliseconds());
                    }
                }
            },
            MessageType::SipBye | MessageType::SipCancel => {
                self.state = SipCallState::Terminated;
                self.terminated_at = Some(ts);
            },
            _ => {},
        }
    }

    pub fn apply_rtp_stats(&mut self, packets: u64, loss: f64, jitter_ms: f64) {
        self.rtp_packets += packets;
        self.rtp_packet_loss = self.rtp_packet_loss.max(loss);
        self.rtp_jitter_ms = self.rtp_jitter_ms.max(jitter_ms);
    }
}

/// One Diameter dialog per Session-Id; command pairs drive an
/// outstanding-request counter.
#[derive(Debug, Clone, Serialize)]
pub struct DiameterDialog {
    pub session_id: String,
    pub requests: u64,
    pub answers: u64,
    pub outstanding_requests: i64,
    pub command_codes: BTreeSet<u32>,
    pub first_at: DateTime<Utc>,
    pub last_at: DateTime<Utc>,
}

impl DiameterDialog {
    pub fn new(session_id: String, ts: DateTime<Utc>) -> Self {
        Self {
            session_id,
            requests: 0,
            answers: 0,
            outstanding_requests: 0,
            command_codes: BTreeSet::new(),
            first_at: ts,
            last_at: ts,
        }
    }

    pub fn on_message(&mut self, is_request: bool, command_code: u32, ts: DateTime<Utc>) {
        self.command_codes.insert(command_code);
        if is_request {
            self.requests += 1;
            self.outstanding_requests += 1;
        } else {
            self.answers += 1;
            self.outstanding_requests -= 1;
            if self.outstanding_requests < 0 {
                debug!(
                    "diameter dialog {}: answer without request",
                    self.session_id
                );
                self.outstanding_requests = 0;
            }
        }
        if ts > self.last_at {
            self.last_at = ts;
        }
    }
}

/// Compact record of one NAS PDU inside a UE context.
#[derive(Debug, Clone, Serialize)]
pub struct NasEvent {
    pub timestamp: DateTime<Utc>,
    pub message_type: MessageType,
    pub protected: bool,
    pub imsi: Option<String>,
}

/// S1AP/NGAP UE context keyed by the RAN/core id pair; collects the NAS
/// timeline carried inside the transport messages.
#[derive(Debug, Clone, Serialize)]
pub struct UeContext {
    pub key: String,
    pub protocol: ProtocolType,
    pub enb_ue_id: Option<u32>,
    pub mme_ue_id: Option<u64>,
    pub nas_timeline: Vec<NasEvent>,
    pub message_count: u64,
    pub first_at: DateTime<Utc>,
    pub last_at: DateTime<Utc>,
}

impl UeContext {
    pub fn new(
        key: String,
        protocol: ProtocolType,
        enb_ue_id: Option<u32>,
        mme_ue_id: Option<u64>,
        ts: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            protocol,
            enb_ue_id,
            mme_ue_id,
            nas_timeline: Vec::new(),
            message_count: 0,
            first_at: ts,
            last_at: ts,
        }
    }

    /// Context key from whichever UE ids the message carried.
    pub fn context_key(
        protocol: ProtocolType,
        enb_ue_id: Option<u32>,
        mme_ue_id: Option<u64>,
    ) -> String {
        format!(
            "{}:{}/{}",
            protocol.as_str(),
            enb_ue_id.map_or_else(|| "-".to_string(), |v| v.to_string()),
            mme_ue_id.map_or_else(|| "-".to_string(), |v| v.to_string()),
        )
    }

    /// Ids learned later keep the earliest context key; values merge in.
    pub fn on_transport_message(
        &mut self,
        ts: DateTime<Utc>,
        enb_ue_id: Option<u32>,
        mme_ue_id: Option<u64>,
    ) {
        self.message_count += 1;
        if ts > self.last_at {
            self.last_at = ts;
        }
        if self.enb_ue_id.is_none() {
            self.enb_ue_id = enb_ue_id;
        }
        if self.mme_ue_id.is_none() {
            self.mme_ue_id = mme_ue_id;
        }
    }

    pub fn record_nas(&mut self, nas: &NasMessage, ts: DateTime<Utc>) {
        self.nas_timeline.push(NasEvent {
            timestamp: ts,
            message_type: nas.message_type(),
            protected: nas.protected,
            imsi: nas.imsi.clone(),
        });
    }
}
