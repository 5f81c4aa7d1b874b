// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod children;
pub mod correlator;
pub mod key;
pub mod master;
pub mod tunnel;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::models::{
    FiveTuple, MessageType, ProtocolType, TelecomInterface,
};

pub use key::CorrelationKey;

/// The building block of timelines: one parsed message, carried by value
/// with its identifiers. No back-pointers into session state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionMessageRef {
    pub timestamp: DateTime<Utc>,
    pub interface: TelecomInterface,
    pub protocol: ProtocolType,
    pub message_type: MessageType,
    pub src_ip: std::net::IpAddr,
    pub src_port: u16,
    pub dst_ip: std::net::IpAddr,
    pub dst_port: u16,
    pub frame_number: u32,
    pub parsed_data: Value,
    pub correlation_key: CorrelationKey,
}

impl SessionMessageRef {
    /// Derives a timeline entry from the packet it was parsed out of.
    pub fn from_packet(
        meta: &crate::models::PacketMetadata,
        protocol: ProtocolType,
        message_type: MessageType,
        parsed_data: Value,
        correlation_key: CorrelationKey,
    ) -> Self {
        Self {
            timestamp: meta.timestamp,
            interface: meta.interface,
            protocol,
            message_type,
            src_ip: meta.five_tuple.src_ip,
            src_port: meta.five_tuple.src_port,
            dst_ip: meta.five_tuple.dst_ip,
            dst_port: meta.five_tuple.dst_port,
            frame_number: meta.frame_number,
            parsed_data,
            correlation_key,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        timestamp: DateTime<Utc>,
        interface: TelecomInterface,
        protocol: ProtocolType,
        message_type: MessageType,
        five_tuple: &FiveTuple,
        frame_number: u32,
        parsed_data: Value,
        correlation_key: CorrelationKey,
    ) -> Self {
        Self {
            timestamp,
            interface,
            protocol,
            message_type,
            src_ip: five_tuple.src_ip,
            src_port: five_tuple.src_port,
            dst_ip: five_tuple.dst_ip,
            dst_port: five_tuple.dst_port,
            frame_number,
            parsed_data,
            correlation_key,
        }
    }
}
