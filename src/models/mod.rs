// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod error;

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Network 5-tuple identifying a unidirectional flow.
///
/// No src/dst canonicalization is applied; both directions of a
/// conversation are joined later by the session correlator via session
/// keys, never by tuple ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    /// IP protocol number (TCP=6, UDP=17, SCTP=132).
    pub ip_protocol: u8,
}

impl FiveTuple {
    /// Key that is equal for both directions of the same conversation.
    pub fn bidirectional_key(&self) -> (IpAddr, u16, IpAddr, u16, u8) {
        let a = (self.src_ip, self.src_port);
        let b = (self.dst_ip, self.dst_port);
        if a <= b {
            (a.0, a.1, b.0, b.1, self.ip_protocol)
        } else {
            (b.0, b.1, a.0, a.1, self.ip_protocol)
        }
    }

    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            ip_protocol: self.ip_protocol,
        }
    }
}

impl Default for FiveTuple {
    fn default() -> Self {
        Self {
            src_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_port: 0,
            ip_protocol: 0,
        }
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}/{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port, self.ip_protocol
        )
    }
}

/// Application protocol detected for a packet or reassembled message.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolType {
    #[default]
    Unknown,
    Sip,
    Rtp,
    Rtcp,
    GtpC,
    GtpU,
    Diameter,
    Http2,
    S1ap,
    Ngap,
    X2ap,
    Nas,
    Sctp,
    Tcp,
    Udp,
}

impl ProtocolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolType::Unknown => "UNKNOWN",
            ProtocolType::Sip => "SIP",
            ProtocolType::Rtp => "RTP",
            ProtocolType::Rtcp => "RTCP",
            ProtocolType::GtpC => "GTP-C",
            ProtocolType::GtpU => "GTP-U",
            ProtocolType::Diameter => "DIAMETER",
            ProtocolType::Http2 => "HTTP2",
            ProtocolType::S1ap => "S1AP",
            ProtocolType::Ngap => "NGAP",
            ProtocolType::X2ap => "X2AP",
            ProtocolType::Nas => "NAS",
            ProtocolType::Sctp => "SCTP",
            ProtocolType::Tcp => "TCP",
            ProtocolType::Udp => "UDP",
        }
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message tag used by timelines and per-protocol state machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Unknown,
    // SIP
    SipInvite,
    SipTrying,
    SipRinging,
    SipOk,
    SipAck,
    SipBye,
    SipCancel,
    SipRegister,
    SipOptions,
    SipUpdate,
    SipPrack,
    SipStatus,
    // RTP / RTCP
    RtpData,
    RtcpReport,
    // Diameter
    DiameterRequest,
    DiameterAnswer,
    // GTPv2-C
    GtpEchoRequest,
    GtpEchoResponse,
    GtpCreateSessionRequest,
    GtpCreateSessionResponse,
    GtpModifyBearerRequest,
    GtpModifyBearerResponse,
    GtpDeleteSessionRequest,
    GtpDeleteSessionResponse,
    // GTP-U
    GtpUserData,
    // S1AP / NGAP / X2AP
    S1apInitialUeMessage,
    S1apInitialContextSetup,
    S1apUplinkNasTransport,
    S1apDownlinkNasTransport,
    S1apPathSwitchRequest,
    S1apHandoverRequest,
    S1apUeContextRelease,
    S1apOther,
    NgapInitialUeMessage,
    NgapPathSwitchRequest,
    NgapHandoverRequest,
    NgapOther,
    X2apHandoverRequest,
    X2apOther,
    // NAS
    NasAttachRequest,
    NasAttachAccept,
    NasDetachRequest,
    NasPdnConnectivityRequest,
    NasProtected,
    NasOther,
    // HTTP/2 and SBA
    Http2Request,
    Http2Response,
    SbaInteraction,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Unknown => "UNKNOWN",
            MessageType::SipInvite => "SIP INVITE",
            MessageType::SipTrying => "SIP 100 Trying",
            MessageType::SipRinging => "SIP 180 Ringing",
            MessageType::SipOk => "SIP 200 OK",
            MessageType::SipAck => "SIP ACK",
            MessageType::SipBye => "SIP BYE",
            MessageType::SipCancel => "SIP CANCEL",
            MessageType::SipRegister => "SIP REGISTER",
            MessageType::SipOptions => "SIP OPTIONS",
            MessageType::SipUpdate => "SIP UPDATE",
            MessageType::SipPrack => "SIP PRACK",
            MessageType::SipStatus => "SIP status",
            MessageType::RtpData => "RTP",
            MessageType::RtcpReport => "RTCP",
            MessageType::DiameterRequest => "Diameter request",
            MessageType::DiameterAnswer => "Diameter answer",
            MessageType::GtpEchoRequest => "GTP Echo Request",
            MessageType::GtpEchoResponse => "GTP Echo Response",
            MessageType::GtpCreateSessionRequest => "GTP Create Session Request",
            MessageType::GtpCreateSessionResponse => "GTP Create Session Response",
            MessageType::GtpModifyBearerRequest => "GTP Modify Bearer Request",
            MessageType::GtpModifyBearerResponse => "GTP Modify Bearer Response",
            MessageType::GtpDeleteSessionRequest => "GTP Delete Session Request",
            MessageType::GtpDeleteSessionResponse => "GTP Delete Session Response",
            MessageType::GtpUserData => "GTP-U data",
            MessageType::S1apInitialUeMessage => "S1AP Initial UE Message",
            MessageType::S1apInitialContextSetup => "S1AP Initial Context Setup",
            MessageType::S1apUplinkNasTransport => "S1AP Uplink NAS Transport",
            MessageType::S1apDownlinkNasTransport => "S1AP Downlink NAS Transport",
            MessageType::S1apPathSwitchRequest => "S1AP Path Switch Request",
            MessageType::S1apHandoverRequest => "S1AP Handover Request",
            MessageType::S1apUeContextRelease => "S1AP UE Context Release",
            MessageType::S1apOther => "S1AP",
            MessageType::NgapInitialUeMessage => "NGAP Initial UE Message",
            MessageType::NgapPathSwitchRequest => "NGAP Path Switch Request",
            MessageType::NgapHandoverRequest => "NGAP Handover Request",
            MessageType::NgapOther => "NGAP",
            MessageType::X2apHandoverRequest => "X2AP Handover Request",
            MessageType::X2apOther => "X2AP",
            MessageType::NasAttachRequest => "NAS Attach Request",
            MessageType::NasAttachAccept => "NAS Attach Accept",
            MessageType::NasDetachRequest => "NAS Detach Request",
            MessageType::NasPdnConnectivityRequest => "NAS PDN Connectivity Request",
            MessageType::NasProtected => "NAS (protected)",
            MessageType::NasOther => "NAS",
            MessageType::Http2Request => "HTTP/2 request",
            MessageType::Http2Response => "HTTP/2 response",
            MessageType::SbaInteraction => "SBA interaction",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Telecom reference point an interface carries (result of the interface
/// classifier).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TelecomInterface {
    Unknown,
    S1Mme,
    S1U,
    S5S8C,
    S5S8U,
    S6a,
    Gx,
    Rx,
    Gy,
    SGi,
    X2C,
    N2,
    N3,
    N4,
    N6,
    ImsSip,
    RtpMedia,
}

impl TelecomInterface {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelecomInterface::Unknown => "UNKNOWN",
            TelecomInterface::S1Mme => "S1-MME",
            TelecomInterface::S1U => "S1-U",
            TelecomInterface::S5S8C => "S5/S8-C",
            TelecomInterface::S5S8U => "S5/S8-U",
            TelecomInterface::S6a => "S6a",
            TelecomInterface::Gx => "Gx",
            TelecomInterface::Rx => "Rx",
            TelecomInterface::Gy => "Gy",
            TelecomInterface::SGi => "SGi",
            TelecomInterface::X2C => "X2-C",
            TelecomInterface::N2 => "N2",
            TelecomInterface::N3 => "N3",
            TelecomInterface::N4 => "N4",
            TelecomInterface::N6 => "N6",
            TelecomInterface::ImsSip => "IMS-SIP",
            TelecomInterface::RtpMedia => "RTP-Media",
        }
    }
}

impl fmt::Display for TelecomInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-packet metadata handed between pipeline stages.
#[derive(Debug, Clone)]
pub struct PacketMetadata {
    /// Opaque per-job packet id (frame counter).
    pub packet_id: u64,
    pub timestamp: DateTime<Utc>,
    pub frame_number: u32,
    pub original_length: u32,
    pub captured_length: u32,
    pub five_tuple: FiveTuple,
    /// PCAPNG interface the packet was captured on, if any.
    pub interface_id: Option<u32>,
    pub interface: TelecomInterface,
    pub detected_protocol: ProtocolType,
    /// Layer-7 payload after link/IP/transport stripping.
    pub payload: Bytes,
}

/// Job lifecycle states published by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Everything the facade reports about one submitted job.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub job_id: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub status: JobStatus,
    /// 0..=100
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub warning_count: u64,
    pub session_count: usize,
}

impl JobInfo {
    pub fn new(job_id: String, input_path: PathBuf, output_path: PathBuf) -> Self {
        Self {
            job_id,
            input_path,
            output_path,
            status: JobStatus::Queued,
            progress: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            total_packets: 0,
            total_bytes: 0,
            warning_count: 0,
            session_count: 0,
        }
    }
}
