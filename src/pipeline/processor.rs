// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, trace, warn};

use crate::{
    capture::{
        interface::{InterfaceClassifier, TrafficObservation},
        link_layer::{ETHERTYPE_IPV4, ETHERTYPE_IPV6, LinkLayer},
        reader::{InterfaceInfo, PacketRecord},
    },
    cfg::config::Config,
    correlation::{
        CorrelationKey, SessionMessageRef, correlator::SessionCorrelator,
        key::http2_stream_key, tunnel::manager::TunnelManager,
    },
    flow::{ports::DynamicPortTracker, tracker::FlowTracker},
    models::{
        FiveTuple, PacketMetadata, ProtocolType, TelecomInterface,
        error::Error,
    },
    parsers::{
        self, ParsedMessage, diameter, gtpv2,
        http2::Http2Connection,
        rtp::{self, RtpStreamTracker},
        s1ap::{self, RanProtocol},
        sba, sip,
    },
    reassembly::{
        ip::{IpDatagram, IpReassembler},
        sctp::{self, SctpReassembler},
        tcp::{TcpReassembler, TcpSegment},
    },
};

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;
const IPPROTO_SCTP: u8 = 132;

/// Cap on an undecided TCP stream buffer.
const MAX_STREAM_BUFFER: usize = 1024 * 1024;
/// Interface key used for classic PCAP records.
const NO_INTERFACE: u32 = u32::MAX;

/// Ports with fixed roles.
const PORT_GTP_C: u16 = 2123;
const PORT_GTP_U: u16 = 2152;
const PORT_SIP: u16 = 5060;
const PORT_DIAMETER: u16 = 3868;
const PORT_S1AP: u16 = 36412;
const PORT_X2AP: u16 = 36422;
const PORT_NGAP: u16 = 38412;

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessorCounters {
    pub packets: u64,
    pub bytes: u64,
    pub warnings: u64,
    pub sanity_drops: u64,
}

#[derive(Debug, Default)]
struct StreamBuffer {
    protocol: ProtocolType,
    data: Vec<u8>,
}

struct RtpFlowState {
    call_id: Option<String>,
    tracker: RtpStreamTracker,
}

/// Per-worker hot-path state: one instance per job, never shared, so the
/// reassembly and parsing path runs without locks. The correlator and
/// tunnel manager are the only shared collaborators.
pub struct PacketProcessor {
    link_layer: LinkLayer,
    ip_reassembler: IpReassembler,
    tcp: TcpReassembler,
    sctp: SctpReassembler,
    flows: FlowTracker,
    ports: DynamicPortTracker,
    http2_connections: HashMap<(IpAddr, u16, IpAddr, u16, u8), Http2Connection>,
    stream_buffers: HashMap<FiveTuple, StreamBuffer>,
    rtp_streams: HashMap<u32, RtpFlowState>,
    observations: HashMap<u32, TrafficObservation>,
    interface_kinds: HashMap<u32, TelecomInterface>,

    correlator: Arc<Mutex<SessionCorrelator>>,
    tunnels: Arc<Mutex<TunnelManager>>,

    last_cleanup: Option<DateTime<Utc>>,
    counters: ProcessorCounters,
    warnings: Vec<String>,
}

impl PacketProcessor {
    pub fn new(
        config: &Config,
        correlator: Arc<Mutex<SessionCorrelator>>,
        tunnels: Arc<Mutex<TunnelManager>>,
    ) -> Self {
        Self {
            link_layer: LinkLayer::default(),
            ip_reassembler: IpReassembler::new(30),
            tcp: TcpReassembler::new(120),
            sctp: SctpReassembler::new(300),
            flows: FlowTracker::new(
                config.limits.max_flows,
                config.timeouts.flow_timeout_sec,
            ),
            ports: DynamicPortTracker::new(300),
            http2_connections: HashMap::new(),
            stream_buffers: HashMap::new(),
            rtp_streams: HashMap::new(),
            observations: HashMap::new(),
            interface_kinds: HashMap::new(),
            correlator,
            tunnels,
            last_cleanup: None,
            counters: ProcessorCounters::default(),
            warnings: Vec::new(),
        }
    }

    pub fn counters(&self) -> ProcessorCounters {
        self.counters
    }

    /// Recoverable problems observed since the last drain, for `warning`
    /// events.
    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    /// Pre-classifies capture interfaces from their names/descriptions.
    pub fn register_interfaces(&mut self, interfaces: &[InterfaceInfo]) {
        for info in interfaces {
            let kind = InterfaceClassifier::classify_by_name(
                info.name.as_deref().unwrap_or_default(),
                info.description.as_deref().unwrap_or_default(),
            );
            self.interface_kinds.insert(info.interface_id, kind);
            debug!(
                "interface {} ({:?}) classified as {}",
                info.interface_id, info.name, kind
            );
        }
    }

    /// Advances one captured frame through strip -> defrag -> reassembly
    /// -> parse -> correlate.
    pub fn process_record(&mut self, record: &PacketRecord) {
        self.counters.packets += 1;
        self.counters.bytes += u64::from(record.original_length);

        self.cleanup_tick(record.timestamp);

        let (offset, ethertype) =
            match self.link_layer.strip(&record.data, record.link_type) {
                Ok(stripped) => stripped,
                Err(err) => {
                    self.note_error("link-layer", err);
                    return;
                },
            };
        if ethertype != ETHERTYPE_IPV4 && ethertype != ETHERTYPE_IPV6 {
            trace!("skipping non-IP ethertype 0x{ethertype:04x}");
            return;
        }

        let ip_slice = &record.data[offset..];
        match self.ip_reassembler.process(ip_slice, record.timestamp) {
            Ok(IpDatagram::Intact) => self.process_ip(ip_slice, record),
            Ok(IpDatagram::Reassembled(datagram)) => {
                self.process_ip(&datagram, record);
            },
            Ok(IpDatagram::Pending) => {},
            Err(err) => self.note_error("ip-reassembly", err),
        }
    }

    fn process_ip(&mut self, datagram: &[u8], record: &PacketRecord) {
        let Some((src_ip, dst_ip, ip_protocol, transport)) = parse_ip_header(datagram)
        else {
            self.counters.warnings += 1;
            return;
        };

        match ip_protocol {
            IPPROTO_UDP => self.process_udp(src_ip, dst_ip, transport, record),
            IPPROTO_TCP => self.process_tcp(src_ip, dst_ip, transport, record),
            IPPROTO_SCTP => self.process_sctp(src_ip, dst_ip, transport, record),
            other => {
                trace!("unhandled IP protocol {other}");
            },
        }
    }

    /// Builds the metadata value carried through the parser stages.
    fn metadata(
        &mut self,
        record: &PacketRecord,
        five_tuple: FiveTuple,
        payload: Bytes,
    ) -> PacketMetadata {
        let interface = self.interface_kind(record.interface_id);
        PacketMetadata {
            packet_id: u64::from(record.frame_number),
            timestamp: record.timestamp,
            frame_number: record.frame_number,
            original_length: record.original_length,
            captured_length: record.data.len() as u32,
            five_tuple,
            interface_id: record.interface_id,
            interface,
            detected_protocol: ProtocolType::Unknown,
            payload,
        }
    }

    fn process_udp(
        &mut self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        transport: &[u8],
        record: &PacketRecord,
    ) {
        if transport.len() < 8 {
            self.counters.warnings += 1;
            return;
        }
        let five_tuple = FiveTuple {
            src_ip,
            dst_ip,
            src_port: u16::from_be_bytes([transport[0], transport[1]]),
            dst_port: u16::from_be_bytes([transport[2], transport[3]]),
            ip_protocol: IPPROTO_UDP,
        };

        self.observe(record, &five_tuple);
        self.flows.touch(
            &five_tuple,
            record.timestamp,
            u64::from(record.original_length),
        );

        let payload = Bytes::copy_from_slice(&transport[8..]);
        let meta = self.metadata(record, five_tuple, payload);

        let src = meta.five_tuple.src_port;
        let dst = meta.five_tuple.dst_port;

        if src == PORT_GTP_C || dst == PORT_GTP_C {
            self.handle_gtp_c(&meta);
        } else if src == PORT_GTP_U || dst == PORT_GTP_U {
            self.handle_gtp_u(&meta);
        } else if src == PORT_SIP || dst == PORT_SIP {
            self.handle_sip(&meta);
        } else if self.ports.is_known(dst) || self.ports.is_known(src) {
            self.handle_rtp(&meta);
        } else {
            match parsers::detect(&meta.payload) {
                ProtocolType::Sip => self.handle_sip(&meta),
                ProtocolType::GtpC => self.handle_gtp_c(&meta),
                ProtocolType::GtpU => self.handle_gtp_u(&meta),
                ProtocolType::Rtp | ProtocolType::Rtcp => self.handle_rtp(&meta),
                ProtocolType::Diameter => {
                    self.handle_diameter_message(&meta, &meta.payload);
                },
                _ => {},
            }
        }
    }

    fn process_tcp(
        &mut self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        transport: &[u8],
        record: &PacketRecord,
    ) {
        if transport.len() < 20 {
            self.counters.warnings += 1;
            return;
        }
        let data_offset = usize::from(transport[12] >> 4) * 4;
        if data_offset < 20 || transport.len() < data_offset {
            self.counters.warnings += 1;
            return;
        }

        let five_tuple = FiveTuple {
            src_ip,
            dst_ip,
            src_port: u16::from_be_bytes([transport[0], transport[1]]),
            dst_port: u16::from_be_bytes([transport[2], transport[3]]),
            ip_protocol: IPPROTO_TCP,
        };
        let flags = transport[13];
        let segment = TcpSegment {
            seq: u32::from_be_bytes([
                transport[4],
                transport[5],
                transport[6],
                transport[7],
            ]),
            payload: &transport[data_offset..],
            syn: flags & 0x02 != 0,
            fin: flags & 0x01 != 0,
        };

        self.observe(record, &five_tuple);
        self.flows.touch(
            &five_tuple,
            record.timestamp,
            u64::from(record.original_length),
        );

        let contiguous = self
            .tcp
            .process_segment(&five_tuple, segment, record.timestamp);
        if contiguous.is_empty() {
            if self.tcp.is_drained(&five_tuple) {
                self.tcp.remove(&five_tuple);
                self.stream_buffers.remove(&five_tuple);
            }
            return;
        }

        let meta = self.metadata(record, five_tuple, Bytes::new());
        self.handle_stream_bytes(&meta, &contiguous);
    }

    /// Protocol-resolves a TCP stream and feeds its message framing.
    fn handle_stream_bytes(&mut self, meta: &PacketMetadata, bytes: &[u8]) {
        let five_tuple = &meta.five_tuple;
        let (resolved, buffered) = {
            let buffer = self.stream_buffers.entry(five_tuple.clone()).or_default();
            buffer.data.extend_from_slice(bytes);

            if buffer.protocol == ProtocolType::Unknown {
                let port_hint = match (five_tuple.src_port, five_tuple.dst_port) {
                    (PORT_SIP, _) | (_, PORT_SIP) => ProtocolType::Sip,
                    (PORT_DIAMETER, _) | (_, PORT_DIAMETER) => ProtocolType::Diameter,
                    _ => ProtocolType::Unknown,
                };
                buffer.protocol = if port_hint != ProtocolType::Unknown {
                    port_hint
                } else if crate::parsers::http2::probe(&buffer.data) {
                    ProtocolType::Http2
                } else {
                    parsers::detect(&buffer.data)
                };
            }
            (buffer.protocol, buffer.data.len())
        };

        match resolved {
            ProtocolType::Unknown => {
                if buffered > MAX_STREAM_BUFFER {
                    self.counters.sanity_drops += 1;
                    self.stream_buffers.remove(five_tuple);
                }
            },
            ProtocolType::Sip => self.drain_sip_stream(meta),
            ProtocolType::Diameter => self.drain_diameter_stream(meta),
            ProtocolType::Http2 => {
                let pending = self
                    .stream_buffers
                    .get_mut(five_tuple)
                    .map(|b| std::mem::take(&mut b.data))
                    .unwrap_or_default();
                self.feed_http2(meta, &pending);
            },
            _ => {},
        }
    }

    fn drain_sip_stream(&mut self, meta: &PacketMetadata) {
        loop {
            let step = {
                let Some(buffer) = self.stream_buffers.get_mut(&meta.five_tuple)
                else {
                    return;
                };
                match sip::parse_stream(&buffer.data) {
                    Ok(Some((msg, consumed))) => {
                        buffer.data.drain(..consumed);
                        Ok(Some(msg))
                    },
                    Ok(None) => Ok(None),
                    Err(err) => {
                        buffer.data.clear();
                        Err(err)
                    },
                }
            };
            match step {
                Ok(Some(msg)) => self.accept_sip(msg, meta),
                Ok(None) => return,
                Err(err) => {
                    self.note_error("sip-stream", err);
                    return;
                },
            }
        }
    }

    fn drain_diameter_stream(&mut self, meta: &PacketMetadata) {
        loop {
            let message = {
                let Some(buffer) = self.stream_buffers.get_mut(&meta.five_tuple)
                else {
                    return;
                };
                let Some(length) = diameter::message_length(&buffer.data) else {
                    if buffer.data.len() >= 4 {
                        // Framing is lost; drop the stream buffer.
                        buffer.data.clear();
                        self.counters.warnings += 1;
                    }
                    return;
                };
                if buffer.data.len() < length {
                    return;
                }
                buffer.data.drain(..length).collect::<Vec<u8>>()
            };
            self.handle_diameter_message(meta, &message);
        }
    }

    fn feed_http2(&mut self, meta: &PacketMetadata, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let five_tuple = &meta.five_tuple;
        let key = five_tuple.bidirectional_key();
        let connection = self.http2_connections.entry(key).or_default();

        let completed = match connection.feed(five_tuple, bytes, meta.timestamp) {
            Ok(completed) => completed,
            Err(err) => {
                self.note_error("http2", err);
                return;
            },
        };

        for stream in completed {
            let stream_id = stream.stream_id;
            if let Some(interaction) = sba::classify(&stream) {
                let msg = ParsedMessage::Sba(Box::new(interaction));
                let mut key = CorrelationKey::from_message(&msg, five_tuple);
                key.http2_stream = Some(http2_stream_key(five_tuple, stream_id));
                self.emit(msg, meta, Some(key));
            } else {
                trace!(
                    "http2 stream {stream_id} completed without SBA classification"
                );
            }
        }
    }

    fn process_sctp(
        &mut self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        transport: &[u8],
        record: &PacketRecord,
    ) {
        if transport.len() < 12 {
            self.counters.warnings += 1;
            return;
        }
        let five_tuple = FiveTuple {
            src_ip,
            dst_ip,
            src_port: u16::from_be_bytes([transport[0], transport[1]]),
            dst_port: u16::from_be_bytes([transport[2], transport[3]]),
            ip_protocol: IPPROTO_SCTP,
        };

        self.observe(record, &five_tuple);
        self.flows.touch(
            &five_tuple,
            record.timestamp,
            u64::from(record.original_length),
        );

        let messages = match self
            .sctp
            .process_packet(&five_tuple, transport, record.timestamp)
        {
            Ok(messages) => messages,
            Err(err) => {
                self.note_error("sctp", err);
                return;
            },
        };

        let meta = self.metadata(record, five_tuple, Bytes::new());
        for message in messages {
            self.route_sctp_message(&meta, &message);
        }
    }

    fn route_sctp_message(&mut self, meta: &PacketMetadata, message: &sctp::SctpMessage) {
        let by_ppid = sctp::protocol_for_ppid(message.ppid);

        let by_port = match (meta.five_tuple.src_port, meta.five_tuple.dst_port) {
            (PORT_S1AP, _) | (_, PORT_S1AP) => Some(ProtocolType::S1ap),
            (PORT_NGAP, _) | (_, PORT_NGAP) => Some(ProtocolType::Ngap),
            (PORT_X2AP, _) | (_, PORT_X2AP) => Some(ProtocolType::X2ap),
            (PORT_DIAMETER, _) | (_, PORT_DIAMETER) => Some(ProtocolType::Diameter),
            _ => None,
        };

        // PPID wins; the disagreement itself is worth surfacing.
        if let (Some(ppid_proto), Some(port_proto)) = (by_ppid, by_port) {
            if ppid_proto != port_proto {
                warn!(
                    "sctp ppid {} selects {} but port heuristic says {}",
                    message.ppid, ppid_proto, port_proto
                );
            }
        }

        let protocol = by_ppid.or(by_port).unwrap_or_else(|| {
            let detected = parsers::detect(&message.data);
            debug!(
                "unknown sctp ppid {}, payload detected as {detected}",
                message.ppid
            );
            detected
        });

        match protocol {
            ProtocolType::S1ap => {
                self.handle_ran_ap(meta, &message.data, RanProtocol::S1ap);
            },
            ProtocolType::Ngap => {
                self.handle_ran_ap(meta, &message.data, RanProtocol::Ngap);
            },
            ProtocolType::X2ap => {
                self.handle_ran_ap(meta, &message.data, RanProtocol::X2ap);
            },
            ProtocolType::Diameter => {
                self.handle_diameter_message(meta, &message.data);
            },
            other => {
                trace!("sctp message left unparsed as {other}");
            },
        }
    }

    fn handle_gtp_c(&mut self, meta: &PacketMetadata) {
        let msg = match gtpv2::parse(&meta.payload) {
            Ok(msg) => msg,
            Err(err) => {
                self.note_error("gtpv2", err);
                return;
            },
        };

        let tunnel_result = if let Ok(mut tunnels) = self.tunnels.lock() {
            Some(tunnels.process_message(
                &msg,
                meta.timestamp,
                meta.five_tuple.src_ip,
                meta.five_tuple.dst_ip,
            ))
        } else {
            None
        };

        if let Some(result) = tunnel_result {
            match result {
                Ok(()) => {},
                Err(Error::StateViolation(reason)) => {
                    debug!("gtp state violation: {reason}");
                },
                Err(Error::Resource(what)) => {
                    self.counters.warnings += 1;
                    self.warnings.push(format!("tunnel cap hit: {what}"));
                },
                Err(err) => self.note_error("tunnel-manager", err),
            }
        }

        let msg = ParsedMessage::Gtpv2(Box::new(msg));
        self.emit(msg, meta, None);
    }

    fn handle_gtp_u(&mut self, meta: &PacketMetadata) {
        let header = match gtpv2::parse_gtpu(&meta.payload) {
            Ok(header) => header,
            Err(err) => {
                self.note_error("gtp-u", err);
                return;
            },
        };

        // User-plane packets are accounted, not timelined; deep payload
        // analysis stays out of scope.
        if let Ok(mut tunnels) = self.tunnels.lock() {
            tunnels.handle_user_data(
                header.teid,
                u64::from(meta.original_length),
                meta.timestamp,
            );
        }
    }

    fn handle_sip(&mut self, meta: &PacketMetadata) {
        match sip::parse(&meta.payload) {
            Ok(msg) => self.accept_sip(msg, meta),
            Err(err) => self.note_error("sip", err),
        }
    }

    fn accept_sip(&mut self, msg: sip::SipMessage, meta: &PacketMetadata) {
        if let (Some(call_id), Some(sdp)) = (&msg.call_id, &msg.sdp) {
            for media in &sdp.media {
                if media.port > 0 {
                    self.ports.register(call_id, media.port, meta.timestamp);
                }
            }
        }

        let msg = ParsedMessage::Sip(Box::new(msg));
        self.emit(msg, meta, None);
    }

    fn handle_rtp(&mut self, meta: &PacketMetadata) {
        if rtp::probe_rtcp(&meta.payload) {
            if let Ok(header) = rtp::parse_rtcp(&meta.payload) {
                let msg = ParsedMessage::Rtcp(header);
                self.emit(msg, meta, None);
            }
            return;
        }

        let header = match rtp::parse_rtp(&meta.payload) {
            Ok(header) => header,
            Err(err) => {
                self.note_error("rtp", err);
                return;
            },
        };

        let call_id = self
            .ports
            .call_id_for(meta.five_tuple.dst_port)
            .or_else(|| self.ports.call_id_for(meta.five_tuple.src_port))
            .map(str::to_string);

        let state = self
            .rtp_streams
            .entry(header.ssrc)
            .or_insert_with(|| RtpFlowState {
                call_id: call_id.clone(),
                tracker: RtpStreamTracker::new(header.ssrc),
            });
        if state.call_id.is_none() {
            state.call_id = call_id.clone();
        }
        state.tracker.process_packet(&header, meta.timestamp);

        let key = CorrelationKey {
            sip_call_id: call_id,
            ..CorrelationKey::default()
        };
        let msg = ParsedMessage::Rtp(header);
        self.emit(msg, meta, Some(key));
    }

    fn handle_diameter_message(&mut self, meta: &PacketMetadata, payload: &[u8]) {
        match diameter::parse(payload) {
            Ok(msg) => {
                let msg = ParsedMessage::Diameter(Box::new(msg));
                self.emit(msg, meta, None);
            },
            Err(err) => self.note_error("diameter", err),
        }
    }

    fn handle_ran_ap(
        &mut self,
        meta: &PacketMetadata,
        payload: &[u8],
        protocol: RanProtocol,
    ) {
        let msg = match s1ap::parse(payload, protocol) {
            Ok(msg) => msg,
            Err(err) => {
                self.note_error("ran-ap", err);
                return;
            },
        };

        // NAS identifiers ride along in the transport's correlation key.
        let parsed = ParsedMessage::RanAp(Box::new(msg));
        let mut key = CorrelationKey::from_message(&parsed, &meta.five_tuple);
        if let ParsedMessage::RanAp(ran) = &parsed {
            for nas_pdu in &ran.nas_pdus {
                if let Ok(nas) = crate::parsers::nas::parse(nas_pdu) {
                    let nas_msg = ParsedMessage::Nas(Box::new(nas));
                    let nas_key =
                        CorrelationKey::from_message(&nas_msg, &meta.five_tuple);
                    key.merge_from(&nas_key);
                }
            }
        }

        if let Ok(mut tunnels) = self.tunnels.lock() {
            tunnels.note_mobility_event(meta.timestamp, parsed.message_type());
        }

        self.emit(parsed, meta, Some(key));
    }

    /// Builds the message ref and hands it to the shared correlator.
    fn emit(
        &mut self,
        msg: ParsedMessage,
        meta: &PacketMetadata,
        key: Option<CorrelationKey>,
    ) {
        let key = key
            .unwrap_or_else(|| CorrelationKey::from_message(&msg, &meta.five_tuple));

        if let Some(flow) = self.flows.get_mut(&meta.five_tuple) {
            flow.detected_protocol = msg.protocol();
            if flow.session_hint.is_none() {
                flow.session_hint = key
                    .sip_call_id
                    .clone()
                    .or_else(|| key.diameter_session_id.clone())
                    .or_else(|| key.teid_uplink.map(crate::utils::format_teid));
            }
        }
        if let Some(obs) = self
            .observations
            .get_mut(&meta.interface_id.unwrap_or(NO_INTERFACE))
        {
            obs.observe_protocol(msg.protocol());
        }

        let msg_ref = SessionMessageRef::from_packet(
            meta,
            msg.protocol(),
            msg.message_type(),
            msg.to_json(),
            key,
        );

        if let Ok(mut correlator) = self.correlator.lock() {
            correlator.process(&msg, msg_ref, u64::from(meta.original_length));
        }
    }

    fn observe(&mut self, record: &PacketRecord, five_tuple: &FiveTuple) {
        let obs = self
            .observations
            .entry(record.interface_id.unwrap_or(NO_INTERFACE))
            .or_default();
        obs.observe_ports(
            five_tuple.ip_protocol,
            five_tuple.src_port,
            five_tuple.dst_port,
        );
    }

    fn interface_kind(&mut self, interface_id: Option<u32>) -> TelecomInterface {
        let id = interface_id.unwrap_or(NO_INTERFACE);
        let named = self
            .interface_kinds
            .get(&id)
            .copied()
            .unwrap_or(TelecomInterface::Unknown);
        if named != TelecomInterface::Unknown {
            return named;
        }
        self.observations
            .get(&id)
            .map(InterfaceClassifier::classify_by_traffic)
            .unwrap_or(TelecomInterface::Unknown)
    }

    fn cleanup_tick(&mut self, now: DateTime<Utc>) {
        match self.last_cleanup {
            None => {
                self.last_cleanup = Some(now);
            },
            Some(last) if now - last >= Duration::seconds(1) => {
                self.last_cleanup = Some(now);
                self.ip_reassembler.cleanup(now);
                self.tcp.cleanup(now);
                self.sctp.cleanup(now);
                self.flows.cleanup(now);
                self.ports.cleanup(now);
                if let Ok(mut tunnels) = self.tunnels.lock() {
                    tunnels.check_timeouts(now);
                }
                if let Ok(mut correlator) = self.correlator.lock() {
                    correlator.cleanup(now);
                }
            },
            Some(_) => {},
        }
    }

    /// End-of-capture: media metrics into the correlator, keep-alive
    /// aggregation finalized, session metrics computed.
    pub fn finalize(&mut self) {
        if let Ok(mut correlator) = self.correlator.lock() {
            for state in self.rtp_streams.values() {
                if let Some(call_id) = &state.call_id {
                    correlator.apply_rtp_stats(
                        call_id,
                        state.tracker.packets_received(),
                        state.tracker.packet_loss(),
                        state.tracker.jitter_ms(),
                    );
                }
            }
        }

        if let Ok(mut tunnels) = self.tunnels.lock() {
            tunnels.finalize();
        }
        if let Ok(mut correlator) = self.correlator.lock() {
            correlator.finalize();
        }

        self.counters.sanity_drops += self.tcp.sanity_drops();
    }

    fn note_error(&mut self, stage: &str, err: Error) {
        match err {
            Error::Sanity(_) => {
                self.counters.sanity_drops += 1;
            },
            Error::StateViolation(reason) => {
                debug!("{stage}: state violation: {reason}");
            },
            err => {
                self.counters.warnings += 1;
                self.warnings.push(format!("{stage}: {err}"));
            },
        }
    }
}

/// Splits an IP datagram into addresses, protocol, and transport slice.
fn parse_ip_header(datagram: &[u8]) -> Option<(IpAddr, IpAddr, u8, &[u8])> {
    let version = datagram.first()? >> 4;
    match version {
        4 => {
            if datagram.len() < 20 {
                return None;
            }
            let header_len = usize::from(datagram[0] & 0x0F) * 4;
            if header_len < 20 || datagram.len() < header_len {
                return None;
            }
            let src = Ipv4Addr::new(
                datagram[12],
                datagram[13],
                datagram[14],
                datagram[15],
            );
            let dst = Ipv4Addr::new(
                datagram[16],
                datagram[17],
                datagram[18],
                datagram[19],
            );
            Some((
                IpAddr::V4(src),
                IpAddr::V4(dst),
                datagram[9],
                &datagram[header_len..],
            ))
        },
        6 => {
            if datagram.len() < 40 {
                return None;
            }
            let mut src = [0u8; 16];
            src.copy_from_slice(&datagram[8..24]);
            let mut dst = [0u8; 16];
            dst.copy_from_slice(&datagram[24..40]);

            // Walk a bounded extension chain to the transport header.
            let mut next_header = datagram[6];
            let mut cursor = 40usize;
            for _ in 0..10 {
                match next_header {
                    0 | 43 | 60 => {
                        if datagram.len() < cursor + 2 {
                            return None;
                        }
                        let len = (usize::from(datagram[cursor + 1]) + 1) * 8;
                        next_header = datagram[cursor];
                        cursor += len;
                        if datagram.len() < cursor {
                            return None;
                        }
                    },
                    _ => break,
                }
            }

            Some((
                IpAddr::V6(Ipv6Addr::from(src)),
                IpAddr::V6(Ipv6Addr::from(dst)),
                next_header,
                datagram.get(cursor..)?,
            ))
        },
        _ => None,
    }
}
