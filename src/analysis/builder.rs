use std::net::SocketAddr;

use log::warn;

use crate::analysis::behavior::{BehaviorInput, NetworkBehaviorAnalyzer};
use crate::analysis::osi::OsiLayerMapper;
use crate::analysis::payload::PayloadAnalyzer;
use crate::analysis::protocol::{ProtocolClassifier, TransportKind};
use crate::analysis::record::{
    AnalyzedRecord, ArpDetails, DegradedRecord, EthernetDetails, IcmpDetails, IpDetails, IpFlags,
    NetworkMetrics, PacketRecord, SecurityAssessment, TcpDetails, TechnicalDetails, UdpDetails,
};
use crate::analysis::tcp_flags::{TcpFlagAnalyzer, TcpFlagInfo};
use crate::analysis::thresholds::AnalysisThresholds;
use crate::capture::packet::{format_mac, DecodedPacket, NetworkLayer, TransportLayer};
use crate::utils::error::AppError;

/// Summary carried by every degraded record
pub const DEGRADED_SUMMARY: &str = "Error processing packet";

/// Runs every analyzer over a decoded packet and assembles the record.
pub struct PacketRecordBuilder {
    thresholds: AnalysisThresholds,
    payload_analyzer: PayloadAnalyzer,
    classifier: ProtocolClassifier,
    behavior_analyzer: NetworkBehaviorAnalyzer,
}

impl PacketRecordBuilder {
    pub fn new(thresholds: AnalysisThresholds) -> Self {
        Self {
            payload_analyzer: PayloadAnalyzer::new(thresholds.printable_ratio),
            classifier: ProtocolClassifier::new(thresholds.entropy_threshold),
            behavior_analyzer: NetworkBehaviorAnalyzer::new(thresholds.low_ttl, thresholds.high_ttl),
            thresholds,
        }
    }

    /// Build the record for `packet`.
    ///
    /// Never fails: a packet whose fields cannot be analyzed yields a degraded
    /// record carrying the same id, timestamp and size.
    pub fn build(&self, packet: &DecodedPacket, id: u64) -> PacketRecord {
        match self.try_build(packet, id) {
            Ok(record) => PacketRecord::Analyzed(Box::new(record)),
            Err(e) => {
                warn!("Packet {} could not be analyzed: {}", id, e);
                PacketRecord::Degraded(DegradedRecord {
                    id,
                    timestamp: packet.captured_at,
                    summary: DEGRADED_SUMMARY.to_string(),
                    size: packet.wire_length,
                    error: e.to_string(),
                })
            }
        }
    }

    fn try_build(&self, packet: &DecodedPacket, id: u64) -> Result<AnalyzedRecord, AppError> {
        validate(packet)?;

        let transport_kind = packet.transport.as_ref().map(|t| match t {
            TransportLayer::Tcp(_) => TransportKind::Tcp,
            TransportLayer::Udp(_) => TransportKind::Udp,
            TransportLayer::Icmp(_) => TransportKind::Icmp,
        });

        let mut findings = self.classifier.classify(
            OsiLayerMapper::lower_stack(packet),
            transport_kind,
            packet.ports(),
        );
        let layers = OsiLayerMapper::map(packet, findings.application_protocol.as_deref());

        let payload_analysis = packet.payload_bytes().map(|payload| {
            let analysis = self.payload_analyzer.analyze(payload);
            self.classifier.apply_payload(&mut findings, &analysis);
            analysis
        });

        let flag_info: Option<TcpFlagInfo> = packet.tcp().map(|tcp| TcpFlagAnalyzer::analyze(tcp.flags));
        let tcp_concern = flag_info.as_ref().map_or(false, |info| info.security_concern);
        if tcp_concern {
            findings.security_indicators.insert("connection_reset".to_string());
        }

        let network_behaviors = if packet.has_ip() {
            let ipv4 = packet.ipv4();
            self.behavior_analyzer.analyze(&BehaviorInput {
                ttl: packet.ttl(),
                more_fragments: ipv4.map_or(false, |ip| ip.more_fragments),
                fragment_offset: ipv4.map_or(0, |ip| ip.fragment_offset),
                tcp_flags: packet.tcp().map(|tcp| tcp.flags),
            })
        } else {
            Default::default()
        };

        let security_assessment = SecurityAssessment::assess(
            findings.security_indicators.clone(),
            network_behaviors,
            findings.encryption_status,
            tcp_concern,
            &self.thresholds,
        );

        let payload_size = payload_analysis.as_ref().map_or(0, |p| p.size);
        let network_metrics = network_metrics(packet.wire_length, payload_size, findings.protocol_stack.len());

        let protocol = findings
            .application_protocol
            .clone()
            .or_else(|| findings.protocol_stack.last().cloned())
            .unwrap_or_else(|| "Unknown".to_string());

        let (src_ip, dst_ip) = match packet.ip_addresses() {
            Some((src, dst)) => (Some(src), Some(dst)),
            None => (None, None),
        };
        let (src_port, dst_port) = match packet.ports() {
            Some((src, dst)) => (Some(src), Some(dst)),
            None => (None, None),
        };

        Ok(AnalyzedRecord {
            id,
            timestamp: packet.captured_at,
            summary: summarize(packet, &protocol),
            size: packet.wire_length,
            protocol,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            src_mac: packet.ethernet.as_ref().map(|eth| format_mac(&eth.source)),
            dst_mac: packet.ethernet.as_ref().map(|eth| format_mac(&eth.destination)),
            ttl: packet.ttl(),
            flags: packet.tcp().map(|tcp| tcp.flags.to_string()),
            layers,
            protocol_analysis: findings,
            security_assessment,
            technical_details: technical_details(packet, flag_info),
            network_metrics,
            payload_analysis,
            src_hostname: None,
            dst_hostname: None,
            src_geo: None,
            dst_geo: None,
        })
    }
}

impl Default for PacketRecordBuilder {
    fn default() -> Self {
        Self::new(AnalysisThresholds::default())
    }
}

/// Reject header values no real decoder would have produced
fn validate(packet: &DecodedPacket) -> Result<(), AppError> {
    if let Some(payload) = &packet.payload {
        if payload.len() > packet.wire_length {
            return Err(AppError::DecodeError(format!(
                "payload of {} bytes exceeds wire length {}",
                payload.len(),
                packet.wire_length
            )));
        }
    }

    if let Some(ip) = packet.ipv4() {
        if ip.version != 4 {
            return Err(AppError::DecodeError(format!("IPv4 header carries version {}", ip.version)));
        }
        if ip.ihl < 5 {
            return Err(AppError::DecodeError(format!("IPv4 header length {} is below minimum", ip.ihl)));
        }
    }

    if let Some(tcp) = packet.tcp() {
        if tcp.data_offset < 5 {
            return Err(AppError::DecodeError(format!(
                "TCP data offset {} is below minimum",
                tcp.data_offset
            )));
        }
    }

    Ok(())
}

fn network_metrics(size: usize, payload_size: usize, stack_depth: usize) -> NetworkMetrics {
    let efficiency_percent = if size > 0 && payload_size > 0 {
        let ratio = payload_size as f64 / size as f64 * 100.0;
        (ratio * 100.0).round() / 100.0
    } else {
        0.0
    };

    NetworkMetrics {
        overhead_bytes: size.saturating_sub(payload_size),
        efficiency_percent,
        protocol_stack_depth: stack_depth,
    }
}

/// One-line human readable description
fn summarize(packet: &DecodedPacket, protocol: &str) -> String {
    if let Some(arp) = packet.arp() {
        return match arp.operation {
            1 => format!("ARP who-has {} tell {}", arp.target_ip, arp.sender_ip),
            2 => format!("ARP {} is-at {}", arp.sender_ip, format_mac(&arp.sender_mac)),
            op => format!("ARP op {} {} > {}", op, arp.sender_ip, arp.target_ip),
        };
    }

    if let Some((src, dst)) = packet.ip_addresses() {
        return match &packet.transport {
            Some(TransportLayer::Tcp(tcp)) => format!(
                "{} {} > {} [{}] len={}",
                protocol,
                SocketAddr::new(src, tcp.source_port),
                SocketAddr::new(dst, tcp.destination_port),
                tcp.flags,
                packet.wire_length
            ),
            Some(TransportLayer::Udp(udp)) => format!(
                "{} {} > {} len={}",
                protocol,
                SocketAddr::new(src, udp.source_port),
                SocketAddr::new(dst, udp.destination_port),
                packet.wire_length
            ),
            Some(TransportLayer::Icmp(icmp)) => format!(
                "ICMP {} > {} {}",
                src,
                dst,
                icmp_description(icmp.v6, icmp.icmp_type)
            ),
            None => format!("{} {} > {} len={}", protocol, src, dst, packet.wire_length),
        };
    }

    match &packet.ethernet {
        Some(eth) => format!(
            "Ethernet {} > {} type=0x{:04x} len={}",
            format_mac(&eth.source),
            format_mac(&eth.destination),
            eth.ether_type,
            packet.wire_length
        ),
        None => format!("Unknown frame len={}", packet.wire_length),
    }
}

fn icmp_description(v6: bool, icmp_type: u8) -> String {
    let name = match (v6, icmp_type) {
        (false, 0) | (true, 129) => "echo reply",
        (false, 3) | (true, 1) => "destination unreachable",
        (false, 5) | (true, 137) => "redirect",
        (false, 8) | (true, 128) => "echo request",
        (false, 11) | (true, 3) => "time exceeded",
        (true, 2) => "packet too big",
        (true, 133) => "router solicitation",
        (true, 134) => "router advertisement",
        (true, 135) => "neighbor solicitation",
        (true, 136) => "neighbor advertisement",
        _ => return format!("type {}", icmp_type),
    };
    name.to_string()
}

fn technical_details(packet: &DecodedPacket, flag_info: Option<TcpFlagInfo>) -> TechnicalDetails {
    let mut details = TechnicalDetails {
        ethernet: packet.ethernet.as_ref().map(|eth| EthernetDetails {
            src_mac: format_mac(&eth.source),
            dst_mac: format_mac(&eth.destination),
            ether_type: format!("0x{:04x}", eth.ether_type),
        }),
        ..Default::default()
    };

    match &packet.network {
        Some(NetworkLayer::Ipv4(ip)) => {
            details.ip = Some(IpDetails {
                version: ip.version,
                ttl: ip.ttl,
                protocol: ip.protocol,
                header_length: Some(ip.ihl.saturating_mul(4)),
                tos: Some(ip.tos),
                total_length: Some(ip.total_length),
                identification: Some(ip.identification),
                flags: Some(IpFlags {
                    dont_fragment: ip.dont_fragment,
                    more_fragments: ip.more_fragments,
                }),
                fragment_offset: Some(ip.fragment_offset),
                checksum: Some(ip.checksum),
                traffic_class: None,
                flow_label: None,
                payload_length: None,
            });
        }
        Some(NetworkLayer::Ipv6(ip)) => {
            details.ip = Some(IpDetails {
                version: 6,
                ttl: ip.hop_limit,
                protocol: ip.next_header,
                header_length: None,
                tos: None,
                total_length: None,
                identification: None,
                flags: None,
                fragment_offset: None,
                checksum: None,
                traffic_class: Some(ip.traffic_class),
                flow_label: Some(ip.flow_label),
                payload_length: Some(ip.payload_length),
            });
        }
        Some(NetworkLayer::Arp(arp)) => {
            details.arp = Some(ArpDetails {
                operation: match arp.operation {
                    1 => "request".to_string(),
                    2 => "reply".to_string(),
                    op => format!("unknown ({})", op),
                },
                sender_mac: format_mac(&arp.sender_mac),
                sender_ip: arp.sender_ip.to_string(),
                target_mac: format_mac(&arp.target_mac),
                target_ip: arp.target_ip.to_string(),
            });
        }
        None => {}
    }

    match (&packet.transport, flag_info) {
        (Some(TransportLayer::Tcp(tcp)), Some(info)) => {
            details.tcp = Some(TcpDetails {
                source_port: tcp.source_port,
                destination_port: tcp.destination_port,
                sequence_number: tcp.sequence_number,
                acknowledgment_number: tcp.acknowledgment_number,
                header_length: tcp.data_offset.saturating_mul(4),
                window_size: tcp.window_size,
                checksum: tcp.checksum,
                urgent_pointer: tcp.urgent_pointer,
                connection_state: info.connection_state,
                flags_analysis: info,
            });
        }
        (Some(TransportLayer::Udp(udp)), _) => {
            details.udp = Some(UdpDetails {
                source_port: udp.source_port,
                destination_port: udp.destination_port,
                length: udp.length,
                checksum: udp.checksum,
            });
        }
        (Some(TransportLayer::Icmp(icmp)), _) => {
            details.icmp = Some(IcmpDetails {
                version: if icmp.v6 { 6 } else { 4 },
                icmp_type: icmp.icmp_type,
                code: icmp.code,
                checksum: icmp.checksum,
                description: icmp_description(icmp.v6, icmp.icmp_type),
            });
        }
        _ => {}
    }

    details
}
