//! Serializable records produced by the classification pipeline.
//!
//! A `PacketRecord` is built once per captured packet and never mutated after
//! its batch is published, apart from the best-effort enrichment fields that
//! are filled in before publication.

use std::collections::BTreeSet;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::analysis::osi::OsiLayers;
use crate::analysis::payload::PayloadAnalysis;
use crate::analysis::protocol::{EncryptionStatus, ProtocolFindings};
use crate::analysis::tcp_flags::{ConnectionState, TcpFlagInfo};
use crate::analysis::thresholds::AnalysisThresholds;
use crate::enrichment::GeoLocation;

/// Coarse security score; ordered so that `Low < Medium < High`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Security verdict for one packet.
///
/// Only constructible through [`SecurityAssessment::assess`], so the risk level
/// always agrees with the indicator sets it was derived from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityAssessment {
    risk_level: RiskLevel,
    security_indicators: BTreeSet<String>,
    encryption_status: EncryptionStatus,
    network_behaviors: BTreeSet<String>,
}

impl SecurityAssessment {
    pub fn assess(
        security_indicators: BTreeSet<String>,
        network_behaviors: BTreeSet<String>,
        encryption_status: EncryptionStatus,
        tcp_security_concern: bool,
        thresholds: &AnalysisThresholds,
    ) -> Self {
        let indicator_count = security_indicators.union(&network_behaviors).count();

        let risk_level = if tcp_security_concern {
            RiskLevel::High
        } else if indicator_count >= thresholds.high_risk_indicators {
            RiskLevel::High
        } else if indicator_count >= thresholds.medium_risk_indicators {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        Self {
            risk_level,
            security_indicators,
            encryption_status,
            network_behaviors,
        }
    }

    pub fn risk_level(&self) -> RiskLevel {
        self.risk_level
    }

    pub fn security_indicators(&self) -> &BTreeSet<String> {
        &self.security_indicators
    }

    pub fn encryption_status(&self) -> EncryptionStatus {
        self.encryption_status
    }

    pub fn network_behaviors(&self) -> &BTreeSet<String> {
        &self.network_behaviors
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkMetrics {
    pub overhead_bytes: usize,
    pub efficiency_percent: f64,
    pub protocol_stack_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EthernetDetails {
    pub src_mac: String,
    pub dst_mac: String,
    pub ether_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IpFlags {
    pub dont_fragment: bool,
    pub more_fragments: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpDetails {
    pub version: u8,
    pub ttl: u8,
    /// IPv4 protocol number or IPv6 next header
    pub protocol: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_length: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tos: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_length: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identification: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<IpFlags>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragment_offset: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traffic_class: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_label: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_length: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TcpDetails {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence_number: u32,
    pub acknowledgment_number: u32,
    /// Header length in bytes
    pub header_length: u8,
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_pointer: u16,
    pub flags_analysis: TcpFlagInfo,
    pub connection_state: ConnectionState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UdpDetails {
    pub source_port: u16,
    pub destination_port: u16,
    pub length: u16,
    pub checksum: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IcmpDetails {
    pub version: u8,
    #[serde(rename = "type")]
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArpDetails {
    pub operation: String,
    pub sender_mac: String,
    pub sender_ip: String,
    pub target_mac: String,
    pub target_ip: String,
}

/// Per-protocol header breakdown; only the layers present in the packet are set
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TechnicalDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ethernet: Option<EthernetDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp: Option<UdpDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icmp: Option<IcmpDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arp: Option<ArpDetails>,
}

/// Fully classified packet
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyzedRecord {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
    pub size: usize,
    pub protocol: String,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub src_mac: Option<String>,
    pub dst_mac: Option<String>,
    pub ttl: Option<u8>,
    /// TCP flag codes in `FSRPAUEC` order, e.g. `"SA"`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<String>,
    pub layers: OsiLayers,
    pub protocol_analysis: ProtocolFindings,
    pub security_assessment: SecurityAssessment,
    pub technical_details: TechnicalDetails,
    pub network_metrics: NetworkMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_analysis: Option<PayloadAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_geo: Option<GeoLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_geo: Option<GeoLocation>,
}

/// Stand-in for a packet whose decoded fields could not be analyzed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegradedRecord {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
    pub size: usize,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PacketRecord {
    Analyzed(Box<AnalyzedRecord>),
    Degraded(DegradedRecord),
}

impl PacketRecord {
    pub fn id(&self) -> u64 {
        match self {
            Self::Analyzed(record) => record.id,
            Self::Degraded(record) => record.id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Analyzed(record) => record.timestamp,
            Self::Degraded(record) => record.timestamp,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Self::Analyzed(record) => record.size,
            Self::Degraded(record) => record.size,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(_))
    }

    pub fn analyzed(&self) -> Option<&AnalyzedRecord> {
        match self {
            Self::Analyzed(record) => Some(record),
            Self::Degraded(_) => None,
        }
    }

    pub fn analyzed_mut(&mut self) -> Option<&mut AnalyzedRecord> {
        match self {
            Self::Analyzed(record) => Some(record),
            Self::Degraded(_) => None,
        }
    }
}

/// The records of one capture invocation; the unit held in the cache
#[derive(Debug, Clone, Serialize)]
pub struct CaptureBatch {
    pub batch_id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Packet count the capture was asked for
    pub requested: usize,
    /// True when the capture ended on its timeout rather than its count
    pub timed_out: bool,
    pub records: Vec<PacketRecord>,
}

impl CaptureBatch {
    pub fn new(requested: usize, records: Vec<PacketRecord>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            captured_at: Utc::now(),
            duration_ms: 0,
            requested,
            timed_out: false,
            records,
        }
    }

    /// A batch with no records, used when a capture expires before yielding anything
    pub fn empty(requested: usize) -> Self {
        Self {
            timed_out: true,
            ..Self::new(requested, Vec::new())
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// At most `count` records, in capture order
    pub fn first(&self, count: usize) -> &[PacketRecord] {
        &self.records[..count.min(self.records.len())]
    }
}
