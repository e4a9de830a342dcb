use std::collections::BTreeSet;

use serde::Serialize;

use crate::analysis::payload::PayloadAnalysis;

/// Encryption status of the identified application protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionStatus {
    Encrypted,
    Plaintext,
    PotentiallyPlaintext,
    Unknown,
}

/// Transport protocol of a packet, as far as port classification is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Udp,
    Icmp,
}

/// A well-known service reachable on one or more ports
struct ServiceRule {
    ports: &'static [u16],
    protocol: &'static str,
    encryption: EncryptionStatus,
    indicator: Option<&'static str>,
}

const TCP_SERVICES: &[ServiceRule] = &[
    ServiceRule { ports: &[443], protocol: "HTTPS", encryption: EncryptionStatus::Encrypted, indicator: None },
    ServiceRule { ports: &[80], protocol: "HTTP", encryption: EncryptionStatus::Plaintext, indicator: Some("unencrypted_web_traffic") },
    ServiceRule { ports: &[22], protocol: "SSH", encryption: EncryptionStatus::Encrypted, indicator: None },
    ServiceRule { ports: &[21], protocol: "FTP", encryption: EncryptionStatus::Plaintext, indicator: Some("insecure_file_transfer") },
    ServiceRule { ports: &[23], protocol: "Telnet", encryption: EncryptionStatus::Plaintext, indicator: Some("insecure_terminal_access") },
    ServiceRule { ports: &[25], protocol: "SMTP", encryption: EncryptionStatus::PotentiallyPlaintext, indicator: None },
    ServiceRule { ports: &[53], protocol: "DNS", encryption: EncryptionStatus::Unknown, indicator: None },
    ServiceRule { ports: &[993, 995], protocol: "Secure Email", encryption: EncryptionStatus::Encrypted, indicator: None },
    ServiceRule { ports: &[3389], protocol: "RDP", encryption: EncryptionStatus::Unknown, indicator: Some("remote_desktop_access") },
];

const UDP_SERVICES: &[ServiceRule] = &[
    ServiceRule { ports: &[53], protocol: "DNS", encryption: EncryptionStatus::Unknown, indicator: None },
    ServiceRule { ports: &[67, 68], protocol: "DHCP", encryption: EncryptionStatus::Unknown, indicator: None },
    ServiceRule { ports: &[123], protocol: "NTP", encryption: EncryptionStatus::Unknown, indicator: None },
    ServiceRule { ports: &[161], protocol: "SNMP", encryption: EncryptionStatus::Unknown, indicator: None },
];

/// Payload summary carried inside the protocol findings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayloadInfo {
    pub size: usize,
    pub entropy: f64,
    pub contains_strings: bool,
}

/// What the classifier could infer about the protocol stack of a packet
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtocolFindings {
    pub protocol_stack: Vec<String>,
    pub application_protocol: Option<String>,
    pub encryption_status: EncryptionStatus,
    pub security_indicators: BTreeSet<String>,
    pub payload_info: Option<PayloadInfo>,
}

impl ProtocolFindings {
    fn empty() -> Self {
        Self {
            protocol_stack: Vec::new(),
            application_protocol: None,
            encryption_status: EncryptionStatus::Unknown,
            security_indicators: BTreeSet::new(),
            payload_info: None,
        }
    }
}

pub struct ProtocolClassifier {
    entropy_threshold: f64,
}

impl ProtocolClassifier {
    pub fn new(entropy_threshold: f64) -> Self {
        Self { entropy_threshold }
    }

    /// Classify by transport kind and ports.
    ///
    /// `lower_stack` holds the layer names already identified below the
    /// transport (e.g. `["Ethernet", "IPv4"]`); the transport and application
    /// names are appended to it.
    pub fn classify(
        &self,
        lower_stack: Vec<String>,
        transport: Option<TransportKind>,
        ports: Option<(u16, u16)>,
    ) -> ProtocolFindings {
        let mut findings = ProtocolFindings::empty();
        findings.protocol_stack = lower_stack;

        let table = match transport {
            Some(TransportKind::Tcp) => {
                findings.protocol_stack.push("TCP".to_string());
                Some(TCP_SERVICES)
            }
            Some(TransportKind::Udp) => {
                findings.protocol_stack.push("UDP".to_string());
                Some(UDP_SERVICES)
            }
            Some(TransportKind::Icmp) => {
                findings.protocol_stack.push("ICMP".to_string());
                None
            }
            None => None,
        };

        if let (Some(table), Some((src, dst))) = (table, ports) {
            if let Some(rule) = table
                .iter()
                .find(|rule| rule.ports.contains(&src) || rule.ports.contains(&dst))
            {
                findings.application_protocol = Some(rule.protocol.to_string());
                findings.encryption_status = rule.encryption;
                findings.protocol_stack.push(rule.protocol.to_string());
                if let Some(indicator) = rule.indicator {
                    findings.security_indicators.insert(indicator.to_string());
                }
            }
        }

        findings
    }

    /// Fold a payload analysis into the findings
    pub fn apply_payload(&self, findings: &mut ProtocolFindings, payload: &PayloadAnalysis) {
        findings.payload_info = Some(PayloadInfo {
            size: payload.size,
            entropy: payload.entropy,
            contains_strings: payload.has_readable_content,
        });

        if payload.entropy > self.entropy_threshold {
            findings.security_indicators.insert("high_entropy_payload".to_string());
        }
    }
}
