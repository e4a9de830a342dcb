use std::collections::BTreeSet;

use crate::capture::packet::TcpFlags;

/// Network-layer facts the behavior rules look at
#[derive(Debug, Clone, Copy, Default)]
pub struct BehaviorInput {
    pub ttl: Option<u8>,
    pub more_fragments: bool,
    pub fragment_offset: u16,
    pub tcp_flags: Option<TcpFlags>,
}

/// Flags scan signatures and TTL/fragmentation anomalies
pub struct NetworkBehaviorAnalyzer {
    low_ttl: u8,
    high_ttl: u8,
}

impl NetworkBehaviorAnalyzer {
    const XMAS: u8 = TcpFlags::FIN | TcpFlags::SYN | TcpFlags::RST | TcpFlags::PSH | TcpFlags::ACK | TcpFlags::URG;

    pub fn new(low_ttl: u8, high_ttl: u8) -> Self {
        Self { low_ttl, high_ttl }
    }

    /// Every rule is evaluated independently.
    pub fn analyze(&self, input: &BehaviorInput) -> BTreeSet<String> {
        let mut behaviors = BTreeSet::new();

        if let Some(ttl) = input.ttl {
            if ttl < self.low_ttl {
                behaviors.insert("low_ttl_detected".to_string());
            }
            if ttl > self.high_ttl {
                behaviors.insert("high_ttl_detected".to_string());
            }
        }

        if input.more_fragments || input.fragment_offset > 0 {
            behaviors.insert("fragmented_packet".to_string());
        }

        if let Some(flags) = input.tcp_flags {
            let bits = flags.bits();
            if bits == TcpFlags::SYN {
                behaviors.insert("syn_scan_attempt".to_string());
            }
            if bits == TcpFlags::FIN {
                behaviors.insert("fin_scan_attempt".to_string());
            }
            if bits & Self::XMAS == Self::XMAS {
                behaviors.insert("xmas_scan_attempt".to_string());
            }
        }

        behaviors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> NetworkBehaviorAnalyzer {
        NetworkBehaviorAnalyzer::new(32, 128)
    }

    fn with_ttl(ttl: u8) -> BehaviorInput {
        BehaviorInput { ttl: Some(ttl), ..Default::default() }
    }

    #[test]
    fn test_ttl_anomalies() {
        assert!(analyzer().analyze(&with_ttl(20)).contains("low_ttl_detected"));
        assert!(analyzer().analyze(&with_ttl(200)).contains("high_ttl_detected"));
        assert!(analyzer().analyze(&with_ttl(64)).is_empty());
        // Bounds are exclusive
        assert!(analyzer().analyze(&with_ttl(32)).is_empty());
        assert!(analyzer().analyze(&with_ttl(128)).is_empty());
    }

    #[test]
    fn test_fragmentation() {
        let mf = BehaviorInput { more_fragments: true, ..with_ttl(64) };
        assert!(analyzer().analyze(&mf).contains("fragmented_packet"));

        let tail = BehaviorInput { fragment_offset: 185, ..with_ttl(64) };
        assert!(analyzer().analyze(&tail).contains("fragmented_packet"));
    }

    #[test]
    fn test_scan_signatures_need_exact_flag_sets() {
        let scan = |codes: &str| {
            let input = BehaviorInput { tcp_flags: Some(codes.parse().unwrap()), ..with_ttl(64) };
            analyzer().analyze(&input)
        };

        assert!(scan("S").contains("syn_scan_attempt"));
        assert!(!scan("SA").contains("syn_scan_attempt"));
        assert!(scan("F").contains("fin_scan_attempt"));
        assert!(!scan("FA").contains("fin_scan_attempt"));
        assert!(scan("FSRPAU").contains("xmas_scan_attempt"));
        assert!(scan("FSRPAUEC").contains("xmas_scan_attempt"));
        assert!(!scan("FPU").contains("xmas_scan_attempt"));
    }

    #[test]
    fn test_rules_combine() {
        let input = BehaviorInput {
            ttl: Some(10),
            more_fragments: true,
            fragment_offset: 0,
            tcp_flags: Some("S".parse().unwrap()),
        };
        let behaviors = analyzer().analyze(&input);
        assert_eq!(behaviors.len(), 3);
    }
}
