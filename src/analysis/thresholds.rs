use serde::{Deserialize, Serialize};

/// Tunable constants used by the classification pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisThresholds {
    /// Payload entropy (bits per byte) above which `high_entropy_payload` is raised
    pub entropy_threshold: f64,
    /// Share of printable characters required for `contains_strings`
    pub printable_ratio: f64,
    /// Distinct indicators needed for a medium risk level
    pub medium_risk_indicators: usize,
    /// Distinct indicators needed for a high risk level
    pub high_risk_indicators: usize,
    /// TTL strictly below this is reported as `low_ttl_detected`
    pub low_ttl: u8,
    /// TTL strictly above this is reported as `high_ttl_detected`
    pub high_ttl: u8,
}

impl Default for AnalysisThresholds {
    fn default() -> Self {
        Self {
            entropy_threshold: 7.5,
            printable_ratio: 0.7,
            medium_risk_indicators: 1,
            high_risk_indicators: 3,
            low_ttl: 32,
            high_ttl: 128,
        }
    }
}
