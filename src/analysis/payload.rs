//! Statistical signals over a raw payload blob.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Bytes of payload kept as a printable preview
const PREVIEW_LEN: usize = 64;

/// Result of running the payload analyzer over one payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayloadAnalysis {
    pub size: usize,
    /// Shannon entropy in bits per byte, within [0, 8]
    pub entropy: f64,
    pub has_readable_content: bool,
    /// Hex SHA-256 of the payload
    pub hash: String,
    /// Leading bytes with non-printable characters replaced by '.'
    pub preview: String,
}

pub struct PayloadAnalyzer {
    printable_ratio: f64,
}

impl PayloadAnalyzer {
    pub fn new(printable_ratio: f64) -> Self {
        Self { printable_ratio }
    }

    pub fn analyze(&self, payload: &[u8]) -> PayloadAnalysis {
        PayloadAnalysis {
            size: payload.len(),
            entropy: shannon_entropy(payload),
            has_readable_content: contains_strings(payload, self.printable_ratio),
            hash: hex::encode(Sha256::digest(payload)),
            preview: preview(payload),
        }
    }
}

/// Shannon entropy over the 256-bucket byte histogram, in bits per byte.
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut histogram = [0usize; 256];
    for &byte in data {
        histogram[byte as usize] += 1;
    }

    let len = data.len() as f64;
    let entropy: f64 = histogram
        .iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum();

    // Single-valued input sums to -0.0, which `max` keeps
    if entropy > 0.0 {
        entropy
    } else {
        0.0
    }
}

/// True when more than `ratio` of the decoded characters are printable.
///
/// Bytes are decoded as lossy UTF-8. Each invalid sequence decodes to a single
/// replacement character that counts as non-printable, so binary noise lowers
/// the ratio instead of vanishing from it.
pub fn contains_strings(data: &[u8], ratio: f64) -> bool {
    let decoded = String::from_utf8_lossy(data);
    let total = decoded.chars().count();
    if total == 0 {
        return false;
    }

    let printable = decoded.chars().filter(|&c| is_printable(c)).count();
    (printable as f64 / total as f64) > ratio
}

fn is_printable(c: char) -> bool {
    if c == char::REPLACEMENT_CHARACTER {
        return false;
    }
    matches!(c, ' ' | '\t' | '\n' | '\r') || !c.is_control()
}

fn preview(data: &[u8]) -> String {
    data.iter()
        .take(PREVIEW_LEN)
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[test]
    fn test_entropy_bounds() {
        assert_eq!(shannon_entropy(&[]), 0.0);
        assert_eq!(shannon_entropy(&[0x41; 512]), 0.0);
        assert!(!shannon_entropy(&[0x41; 512]).is_sign_negative());

        let all_values: Vec<u8> = (0..=255u8).collect();
        assert!((shannon_entropy(&all_values) - 8.0).abs() < 1e-9);

        let mut random = vec![0u8; 4096];
        rand::thread_rng().fill_bytes(&mut random);
        let e = shannon_entropy(&random);
        assert!(e > 7.5 && e <= 8.0, "entropy {}", e);
    }

    #[test]
    fn test_single_valued_payload_serializes_zero_entropy() {
        let result = PayloadAnalyzer::new(0.7).analyze(&[0x41; 8]);
        assert!(!result.entropy.is_sign_negative());

        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"entropy\":0.0"), "{}", json);
    }

    #[test]
    fn test_two_symbol_entropy_is_one_bit() {
        let data = [0u8, 1, 0, 1, 0, 1, 0, 1];
        assert!((shannon_entropy(&data) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_contains_strings() {
        assert!(contains_strings(b"the quick brown fox", 0.7));
        assert!(contains_strings(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n", 0.7));
        assert!(!contains_strings(&[], 0.7));
        assert!(!contains_strings(&[0u8; 32], 0.7));
    }

    #[test]
    fn test_random_bytes_are_not_strings() {
        let mut blob = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut blob);
        assert!(!contains_strings(&blob, 0.7));

        // Nothing but invalid sequences
        let continuation: Vec<u8> = (0x80..0xc0u8).collect();
        assert!(!contains_strings(&continuation, 0.7));
    }

    #[test]
    fn test_analyze_fills_every_field() {
        let analyzer = PayloadAnalyzer::new(0.7);
        let result = analyzer.analyze(b"hello\x00world");

        assert_eq!(result.size, 11);
        assert!(result.entropy > 0.0);
        assert!(result.has_readable_content);
        assert_eq!(result.hash.len(), 64);
        assert_eq!(result.preview, "hello.world");
    }
}
