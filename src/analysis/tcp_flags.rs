use serde::Serialize;

use crate::capture::packet::TcpFlags;

/// Connection phase implied by a single segment's flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    ConnectionInitiation,
    ConnectionResponse,
    Established,
    ConnectionTermination,
    ConnectionReset,
    Unknown,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionInitiation => "connection_initiation",
            Self::ConnectionResponse => "connection_response",
            Self::Established => "established",
            Self::ConnectionTermination => "connection_termination",
            Self::ConnectionReset => "connection_reset",
            Self::Unknown => "unknown",
        }
    }
}

/// Decoded view of a TCP flag byte
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TcpFlagInfo {
    /// Letter codes in bit order, e.g. "SA"
    pub raw: String,
    /// Named flags in canonical order
    #[serde(rename = "flags_present")]
    pub flags: Vec<&'static str>,
    pub connection_state: ConnectionState,
    pub security_concern: bool,
}

pub struct TcpFlagAnalyzer;

impl TcpFlagAnalyzer {
    /// Canonical output order, matching the bit order of the header byte
    const NAMES: [(u8, &'static str); 8] = [
        (TcpFlags::FIN, "FIN"),
        (TcpFlags::SYN, "SYN"),
        (TcpFlags::RST, "RST"),
        (TcpFlags::PSH, "PSH"),
        (TcpFlags::ACK, "ACK"),
        (TcpFlags::URG, "URG"),
        (TcpFlags::ECE, "ECE"),
        (TcpFlags::CWR, "CWR"),
    ];

    pub fn analyze(flags: TcpFlags) -> TcpFlagInfo {
        let bits = flags.bits();
        let names = Self::NAMES
            .iter()
            .filter(|(mask, _)| bits & mask != 0)
            .map(|(_, name)| *name)
            .collect();

        let connection_state = Self::connection_state(flags);

        TcpFlagInfo {
            raw: flags.to_string(),
            flags: names,
            connection_state,
            security_concern: connection_state == ConnectionState::ConnectionReset,
        }
    }

    /// First match wins.
    fn connection_state(flags: TcpFlags) -> ConnectionState {
        if flags.syn && !flags.ack {
            ConnectionState::ConnectionInitiation
        } else if flags.syn && flags.ack {
            ConnectionState::ConnectionResponse
        } else if flags.ack && flags.count() == 1 {
            ConnectionState::Established
        } else if flags.fin {
            ConnectionState::ConnectionTermination
        } else if flags.rst {
            ConnectionState::ConnectionReset
        } else {
            ConnectionState::Unknown
        }
    }
}
