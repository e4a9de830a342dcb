use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::error::AppError;

/// A packet as handed over by the capture collaborator.
///
/// Every layer is optional: a frame captured on a cooked/loopback link has no
/// Ethernet header, an ARP frame has no transport, a bare SYN has no payload.
/// Absence is a normal state and is matched on explicitly.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    /// Timestamp when the packet was captured
    pub captured_at: DateTime<Utc>,

    /// Length of the frame on the wire, in bytes
    pub wire_length: usize,

    /// Ethernet II header (if the link type carries one)
    pub ethernet: Option<EthernetHeader>,

    /// Network layer header
    pub network: Option<NetworkLayer>,

    /// Transport layer header
    pub transport: Option<TransportLayer>,

    /// Application payload following the innermost decoded header
    pub payload: Option<Vec<u8>>,
}

impl DecodedPacket {
    /// Create an empty packet of the given wire length, captured now
    pub fn new(wire_length: usize) -> Self {
        Self {
            captured_at: Utc::now(),
            wire_length,
            ethernet: None,
            network: None,
            transport: None,
            payload: None,
        }
    }

    pub fn ipv4(&self) -> Option<&Ipv4Header> {
        match &self.network {
            Some(NetworkLayer::Ipv4(ip)) => Some(ip),
            _ => None,
        }
    }

    pub fn ipv6(&self) -> Option<&Ipv6Header> {
        match &self.network {
            Some(NetworkLayer::Ipv6(ip)) => Some(ip),
            _ => None,
        }
    }

    pub fn arp(&self) -> Option<&ArpPacket> {
        match &self.network {
            Some(NetworkLayer::Arp(arp)) => Some(arp),
            _ => None,
        }
    }

    pub fn tcp(&self) -> Option<&TcpHeader> {
        match &self.transport {
            Some(TransportLayer::Tcp(tcp)) => Some(tcp),
            _ => None,
        }
    }

    pub fn udp(&self) -> Option<&UdpHeader> {
        match &self.transport {
            Some(TransportLayer::Udp(udp)) => Some(udp),
            _ => None,
        }
    }

    pub fn icmp(&self) -> Option<&IcmpHeader> {
        match &self.transport {
            Some(TransportLayer::Icmp(icmp)) => Some(icmp),
            _ => None,
        }
    }

    /// True when an IPv4 or IPv6 header is present
    pub fn has_ip(&self) -> bool {
        matches!(self.network, Some(NetworkLayer::Ipv4(_)) | Some(NetworkLayer::Ipv6(_)))
    }

    /// Source and destination addresses of the IP layer
    pub fn ip_addresses(&self) -> Option<(IpAddr, IpAddr)> {
        match &self.network {
            Some(NetworkLayer::Ipv4(ip)) => Some((IpAddr::V4(ip.source), IpAddr::V4(ip.destination))),
            Some(NetworkLayer::Ipv6(ip)) => Some((IpAddr::V6(ip.source), IpAddr::V6(ip.destination))),
            _ => None,
        }
    }

    /// Hop limit of the network layer (TTL for IPv4, hop limit for IPv6)
    pub fn ttl(&self) -> Option<u8> {
        match &self.network {
            Some(NetworkLayer::Ipv4(ip)) => Some(ip.ttl),
            Some(NetworkLayer::Ipv6(ip)) => Some(ip.hop_limit),
            _ => None,
        }
    }

    /// Source and destination ports (TCP or UDP)
    pub fn ports(&self) -> Option<(u16, u16)> {
        match &self.transport {
            Some(TransportLayer::Tcp(tcp)) => Some((tcp.source_port, tcp.destination_port)),
            Some(TransportLayer::Udp(udp)) => Some((udp.source_port, udp.destination_port)),
            _ => None,
        }
    }

    /// Payload bytes, treating an empty payload as absent
    pub fn payload_bytes(&self) -> Option<&[u8]> {
        self.payload.as_deref().filter(|p| !p.is_empty())
    }
}

/// Ethernet II header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetHeader {
    pub source: [u8; 6],
    pub destination: [u8; 6],
    pub ether_type: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkLayer {
    Ipv4(Ipv4Header),
    Ipv6(Ipv6Header),
    Arp(ArpPacket),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Raw version field, 4 for a well-formed header
    pub version: u8,
    /// Header length in 32-bit words
    pub ihl: u8,
    pub tos: u8,
    pub total_length: u16,
    pub identification: u16,
    pub dont_fragment: bool,
    pub more_fragments: bool,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Header {
    pub traffic_class: u8,
    pub flow_label: u32,
    pub payload_length: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub source: Ipv6Addr,
    pub destination: Ipv6Addr,
}

/// ARP over Ethernet/IPv4
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpPacket {
    /// 1 = request, 2 = reply
    pub operation: u16,
    pub sender_mac: [u8; 6],
    pub sender_ip: Ipv4Addr,
    pub target_mac: [u8; 6],
    pub target_ip: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportLayer {
    Tcp(TcpHeader),
    Udp(UdpHeader),
    Icmp(IcmpHeader),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence_number: u32,
    pub acknowledgment_number: u32,
    /// Header length in 32-bit words
    pub data_offset: u8,
    pub flags: TcpFlags,
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_pointer: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub length: u16,
    pub checksum: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpHeader {
    /// True for ICMPv6
    pub v6: bool,
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
}

/// TCP Flags
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    pub const FIN: u8 = 0b0000_0001;
    pub const SYN: u8 = 0b0000_0010;
    pub const RST: u8 = 0b0000_0100;
    pub const PSH: u8 = 0b0000_1000;
    pub const ACK: u8 = 0b0001_0000;
    pub const URG: u8 = 0b0010_0000;
    pub const ECE: u8 = 0b0100_0000;
    pub const CWR: u8 = 0b1000_0000;

    /// Single-letter codes in bit order
    const LETTERS: [(char, u8); 8] = [
        ('F', Self::FIN),
        ('S', Self::SYN),
        ('R', Self::RST),
        ('P', Self::PSH),
        ('A', Self::ACK),
        ('U', Self::URG),
        ('E', Self::ECE),
        ('C', Self::CWR),
    ];

    /// Create TCP flags from the flags byte of a TCP header
    pub fn from_u8(bits: u8) -> Self {
        Self {
            fin: bits & Self::FIN != 0,
            syn: bits & Self::SYN != 0,
            rst: bits & Self::RST != 0,
            psh: bits & Self::PSH != 0,
            ack: bits & Self::ACK != 0,
            urg: bits & Self::URG != 0,
            ece: bits & Self::ECE != 0,
            cwr: bits & Self::CWR != 0,
        }
    }

    /// Pack back into the header byte
    pub fn bits(&self) -> u8 {
        let mut result = 0;
        if self.fin { result |= Self::FIN; }
        if self.syn { result |= Self::SYN; }
        if self.rst { result |= Self::RST; }
        if self.psh { result |= Self::PSH; }
        if self.ack { result |= Self::ACK; }
        if self.urg { result |= Self::URG; }
        if self.ece { result |= Self::ECE; }
        if self.cwr { result |= Self::CWR; }
        result
    }

    /// Number of flags set
    pub fn count(&self) -> u32 {
        self.bits().count_ones()
    }
}

/// Renders the set flags in bit order, e.g. "S" for SYN, "SA" for SYN-ACK.
impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = self.bits();
        for (letter, mask) in Self::LETTERS {
            if bits & mask != 0 {
                write!(f, "{}", letter)?;
            }
        }
        Ok(())
    }
}

impl FromStr for TcpFlags {
    type Err = AppError;

    /// Parse a string of single-letter codes drawn from `FSRPAUEC`, in any order.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bits = 0u8;
        for c in s.chars() {
            let mask = Self::LETTERS
                .iter()
                .find(|(letter, _)| *letter == c.to_ascii_uppercase())
                .map(|(_, mask)| *mask)
                .ok_or_else(|| AppError::DecodeError(format!("Unknown TCP flag code '{}' in \"{}\"", c, s)))?;
            bits |= mask;
        }
        Ok(Self::from_u8(bits))
    }
}

/// Format a MAC address as colon-separated lowercase hex
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_bits_roundtrip_through_header_byte() {
        let flags = TcpFlags::from_u8(0x12);
        assert!(flags.syn && flags.ack);
        assert!(!flags.fin && !flags.rst);
        assert_eq!(flags.bits(), 0x12);
        assert_eq!(flags.count(), 2);
        assert_eq!(flags.to_string(), "SA");
    }

    #[test]
    fn test_flag_string_uses_bit_order() {
        let flags: TcpFlags = "AS".parse().unwrap();
        assert_eq!(flags.to_string(), "SA");

        let xmas: TcpFlags = "UAPRSF".parse().unwrap();
        assert_eq!(xmas.to_string(), "FSRPAU");

        assert_eq!(TcpFlags::default().to_string(), "");
    }

    #[test]
    fn test_unknown_flag_letter_is_rejected() {
        let result = "SX".parse::<TcpFlags>();
        assert!(matches!(result, Err(AppError::DecodeError(_))));
    }

    #[test]
    fn test_accessors_follow_layer_presence() {
        let mut packet = DecodedPacket::new(60);
        assert!(!packet.has_ip());
        assert!(packet.ttl().is_none());
        assert!(packet.ports().is_none());

        packet.network = Some(NetworkLayer::Ipv6(Ipv6Header {
            traffic_class: 0,
            flow_label: 0,
            payload_length: 20,
            next_header: 17,
            hop_limit: 255,
            source: Ipv6Addr::LOCALHOST,
            destination: Ipv6Addr::LOCALHOST,
        }));
        packet.transport = Some(TransportLayer::Udp(UdpHeader {
            source_port: 5353,
            destination_port: 5353,
            length: 20,
            checksum: 0,
        }));
        packet.payload = Some(Vec::new());

        assert!(packet.has_ip());
        assert_eq!(packet.ttl(), Some(255));
        assert_eq!(packet.ports(), Some((5353, 5353)));
        assert!(packet.payload_bytes().is_none());
    }

    #[test]
    fn test_format_mac() {
        assert_eq!(format_mac(&[0, 0x1b, 0x2c, 0xff, 0x0a, 1]), "00:1b:2c:ff:0a:01");
    }
}
