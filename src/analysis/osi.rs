use serde::Serialize;

use crate::capture::packet::{DecodedPacket, NetworkLayer, TransportLayer};

/// The physical medium is not observable from decoded headers, only implied by the capture.
pub const PHYSICAL_MEDIUM: &str = "link medium";

/// Seven-slot OSI label set for one packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OsiLayers {
    pub physical: Option<String>,
    pub data_link: Option<String>,
    pub network: Option<String>,
    pub transport: Option<String>,
    pub session: Option<String>,
    pub presentation: Option<String>,
    pub application: Option<String>,
}

pub struct OsiLayerMapper;

impl OsiLayerMapper {
    /// Label the layers of `packet`.
    ///
    /// Session and presentation stay unset: decoded headers carry nothing that
    /// identifies them.
    pub fn map(packet: &DecodedPacket, application_protocol: Option<&str>) -> OsiLayers {
        let data_link = match (&packet.ethernet, &packet.network) {
            (Some(_), _) => Some("Ethernet".to_string()),
            (None, Some(NetworkLayer::Arp(_))) => Some("ARP".to_string()),
            (None, _) => None,
        };

        let network = match &packet.network {
            Some(NetworkLayer::Ipv4(ip)) => Some(format!("IPv{}", ip.version)),
            Some(NetworkLayer::Ipv6(_)) => Some("IPv6".to_string()),
            Some(NetworkLayer::Arp(_)) => Some("ARP".to_string()),
            None => None,
        };

        let transport = match &packet.transport {
            Some(TransportLayer::Tcp(tcp)) => Some(format!("TCP (port {})", tcp.destination_port)),
            Some(TransportLayer::Udp(udp)) => Some(format!("UDP (port {})", udp.destination_port)),
            Some(TransportLayer::Icmp(_)) => Some("ICMP".to_string()),
            None => None,
        };

        OsiLayers {
            physical: Some(PHYSICAL_MEDIUM.to_string()),
            data_link,
            network,
            transport,
            session: None,
            presentation: None,
            application: application_protocol.map(str::to_string),
        }
    }

    /// Names of the identified layers below the transport, bottom-up
    pub fn lower_stack(packet: &DecodedPacket) -> Vec<String> {
        let mut stack = Vec::new();
        if packet.ethernet.is_some() {
            stack.push("Ethernet".to_string());
        }
        match &packet.network {
            Some(NetworkLayer::Ipv4(_)) => stack.push("IPv4".to_string()),
            Some(NetworkLayer::Ipv6(_)) => stack.push("IPv6".to_string()),
            Some(NetworkLayer::Arp(_)) => stack.push("ARP".to_string()),
            None => {}
        }
        stack
    }
}
