use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use etherparse::{InternetSlice, LinkSlice, SlicedPacket, TransportSlice};
use log::{debug, info, warn};
use pcap::{Capture, Device, Linktype};

use crate::capture::packet::{
    ArpPacket, DecodedPacket, EthernetHeader, IcmpHeader, Ipv4Header, Ipv6Header, NetworkLayer,
    TcpFlags, TcpHeader, TransportLayer, UdpHeader,
};
use crate::utils::error::AppError;

const ETHER_TYPE_ARP: u16 = 0x0806;
const ARP_LEN: usize = 28;

/// Supplies decoded packets on demand.
///
/// `capture` blocks the calling thread; async callers run it on the blocking pool.
/// It returns at most `count` packets and fewer when `timeout` expires first.
pub trait PacketSource: Send + Sync {
    fn capture(&self, count: usize, timeout: Duration) -> Result<Vec<DecodedPacket>, AppError>;

    /// Name of the interface or source, for logs and health output
    fn name(&self) -> &str;
}

/// Link-layer framing of captured data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Ethernet,
    /// No link header, data starts at the IP header
    RawIp,
    /// BSD loopback: 4-byte address family prefix
    Null,
    /// Linux cooked capture: 16-byte pseudo header
    LinuxSll,
}

impl LinkKind {
    pub fn from_linktype(linktype: Linktype) -> Option<Self> {
        match linktype {
            Linktype::ETHERNET => Some(Self::Ethernet),
            Linktype::RAW | Linktype(228) | Linktype(229) => Some(Self::RawIp),
            Linktype::NULL | Linktype::LOOP => Some(Self::Null),
            Linktype::LINUX_SLL => Some(Self::LinuxSll),
            _ => None,
        }
    }
}

/// Live capture from a network interface through libpcap
pub struct PcapSource {
    interface: String,
    snaplen: i32,
    promisc: bool,
    /// Read timeout handed to libpcap, in milliseconds
    read_timeout_ms: i32,
}

impl PcapSource {
    /// Open a source on `interface_name`; `"default"` picks the libpcap default device.
    pub fn new(interface_name: &str) -> Result<Self, AppError> {
        let devices = Self::list_interfaces()?;

        let interface = if interface_name == "default" {
            match Device::lookup() {
                Ok(Some(device)) => {
                    info!("Using default network interface: {}", device.name);
                    device.name
                }
                Ok(None) | Err(_) => {
                    warn!("Failed to find default interface");
                    match devices.first() {
                        Some(first) => {
                            info!("Falling back to first available interface: {}", first.name);
                            first.name.clone()
                        }
                        None => {
                            return Err(AppError::CaptureError(
                                "No network interfaces available".to_string(),
                            ))
                        }
                    }
                }
            }
        } else if let Some(device) = devices.iter().find(|d| d.name == interface_name) {
            device.name.clone()
        } else {
            return Err(AppError::CaptureError(format!(
                "Network interface not found: {}",
                interface_name
            )));
        };

        Ok(Self {
            interface,
            snaplen: 65535,
            promisc: true,
            read_timeout_ms: 500,
        })
    }

    pub fn list_interfaces() -> Result<Vec<Device>, AppError> {
        Device::list().map_err(|e| AppError::CaptureError(format!("Failed to list network devices: {}", e)))
    }
}

impl PacketSource for PcapSource {
    fn capture(&self, count: usize, timeout: Duration) -> Result<Vec<DecodedPacket>, AppError> {
        let deadline = Instant::now() + timeout;
        let read_timeout = self
            .read_timeout_ms
            .min(timeout.as_millis().try_into().unwrap_or(i32::MAX))
            .max(1);

        let mut cap = Capture::from_device(self.interface.as_str())
            .map_err(|e| AppError::CaptureError(format!("Failed to open device: {}", e)))?
            .snaplen(self.snaplen)
            .promisc(self.promisc)
            .timeout(read_timeout)
            .open()
            .map_err(|e| AppError::CaptureError(format!("Failed to open capture: {}", e)))?;

        let link = LinkKind::from_linktype(cap.get_datalink()).ok_or_else(|| {
            AppError::CaptureError(format!(
                "Unsupported link type {:?} on {}",
                cap.get_datalink(),
                self.interface
            ))
        })?;

        debug!("Capturing up to {} packets on {} ({:?})", count, self.interface, link);

        let mut packets = Vec::with_capacity(count);
        let mut skipped = 0usize;

        while packets.len() < count && Instant::now() < deadline {
            match cap.next_packet() {
                Ok(packet) => {
                    let ts = packet.header.ts;
                    let captured_at = Utc
                        .timestamp_opt(ts.tv_sec as i64, (ts.tv_usec as u32).saturating_mul(1000))
                        .single()
                        .unwrap_or_else(Utc::now);

                    match decode_frame(packet.data, link, packet.header.len as usize, captured_at) {
                        Ok(decoded) => packets.push(decoded),
                        Err(e) => {
                            skipped += 1;
                            debug!("Skipping undecodable frame: {}", e);
                        }
                    }
                }
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(e) => {
                    return Err(AppError::CaptureError(format!("Error capturing packet: {}", e)));
                }
            }
        }

        if packets.len() < count {
            debug!(
                "Capture on {} ended with {}/{} packets ({} skipped)",
                self.interface,
                packets.len(),
                count,
                skipped
            );
        }

        Ok(packets)
    }

    fn name(&self) -> &str {
        &self.interface
    }
}

/// Decode one captured frame into its layers.
pub fn decode_frame(
    data: &[u8],
    link: LinkKind,
    wire_length: usize,
    captured_at: DateTime<Utc>,
) -> Result<DecodedPacket, AppError> {
    let sliced = match link {
        LinkKind::Ethernet => SlicedPacket::from_ethernet(data),
        LinkKind::RawIp => SlicedPacket::from_ip(data),
        LinkKind::Null => SlicedPacket::from_ip(strip(data, 4)?),
        LinkKind::LinuxSll => SlicedPacket::from_ip(strip(data, 16)?),
    }
    .map_err(|e| AppError::DecodeError(format!("Failed to slice frame: {:?}", e)))?;

    let mut packet = DecodedPacket::new(wire_length.max(data.len()));
    packet.captured_at = captured_at;

    if let Some(LinkSlice::Ethernet2(eth)) = &sliced.link {
        packet.ethernet = Some(EthernetHeader {
            source: eth.source(),
            destination: eth.destination(),
            ether_type: eth.ether_type(),
        });
    }

    packet.network = match &sliced.ip {
        Some(InternetSlice::Ipv4(ip, ..)) => Some(NetworkLayer::Ipv4(Ipv4Header {
            version: ip.version(),
            ihl: ip.ihl(),
            tos: (ip.dcp() << 2) | ip.ecn(),
            total_length: ip.total_len(),
            identification: ip.identification(),
            dont_fragment: ip.dont_fragment(),
            more_fragments: ip.more_fragments(),
            fragment_offset: ip.fragments_offset(),
            ttl: ip.ttl(),
            protocol: ip.protocol(),
            checksum: ip.header_checksum(),
            source: Ipv4Addr::from(ip.source_addr()),
            destination: Ipv4Addr::from(ip.destination_addr()),
        })),
        Some(InternetSlice::Ipv6(ip, ..)) => Some(NetworkLayer::Ipv6(Ipv6Header {
            traffic_class: ip.traffic_class(),
            flow_label: ip.flow_label(),
            payload_length: ip.payload_length(),
            next_header: ip.next_header(),
            hop_limit: ip.hop_limit(),
            source: Ipv6Addr::from(ip.source_addr()),
            destination: Ipv6Addr::from(ip.destination_addr()),
        })),
        None => match &packet.ethernet {
            Some(eth) if eth.ether_type == ETHER_TYPE_ARP => parse_arp(sliced.payload).map(NetworkLayer::Arp),
            _ => None,
        },
    };

    packet.transport = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => Some(TransportLayer::Tcp(TcpHeader {
            source_port: tcp.source_port(),
            destination_port: tcp.destination_port(),
            sequence_number: tcp.sequence_number(),
            acknowledgment_number: tcp.acknowledgment_number(),
            data_offset: tcp.data_offset(),
            flags: TcpFlags {
                fin: tcp.fin(),
                syn: tcp.syn(),
                rst: tcp.rst(),
                psh: tcp.psh(),
                ack: tcp.ack(),
                urg: tcp.urg(),
                ece: tcp.ece(),
                cwr: tcp.cwr(),
            },
            window_size: tcp.window_size(),
            checksum: tcp.checksum(),
            urgent_pointer: tcp.urgent_pointer(),
        })),
        Some(TransportSlice::Udp(udp)) => Some(TransportLayer::Udp(UdpHeader {
            source_port: udp.source_port(),
            destination_port: udp.destination_port(),
            length: udp.length(),
            checksum: udp.checksum(),
        })),
        Some(TransportSlice::Icmpv4(icmp)) => Some(TransportLayer::Icmp(IcmpHeader {
            v6: false,
            icmp_type: icmp.type_u8(),
            code: icmp.code_u8(),
            checksum: icmp.checksum(),
        })),
        Some(TransportSlice::Icmpv6(icmp)) => Some(TransportLayer::Icmp(IcmpHeader {
            v6: true,
            icmp_type: icmp.type_u8(),
            code: icmp.code_u8(),
            checksum: icmp.checksum(),
        })),
        Some(TransportSlice::Unknown(_)) | None => None,
    };

    // ARP bodies are the network layer itself, trailing bytes are link padding
    let payload = declared_payload(data, &sliced);
    if packet.arp().is_none() && !payload.is_empty() {
        packet.payload = Some(payload.to_vec());
    }

    Ok(packet)
}

/// The part of the sliced payload covered by the IP length field.
///
/// Short frames are padded up to the link minimum and the slicer leaves that
/// padding in the payload. A zero length field (segmentation offload) is taken
/// as unknown and nothing is cut.
fn declared_payload<'a>(data: &[u8], sliced: &SlicedPacket<'a>) -> &'a [u8] {
    let ip_end = match &sliced.ip {
        Some(InternetSlice::Ipv4(ip, ..)) if ip.total_len() > 0 => {
            offset_in(data, ip.slice()) + usize::from(ip.total_len())
        }
        Some(InternetSlice::Ipv6(ip, ..)) if ip.payload_length() > 0 => {
            offset_in(data, ip.slice()) + ip.slice().len() + usize::from(ip.payload_length())
        }
        _ => return sliced.payload,
    };

    let declared = ip_end.saturating_sub(offset_in(data, sliced.payload));
    &sliced.payload[..declared.min(sliced.payload.len())]
}

/// Byte offset of `part` inside `frame`; `part` must be a subslice of `frame`
fn offset_in(frame: &[u8], part: &[u8]) -> usize {
    (part.as_ptr() as usize).saturating_sub(frame.as_ptr() as usize)
}

fn strip(data: &[u8], header_len: usize) -> Result<&[u8], AppError> {
    data.get(header_len..).ok_or_else(|| {
        AppError::DecodeError(format!(
            "Frame of {} bytes is shorter than its {}-byte link header",
            data.len(),
            header_len
        ))
    })
}

/// Parse an Ethernet/IPv4 ARP body; anything else is left undecoded
fn parse_arp(body: &[u8]) -> Option<ArpPacket> {
    if body.len() < ARP_LEN {
        return None;
    }
    let hardware_len = body[4];
    let protocol_len = body[5];
    if hardware_len != 6 || protocol_len != 4 {
        return None;
    }

    let mac = |offset: usize| -> [u8; 6] {
        let mut out = [0u8; 6];
        out.copy_from_slice(&body[offset..offset + 6]);
        out
    };
    let ip = |offset: usize| Ipv4Addr::new(body[offset], body[offset + 1], body[offset + 2], body[offset + 3]);

    Some(ArpPacket {
        operation: u16::from_be_bytes([body[6], body[7]]),
        sender_mac: mac(8),
        sender_ip: ip(14),
        target_mac: mac(18),
        target_ip: ip(24),
    })
}
