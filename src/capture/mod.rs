pub mod packet;
pub mod pcap;

pub use packet::DecodedPacket;
pub use self::pcap::{PacketSource, PcapSource};
