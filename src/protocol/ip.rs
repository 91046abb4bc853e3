//! IP / TCP header inspection for captured frames.
//!
//! Only the fields needed to name the owning connection are read; nothing is
//! copied out of the frame.

use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::Packet;
use std::net::{IpAddr, SocketAddr};

use super::common::{ConnectionKey, IpFamily, LinkLayer};

const SLL_HEADER_LEN: usize = 16;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const IPV4_MIN_HEADER_LEN: usize = 20;

/// Returns the IP-layer bytes of a frame.
pub fn network_payload(link: LinkLayer, frame: &[u8]) -> Option<&[u8]> {
    match link {
        LinkLayer::RawIp => Some(frame),
        LinkLayer::Ethernet => {
            let ethernet = EthernetPacket::new(frame)?;
            match ethernet.get_ethertype() {
                EtherTypes::Ipv4 | EtherTypes::Ipv6 => {
                    frame.get(EthernetPacket::minimum_packet_size()..)
                }
                _ => None,
            }
        }
        LinkLayer::LinuxSll => {
            if frame.len() < SLL_HEADER_LEN {
                return None;
            }
            match u16::from_be_bytes([frame[14], frame[15]]) {
                ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => Some(&frame[SLL_HEADER_LEN..]),
                _ => None,
            }
        }
    }
}

/// IP version carried by the frame, if any.
pub fn ip_family(link: LinkLayer, frame: &[u8]) -> Option<IpFamily> {
    let ip = network_payload(link, frame)?;
    match ip.first()? >> 4 {
        4 => Some(IpFamily::Inet),
        6 => Some(IpFamily::Inet6),
        _ => None,
    }
}

/// Source address of the IP header.
pub fn source_address(link: LinkLayer, frame: &[u8]) -> Option<IpAddr> {
    let ip = network_payload(link, frame)?;
    match ip.first()? >> 4 {
        4 => Ipv4Packet::new(ip).map(|p| IpAddr::V4(p.get_source())),
        6 => Ipv6Packet::new(ip).map(|p| IpAddr::V6(p.get_source())),
        _ => None,
    }
}

/// Resolves an outbound frame to the TCP connection that sent it.
///
/// The packet source is the local end. Returns `None` for anything that is not
/// a TCP segment with a readable header: non-IP frames, other transports,
/// truncated headers and non-initial IPv4 fragments.
pub fn outbound_tcp_key(link: LinkLayer, frame: &[u8]) -> Option<ConnectionKey> {
    let ip = network_payload(link, frame)?;
    match ip.first()? >> 4 {
        4 => {
            let packet = Ipv4Packet::new(ip)?;
            if packet.get_next_level_protocol() != IpNextHeaderProtocols::Tcp
                || packet.get_fragment_offset() != 0
            {
                return None;
            }
            let header_len = usize::from(packet.get_header_length()) * 4;
            if header_len < IPV4_MIN_HEADER_LEN || header_len > ip.len() {
                return None;
            }
            let tcp = TcpPacket::new(ip.get(header_len..)?)?;
            Some(ConnectionKey::new(
                SocketAddr::new(IpAddr::V4(packet.get_source()), tcp.get_source()),
                SocketAddr::new(IpAddr::V4(packet.get_destination()), tcp.get_destination()),
            ))
        }
        6 => {
            let packet = Ipv6Packet::new(ip)?;
            // extension header chains are not followed
            if packet.get_next_header() != IpNextHeaderProtocols::Tcp {
                return None;
            }
            let tcp = TcpPacket::new(packet.payload())?;
            Some(ConnectionKey::new(
                SocketAddr::new(IpAddr::V6(packet.get_source()), tcp.get_source()),
                SocketAddr::new(IpAddr::V6(packet.get_destination()), tcp.get_destination()),
            ))
        }
        _ => None,
    }
}
