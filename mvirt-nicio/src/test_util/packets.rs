//! Frame builders for tests, using smoltcp for header construction.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, IpProtocol, Ipv4Address,
    Ipv4Packet, Ipv4Repr, UdpPacket, UdpRepr,
};

use crate::packet::PAUSE_MAC;

/// Ethernet header size
pub const ETHERNET_HDR_SIZE: usize = 14;

/// IP header size (without options)
pub const IP_HDR_SIZE: usize = 20;

/// UDP header size
pub const UDP_HDR_SIZE: usize = 8;

/// Minimum Ethernet frame without CRC
pub const MIN_FRAME_SIZE: usize = 60;

pub const SRC_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x00, 0x00, 0x01];
pub const DST_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x00, 0x00, 0x02];

/// An IPv4/UDP frame of `len` bytes (at least the headers) carrying `tos`
/// in its DSCP and ECN fields.
pub fn ipv4_frame(tos: u8, len: usize) -> Vec<u8> {
    let len = len.max(ETHERNET_HDR_SIZE + IP_HDR_SIZE + UDP_HDR_SIZE);
    let ip_len = len - ETHERNET_HDR_SIZE;
    let udp_len = ip_len - IP_HDR_SIZE;
    let payload: Vec<u8> = (0..udp_len - UDP_HDR_SIZE).map(|i| i as u8).collect();

    let mut packet = vec![0u8; len];

    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(SRC_MAC),
        dst_addr: EthernetAddress(DST_MAC),
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut packet[..]);
    eth_repr.emit(&mut eth_frame);

    let ip_repr = Ipv4Repr {
        src_addr: Ipv4Address::new(10, 0, 0, 1),
        dst_addr: Ipv4Address::new(10, 0, 0, 2),
        next_header: IpProtocol::Udp,
        payload_len: udp_len,
        hop_limit: 64,
    };
    let mut ip_packet = Ipv4Packet::new_unchecked(eth_frame.payload_mut());
    ip_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());
    ip_packet.set_dscp(tos >> 2);
    ip_packet.set_ecn(tos & 0b11);
    ip_packet.fill_checksum();

    let udp_repr = UdpRepr {
        src_port: 4000,
        dst_port: 4001,
    };
    let mut udp_packet = UdpPacket::new_unchecked(ip_packet.payload_mut());
    udp_repr.emit(
        &mut udp_packet,
        &ip_repr.src_addr.into(),
        &ip_repr.dst_addr.into(),
        payload.len(),
        |buf| buf.copy_from_slice(&payload),
        &ChecksumCapabilities::default(),
    );

    packet
}

/// An 802.3x pause frame, padded to the Ethernet minimum.
pub fn pause_frame() -> Vec<u8> {
    let mut packet = vec![0u8; MIN_FRAME_SIZE];
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(SRC_MAC),
        dst_addr: PAUSE_MAC,
        ethertype: EthernetProtocol::Unknown(0x8808),
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut packet[..]);
    eth_repr.emit(&mut eth_frame);
    // Opcode PAUSE, maximum pause time.
    let payload = eth_frame.payload_mut();
    payload[0..2].copy_from_slice(&0x0001u16.to_be_bytes());
    payload[2..4].copy_from_slice(&0xffffu16.to_be_bytes());
    packet
}
