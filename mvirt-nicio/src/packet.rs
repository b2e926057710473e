//! Packets crossing the engine boundary, and the few header lookups the
//! data path needs (smoltcp wire views).

use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol, Ipv4Packet};

use crate::ids::PayloadToken;
use crate::pool::Buffer;

/// Destination of 802.3x flow-control (pause) frames.
pub const PAUSE_MAC: EthernetAddress = EthernetAddress([0x01, 0x80, 0xc2, 0x00, 0x00, 0x01]);

/// Parse an Ethernet frame.
pub fn parse_ethernet(data: &[u8]) -> Option<EthernetFrame<&[u8]>> {
    EthernetFrame::new_checked(data).ok()
}

pub fn is_pause_frame(data: &[u8]) -> bool {
    parse_ethernet(data).is_some_and(|eth| eth.dst_addr() == PAUSE_MAC)
}

/// ToS byte (DSCP and ECN) of an IPv4 frame.
pub fn ipv4_tos(data: &[u8]) -> Option<u8> {
    let eth = parse_ethernet(data)?;
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }
    let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
    Some(ip.dscp() << 2 | ip.ecn())
}

/// One contiguous piece of a TX packet, described by one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub addr: u64,
    pub len: usize,
}

/// Who gets the packet memory back after transmission.
#[derive(Debug)]
pub enum TxPayload {
    Pool(Buffer),
    External(PayloadToken),
}

/// A packet handed to the engine for transmission.
#[derive(Debug)]
pub struct TxPacket {
    payload: TxPayload,
    fragments: Vec<Fragment>,
    header: Vec<u8>,
}

impl TxPacket {
    /// Transmit a pool buffer as a single fragment, without copying.
    pub fn from_buffer(buffer: Buffer) -> Self {
        let fragments = vec![Fragment {
            addr: buffer.dma_addr(),
            len: buffer.len(),
        }];
        Self {
            payload: TxPayload::Pool(buffer),
            fragments,
            header: Vec::new(),
        }
    }

    /// Transmit memory owned by the network stack. `header` is a copy of
    /// the leading bytes, used for classification and ToS lookup.
    pub fn external(token: PayloadToken, fragments: Vec<Fragment>, header: Vec<u8>) -> Self {
        Self {
            payload: TxPayload::External(token),
            fragments,
            header,
        }
    }

    pub fn header(&self) -> &[u8] {
        match &self.payload {
            TxPayload::Pool(buffer) => buffer.data(),
            TxPayload::External(_) => &self.header,
        }
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn payload(&self) -> &TxPayload {
        &self.payload
    }

    /// Total bytes over all fragments.
    pub fn len(&self) -> usize {
        self.fragments.iter().map(|f| f.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_parts(self) -> (Vec<Fragment>, TxPayload) {
        (self.fragments, self.payload)
    }
}

/// A received frame. Owns the buffer it arrived in; dropping the frame
/// returns the buffer to its pool.
#[derive(Debug)]
pub struct RxFrame {
    buffer: Buffer,
    rxq: usize,
    l4_csum_ok: bool,
}

impl RxFrame {
    pub fn new(buffer: Buffer, rxq: usize, l4_csum_ok: bool) -> Self {
        Self {
            buffer,
            rxq,
            l4_csum_ok,
        }
    }

    pub fn data(&self) -> &[u8] {
        self.buffer.data()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn rxq(&self) -> usize {
        self.rxq
    }

    /// The device verified the layer-4 checksum.
    pub fn l4_csum_ok(&self) -> bool {
        self.l4_csum_ok
    }

    /// Take the buffer, e.g. to forward the frame without copying.
    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }
}
