use std::fmt::{Debug, Display, Formatter};

use bytes::{BufMut, Bytes};
use smoltcp::wire::{EthernetFrame, EthernetProtocol, Ipv4Packet};

/// Length of an Ethernet frame header on the wire (no VLAN tags).
pub(crate) const ETHERNET_HEADER_LEN: usize = 14;

/// Identity of an overlay peer, carried in the per-frame framing of every
/// tunnel datagram so the receiving router can relay on behalf of others.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub u64);

impl PeerId {
    pub const SERIALIZED_LEN: usize = size_of::<u64>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.0);
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let b = self.0.to_be_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// A raw Ethernet frame on its way to a remote peer.
///
/// Immutable on the fast path: the dispatcher, the queues and the pipelines
/// share the underlying buffer instead of copying it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardedFrame {
    pub src: PeerId,
    pub dst: PeerId,
    pub frame: Bytes,
}

impl ForwardedFrame {
    pub fn new(src: PeerId, dst: PeerId, frame: Bytes) -> ForwardedFrame {
        ForwardedFrame { src, dst, frame }
    }

    pub fn len(&self) -> usize {
        self.frame.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }

    /// A deliberately-sized zero frame used to probe whether the remote can
    /// receive at a candidate client PMTU.
    pub(crate) fn pmtu_probe(src: PeerId, dst: PeerId, len: usize) -> ForwardedFrame {
        ForwardedFrame {
            src,
            dst,
            frame: Bytes::from(vec![0u8; len]),
        }
    }
}

/// The parsed view of a frame that the dispatcher consults to decide whether
/// a too-big non-DF frame can be fragmented in the application.
///
/// Decoding never fails as such - a frame that is not well-formed
/// Ethernet+IPv4 simply decodes to fewer layers, and the dispatcher treats it
/// as opaque.
pub struct EthernetDecoder {
    ethertype: Option<EthernetProtocol>,
    ipv4: Option<Ipv4Fields>,
}

#[derive(Clone, Copy)]
pub(crate) struct Ipv4Fields {
    /// IHL * 4, i.e. including any IP options.
    pub(crate) header_len: usize,
    pub(crate) total_len: usize,
    /// Fragment offset of the original frame, in bytes.
    pub(crate) frag_offset: usize,
    pub(crate) more_frags: bool,
}

impl EthernetDecoder {
    pub fn decode(frame: &[u8]) -> EthernetDecoder {
        let Ok(eth) = EthernetFrame::new_checked(frame) else {
            return EthernetDecoder { ethertype: None, ipv4: None };
        };

        let ethertype = eth.ethertype();
        // 802.3 frames carry a length instead of a type; their payload may
        // still be IP, so let the header parse decide
        let is_llc = matches!(ethertype, EthernetProtocol::Unknown(v) if v < 0x600);
        let ipv4 = if ethertype == EthernetProtocol::Ipv4 || is_llc {
            Ipv4Packet::new_checked(eth.payload())
                .ok()
                .filter(|ip| ip.version() == 4)
                .map(|ip| Ipv4Fields {
                    header_len: usize::from(ip.header_len()),
                    total_len: usize::from(ip.total_len()),
                    frag_offset: usize::from(ip.frag_offset()),
                    more_frags: ip.more_frags(),
                })
        } else {
            None
        };

        EthernetDecoder { ethertype: Some(ethertype), ipv4 }
    }

    /// Whether both an Ethernet and a well-formed IPv4 header were decoded.
    pub fn is_ipv4(&self) -> bool {
        self.ipv4.is_some()
    }

    pub(crate) fn ipv4(&self) -> Option<Ipv4Fields> {
        self.ipv4
    }

    /// Ethertype values below 0x600 are 802.3 length fields: the frame uses
    /// LLC framing and the field must track the payload length.
    pub(crate) fn is_llc(&self) -> bool {
        matches!(self.ethertype, Some(EthernetProtocol::Unknown(v)) if v < 0x600)
    }
}
