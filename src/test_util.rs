//! Shared builders for tests: hand-assembled Ethernet/IPv4 frames with valid
//! checksums, and helpers to look inside plain-encryptor datagrams.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use smoltcp::wire::Ipv4Packet;
use tokio::net::UdpSocket;

use crate::config::ForwarderConfig;
use crate::connection::PeerConnection;
use crate::frame::PeerId;

pub(crate) struct Ipv4FrameSpec {
    pub payload_len: usize,
    pub ident: u16,
    /// Fragment offset of the frame itself, in bytes (must be a multiple
    /// of 8).
    pub frag_offset: usize,
    pub more_frags: bool,
    /// Use an 802.3 length field instead of the IPv4 ethertype.
    pub llc: bool,
}

impl Default for Ipv4FrameSpec {
    fn default() -> Ipv4FrameSpec {
        Ipv4FrameSpec {
            payload_len: 0,
            ident: 1,
            frag_offset: 0,
            more_frags: false,
            llc: false,
        }
    }
}

/// An Ethernet frame with the given ethertype (or 802.3 length) field and a
/// zeroed payload.
pub(crate) fn ethernet_frame(ethertype: u16, payload_len: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(14 + payload_len);
    buf.put_slice(&[0x02, 0, 0, 0, 0, 1]);
    buf.put_slice(&[0x02, 0, 0, 0, 0, 2]);
    buf.put_u16(ethertype);
    buf.put_bytes(0, payload_len);
    buf.freeze()
}

/// A well-formed Ethernet+IPv4 frame with an option-less header, a valid
/// header checksum and a recognisable payload pattern.
pub(crate) fn ipv4_frame(spec: &Ipv4FrameSpec) -> Bytes {
    assert_eq!(spec.frag_offset % 8, 0, "IPv4 fragment offsets count in units of 8 bytes");
    let total_len = 20 + spec.payload_len;

    let mut buf = BytesMut::with_capacity(14 + total_len);
    buf.put_slice(&[0x02, 0, 0, 0, 0, 1]);
    buf.put_slice(&[0x02, 0, 0, 0, 0, 2]);
    buf.put_u16(if spec.llc { total_len as u16 } else { 0x0800 });

    buf.put_u8(0x45); // version 4, IHL 5
    buf.put_u8(0);
    buf.put_u16(total_len as u16);
    buf.put_u16(spec.ident);
    let mut flags_and_offset = (spec.frag_offset as u16) >> 3;
    if spec.more_frags {
        flags_and_offset |= 0x2000;
    }
    buf.put_u16(flags_and_offset);
    buf.put_u8(64); // ttl
    buf.put_u8(17); // udp
    buf.put_u16(0); // checksum, filled in below
    buf.put_slice(&[10, 0, 0, 1]);
    buf.put_slice(&[10, 0, 0, 2]);
    for i in 0..spec.payload_len {
        buf.put_u8(i as u8);
    }

    Ipv4Packet::new_unchecked(&mut buf[14..]).fill_checksum();
    buf.freeze()
}

/// Splits plain-encryptor datagrams back into their framed frames, in send
/// order.
pub(crate) fn parse_plain_datagrams(datagrams: &[Vec<u8>]) -> Vec<(u64, u64, Vec<u8>)> {
    let mut frames = Vec::new();
    for datagram in datagrams {
        let mut buf = &datagram[1..];
        while buf.has_remaining() {
            let src = buf.get_u64();
            let dst = buf.get_u64();
            let len = usize::from(buf.get_u16());
            frames.push((src, dst, buf[..len].to_vec()));
            buf.advance(len);
        }
    }
    frames
}

/// A connection between peers 1 and 2 with the default IPv4 config and a
/// throwaway shared socket. Forwarding is not started.
pub(crate) async fn test_connection(stack_frag: bool) -> Arc<PeerConnection> {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    Arc::new(PeerConnection::new(
        PeerId(1),
        PeerId(2),
        "127.0.0.1:6783".parse().unwrap(),
        socket,
        None,
        stack_frag,
        Arc::new(ForwarderConfig::default_ipv4()),
    ))
}
