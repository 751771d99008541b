use bytes::BytesMut;
use smoltcp::wire::{EthernetFrame, EthernetProtocol, Ipv4Packet};
use thiserror::Error;

use crate::frame::{EthernetDecoder, ForwardedFrame, ETHERNET_HEADER_LEN};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FragmentError {
    #[error("client PMTU of {pmtu} bytes leaves no room for an 8-byte-aligned IPv4 fragment")]
    PmtuTooSmall { pmtu: usize },

    #[error("frame does not carry the IPv4 packet its decode claims")]
    Malformed,
}

/// Splits an Ethernet+IPv4 frame that exceeds the client PMTU into DF-safe
/// segments, in ascending offset order.
///
/// Each segment reuses the original IP header (same identification,
/// addresses, options) with its own length and fragment offset, and has the
/// More Fragments flag set - except the final segment, which restores the
/// original flag so that fragmenting an already-mid-stream fragment keeps
/// the tail marked correctly. Header checksums are recomputed; L4 payload
/// checksums are untouched since the overlay does no NAT.
pub fn fragment(
    frame: &ForwardedFrame,
    decoded: &EthernetDecoder,
    client_pmtu: usize,
    ethernet_overhead: usize,
) -> Result<Vec<ForwardedFrame>, FragmentError> {
    let ip = decoded.ipv4().ok_or(FragmentError::Malformed)?;

    // the IP fragment offset field counts in units of 8 bytes, so every
    // segment but the last must carry a multiple of 8
    let max_segment_size = client_pmtu
        .saturating_sub(ethernet_overhead)
        .saturating_sub(ip.header_len)
        & !7;
    if max_segment_size == 0 {
        return Err(FragmentError::PmtuTooSmall { pmtu: client_pmtu });
    }

    let headers = frame
        .frame
        .get(..ETHERNET_HEADER_LEN + ip.header_len)
        .ok_or(FragmentError::Malformed)?;
    let payload = frame
        .frame
        .get(ETHERNET_HEADER_LEN + ip.header_len..ETHERNET_HEADER_LEN + ip.total_len)
        .ok_or(FragmentError::Malformed)?;

    let mut segments = Vec::with_capacity(payload.len().div_ceil(max_segment_size));
    let mut offset = 0;
    while offset < payload.len() {
        let chunk = &payload[offset..(offset + max_segment_size).min(payload.len())];
        let last = offset + chunk.len() == payload.len();
        let segment_ip_len = ip.header_len + chunk.len();

        let mut seg = BytesMut::with_capacity(ETHERNET_HEADER_LEN + segment_ip_len);
        seg.extend_from_slice(headers);
        seg.extend_from_slice(chunk);

        let mut eth_seg = EthernetFrame::new_unchecked(seg.as_mut());
        if decoded.is_llc() {
            // 802.3 length field tracks the payload length
            eth_seg.set_ethertype(EthernetProtocol::Unknown(segment_ip_len as u16));
        }
        let mut ip_seg = Ipv4Packet::new_unchecked(eth_seg.payload_mut());
        ip_seg.set_total_len(segment_ip_len as u16);
        ip_seg.set_frag_offset((ip.frag_offset + offset) as u16);
        ip_seg.set_more_frags(if last { ip.more_frags } else { true });
        ip_seg.fill_checksum();

        segments.push(ForwardedFrame::new(frame.src, frame.dst, seg.freeze()));
        offset += chunk.len();
    }

    Ok(segments)
}
