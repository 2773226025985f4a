//! SRv6 (Segment Routing over IPv6) structures for netlink.

use std::net::Ipv6Addr;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::netlink::error::{Error, Result};

/// Segment Routing Header (struct ipv6_sr_hdr), RFC 8754.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Ipv6SrHdr {
    /// Next header type.
    pub nexthdr: u8,
    /// Header length in 8-byte units (not including first 8 bytes).
    pub hdrlen: u8,
    /// Routing type (must be 4 for SRH).
    pub sr_type: u8,
    /// Number of segments remaining.
    pub segments_left: u8,
    /// Index of the first segment (last segment in memory order).
    pub first_segment: u8,
    /// Flags.
    pub flags: u8,
    /// Tag for grouping packets.
    pub tag: u16,
}

kernel_struct!(Ipv6SrHdr);

impl Ipv6SrHdr {
    /// SRH routing type value.
    pub const SR_TYPE: u8 = 4;

    /// Header for a list of `num_segments` segments.
    pub fn new(num_segments: u8) -> Self {
        Self {
            nexthdr: 0,
            hdrlen: num_segments.saturating_mul(2),
            sr_type: Self::SR_TYPE,
            segments_left: num_segments.saturating_sub(1),
            first_segment: num_segments.saturating_sub(1),
            flags: 0,
            tag: 0,
        }
    }
}

/// SRv6 encapsulation modes.
pub mod seg6_mode {
    /// Insert SRH into the existing IPv6 packet.
    pub const INLINE: u32 = 0;
    /// Encapsulate in a new IPv6 header carrying the SRH.
    pub const ENCAP: u32 = 1;
}

/// Seg6 iptunnel attributes (SEG6_IPTUNNEL_*).
pub mod seg6_iptunnel {
    pub const SRH: u16 = 1;
}

/// Encode `struct seg6_iptunnel_encap`: mode, header, then segments in
/// reverse order (the kernel stores the final segment first).
pub fn encode_srh(mode: u32, segments: &[Ipv6Addr]) -> Result<Vec<u8>> {
    let count = u8::try_from(segments.len())
        .ok()
        .filter(|&n| n > 0 && n <= 127)
        .ok_or_else(|| {
            Error::InvalidRequest(format!(
                "SRv6 segment list must hold 1 to 127 entries, got {}",
                segments.len()
            ))
        })?;

    let mut buf = Vec::with_capacity(4 + Ipv6SrHdr::SIZE + 16 * segments.len());
    buf.extend_from_slice(&mode.to_ne_bytes());
    buf.extend_from_slice(Ipv6SrHdr::new(count).as_bytes());
    for segment in segments.iter().rev() {
        buf.extend_from_slice(&segment.octets());
    }
    Ok(buf)
}

/// Decode `struct seg6_iptunnel_encap` into the mode and segments in
/// travel order.
pub fn decode_srh(data: &[u8]) -> Result<(u32, Vec<Ipv6Addr>)> {
    let (mode, rest) = u32::read_from_prefix(data).map_err(|_| Error::Truncated {
        expected: 4,
        actual: data.len(),
    })?;
    let (hdr, rest) = Ipv6SrHdr::read_from_prefix(rest).map_err(|_| Error::Truncated {
        expected: 4 + Ipv6SrHdr::SIZE,
        actual: data.len(),
    })?;
    if hdr.sr_type != Ipv6SrHdr::SR_TYPE {
        return Err(Error::InvalidAttribute(format!(
            "unexpected routing header type {}",
            hdr.sr_type
        )));
    }

    let count = hdr.first_segment as usize + 1;
    if rest.len() < count * 16 {
        return Err(Error::Truncated {
            expected: 4 + Ipv6SrHdr::SIZE + count * 16,
            actual: data.len(),
        });
    }
    let mut segments: Vec<Ipv6Addr> = rest[..count * 16]
        .chunks_exact(16)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(chunk);
            Ipv6Addr::from(octets)
        })
        .collect();
    segments.reverse();
    Ok((mode, segments))
}
