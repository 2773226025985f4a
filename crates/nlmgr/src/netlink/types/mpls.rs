//! MPLS label stack encoding.
//!
//! A label entry is a big-endian 32-bit word:
//! label (20 bits) | traffic class (3) | bottom-of-stack (1) | TTL (8).

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::netlink::error::{Error, Result};

/// MPLS label entry (struct mpls_label).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MplsLabelEntry {
    /// Big-endian encoded label entry.
    pub entry: u32,
}

kernel_struct!(MplsLabelEntry);

impl MplsLabelEntry {
    /// Entry with TC=0, TTL=0 and the given bottom-of-stack bit.
    pub fn new(label: u32, bos: bool) -> Self {
        let mut entry = (label & mpls_label::MAX) << 12;
        if bos {
            entry |= 1 << 8;
        }
        Self {
            entry: entry.to_be(),
        }
    }

    /// Get the label value (20 bits).
    pub fn label(&self) -> u32 {
        (u32::from_be(self.entry) >> 12) & mpls_label::MAX
    }

    /// Get the traffic class (3 bits).
    pub fn tc(&self) -> u8 {
        ((u32::from_be(self.entry) >> 9) & 0x7) as u8
    }

    /// Check if this is the bottom of stack.
    pub fn is_bos(&self) -> bool {
        (u32::from_be(self.entry) & 0x100) != 0
    }

    /// Get the TTL value.
    pub fn ttl(&self) -> u8 {
        (u32::from_be(self.entry) & 0xFF) as u8
    }
}

/// Encode a label stack, setting bottom-of-stack on the last entry.
pub fn encode_stack(labels: &[u32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(labels.len() * MplsLabelEntry::SIZE);
    for (i, &label) in labels.iter().enumerate() {
        let entry = MplsLabelEntry::new(label, i + 1 == labels.len());
        buf.extend_from_slice(entry.as_bytes());
    }
    buf
}

/// Decode a label stack up to and including the bottom-of-stack entry.
pub fn decode_stack(data: &[u8]) -> Result<Vec<u32>> {
    if data.len() % MplsLabelEntry::SIZE != 0 {
        return Err(Error::InvalidAttribute(format!(
            "MPLS label stack of {} bytes is not a multiple of 4",
            data.len()
        )));
    }
    let mut labels = Vec::new();
    for chunk in data.chunks_exact(MplsLabelEntry::SIZE) {
        let entry = MplsLabelEntry::read_from_bytes(chunk).map_err(|_| Error::Truncated {
            expected: MplsLabelEntry::SIZE,
            actual: chunk.len(),
        })?;
        labels.push(entry.label());
        if entry.is_bos() {
            break;
        }
    }
    Ok(labels)
}

/// MPLS tunnel attributes (MPLS_IPTUNNEL_*).
pub mod mpls_tunnel {
    /// Destination label stack.
    pub const DST: u16 = 1;
    /// TTL propagation.
    pub const TTL: u16 = 2;
}

/// Lightweight tunnel encapsulation types (LWTUNNEL_ENCAP_*).
pub mod lwtunnel_encap {
    pub const NONE: u16 = 0;
    pub const MPLS: u16 = 1;
    pub const IP: u16 = 2;
    pub const IP6: u16 = 4;
    pub const SEG6: u16 = 5;
    pub const SEG6_LOCAL: u16 = 7;
}

/// Special MPLS label values.
pub mod mpls_label {
    /// IPv4 Explicit NULL.
    pub const IPV4_EXPLICIT_NULL: u32 = 0;
    /// IPv6 Explicit NULL.
    pub const IPV6_EXPLICIT_NULL: u32 = 2;
    /// Implicit NULL (penultimate hop popping).
    pub const IMPLICIT_NULL: u32 = 3;
    /// Maximum valid label value.
    pub const MAX: u32 = 0xFFFFF;
}
