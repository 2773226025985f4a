//! Netlink attribute (rtattr/nlattr) handling.
//!
//! Attributes are `{len: u16, type: u16, value}` triples padded to four
//! bytes. `len` covers header and value but not the padding. All integers
//! are in host byte order, matching the kernel on the same machine.
//!
//! Decoding is strict: a buffer that ends inside a header yields
//! [`Error::AttrHeaderTruncated`], and a header that claims more bytes than
//! remain yields [`Error::AttrBodyTruncated`]. Nested attributes are not
//! expanded eagerly; call [`AttrIter::new`] again on a child's value.

use super::error::{Error, Result};
use super::parse::ToNetlink;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Netlink attribute alignment.
pub const NLA_ALIGNTO: usize = 4;

/// Align a length to NLA_ALIGNTO boundary.
#[inline]
pub const fn nla_align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

/// Size of the attribute header.
pub const NLA_HDRLEN: usize = 4;

/// Netlink attribute header (mirrors struct nlattr / struct rtattr).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlAttr {
    /// Length including header.
    pub nla_len: u16,
    /// Attribute type.
    pub nla_type: u16,
}

/// Attribute type flags.
pub const NLA_F_NESTED: u16 = 1 << 15;
pub const NLA_F_NET_BYTEORDER: u16 = 1 << 14;
pub const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

impl NlAttr {
    /// Create a new attribute header.
    ///
    /// Fails with [`Error::AttrTooLarge`] when header plus data does not fit
    /// in `nla_len`.
    pub fn new(attr_type: u16, data_len: usize) -> Result<Self> {
        Ok(Self {
            nla_len: attr_len(NLA_HDRLEN + data_len)?,
            nla_type: attr_type,
        })
    }

    /// Get the attribute type without flags.
    pub fn kind(&self) -> u16 {
        self.nla_type & NLA_TYPE_MASK
    }

    /// Check if this is a nested attribute.
    pub fn is_nested(&self) -> bool {
        self.nla_type & NLA_F_NESTED != 0
    }

    /// Get the payload length (total length minus header).
    pub fn payload_len(&self) -> usize {
        (self.nla_len as usize).saturating_sub(NLA_HDRLEN)
    }

    /// Convert to bytes.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }

    /// Parse from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(data)
            .map(|(r, _)| r)
            .map_err(|_| Error::AttrHeaderTruncated)
    }
}

/// Check that a total attribute length fits the header's `u16`.
pub fn attr_len(len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| Error::AttrTooLarge { len })
}

/// Encode a single attribute: header followed by `value`, unpadded.
///
/// The caller aligns whatever follows with [`nla_align`].
pub fn encode(attr_type: u16, value: &[u8], nested: bool) -> Result<Vec<u8>> {
    let kind = if nested {
        attr_type | NLA_F_NESTED
    } else {
        attr_type
    };
    let mut buf = Vec::with_capacity(NLA_HDRLEN + value.len());
    buf.extend_from_slice(NlAttr::new(kind, value.len())?.as_bytes());
    buf.extend_from_slice(value);
    Ok(buf)
}

/// Decode every attribute in `data` into `(type, value)` pairs.
///
/// The returned type has the nested/byte-order flags masked off.
pub fn decode(data: &[u8]) -> Result<Vec<(u16, &[u8])>> {
    AttrIter::new(data).collect()
}

/// Iterator over netlink attributes in a buffer.
///
/// Yields `(type, payload)` with flags stripped. After the first error the
/// iterator is exhausted.
pub struct AttrIter<'a> {
    data: &'a [u8],
}

impl<'a> AttrIter<'a> {
    /// Create a new attribute iterator.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Check if there are no more attributes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Yield the next raw header and value, keeping the type flags.
    pub fn next_raw(&mut self) -> Option<Result<(NlAttr, &'a [u8])>> {
        if self.data.is_empty() {
            return None;
        }

        let attr = match NlAttr::from_bytes(self.data) {
            Ok(a) => *a,
            Err(e) => {
                self.data = &[];
                return Some(Err(e));
            }
        };

        let len = attr.nla_len as usize;
        if len < NLA_HDRLEN {
            self.data = &[];
            return Some(Err(Error::InvalidAttribute(format!(
                "attribute length {} shorter than header",
                len
            ))));
        }
        if len > self.data.len() {
            let remaining = self.data.len();
            self.data = &[];
            return Some(Err(Error::AttrBodyTruncated {
                declared: len,
                remaining,
            }));
        }

        let payload = &self.data[NLA_HDRLEN..len];
        // Padding bytes may hold garbage; only the stride matters.
        let stride = nla_align(len).min(self.data.len());
        self.data = &self.data[stride..];

        Some(Ok((attr, payload)))
    }
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = Result<(u16, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_raw()
            .map(|res| res.map(|(attr, payload)| (attr.kind(), payload)))
    }
}

/// An owned attribute, optionally carrying nested children.
///
/// Children are serialized after `value` inside the same attribute, which
/// is how the kernel lays out nests such as `TCA_OPTIONS` or `RTA_ENCAP`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtAttr {
    /// Attribute type, flags included.
    pub kind: u16,
    /// Raw value bytes preceding any children.
    pub value: Vec<u8>,
    /// Nested child attributes.
    pub children: Vec<RtAttr>,
}

impl RtAttr {
    /// Create a leaf attribute.
    pub fn new(kind: u16, value: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            value: value.into(),
            children: Vec::new(),
        }
    }

    /// Create an empty nest marked with `NLA_F_NESTED`.
    pub fn nested(kind: u16) -> Self {
        Self {
            kind: kind | NLA_F_NESTED,
            value: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Append a child and return a handle to it.
    pub fn add_child(&mut self, child: RtAttr) -> &mut RtAttr {
        self.children.push(child);
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    /// Append a leaf child.
    pub fn add_value(&mut self, kind: u16, value: impl Into<Vec<u8>>) -> &mut RtAttr {
        self.add_child(RtAttr::new(kind, value))
    }

    /// Type without flags.
    pub fn kind(&self) -> u16 {
        self.kind & NLA_TYPE_MASK
    }

    /// Length as written in the header. Children are padded, the attribute itself is not.
    pub fn len(&self) -> usize {
        if self.children.is_empty() {
            return NLA_HDRLEN + self.value.len();
        }
        let children: usize = self.children.iter().map(|c| nla_align(c.len())).sum();
        NLA_HDRLEN + nla_align(self.value.len()) + children
    }

    /// True when the attribute carries neither value nor children.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty() && self.children.is_empty()
    }

    /// Serialize the attribute, padding children but not the attribute itself.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let len = self.len();
        let mut buf = Vec::with_capacity(nla_align(len));
        buf.extend_from_slice(NlAttr::new(self.kind, len - NLA_HDRLEN)?.as_bytes());
        buf.extend_from_slice(&self.value);
        if !self.children.is_empty() {
            buf.resize(nla_align(buf.len()), 0);
            for child in &self.children {
                buf.extend_from_slice(&child.serialize()?);
                buf.resize(nla_align(buf.len()), 0);
            }
        }
        Ok(buf)
    }

    /// Decode a buffer into a tree, expanding attributes flagged as nested.
    pub fn parse_tree(data: &[u8]) -> Result<Vec<RtAttr>> {
        let mut out = Vec::new();
        let mut iter = AttrIter::new(data);
        while let Some(item) = iter.next_raw() {
            let (hdr, payload) = item?;
            if hdr.is_nested() {
                out.push(RtAttr {
                    kind: hdr.nla_type,
                    value: Vec::new(),
                    children: Self::parse_tree(payload)?,
                });
            } else {
                out.push(RtAttr::new(hdr.nla_type, payload));
            }
        }
        Ok(out)
    }
}

impl ToNetlink for RtAttr {
    fn netlink_len(&self) -> usize {
        nla_align(self.len())
    }

    fn write_to(&self, buf: &mut Vec<u8>) -> Result<usize> {
        let mut bytes = self.serialize()?;
        bytes.resize(nla_align(bytes.len()), 0);
        buf.extend_from_slice(&bytes);
        Ok(bytes.len())
    }
}

/// Helper functions for extracting typed values from attribute payloads.
pub mod get {
    use super::*;

    /// Extract a u8 value.
    pub fn u8(data: &[u8]) -> Result<u8> {
        if data.is_empty() {
            return Err(Error::InvalidAttribute("empty u8 attribute".into()));
        }
        Ok(data[0])
    }

    /// Extract a u16 value (native endian).
    pub fn u16_ne(data: &[u8]) -> Result<u16> {
        if data.len() < 2 {
            return Err(Error::InvalidAttribute("truncated u16 attribute".into()));
        }
        Ok(u16::from_ne_bytes([data[0], data[1]]))
    }

    /// Extract a u32 value (native endian).
    pub fn u32_ne(data: &[u8]) -> Result<u32> {
        if data.len() < 4 {
            return Err(Error::InvalidAttribute("truncated u32 attribute".into()));
        }
        Ok(u32::from_ne_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Extract a u64 value (native endian).
    pub fn u64_ne(data: &[u8]) -> Result<u64> {
        if data.len() < 8 {
            return Err(Error::InvalidAttribute("truncated u64 attribute".into()));
        }
        Ok(u64::from_ne_bytes([
            data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
        ]))
    }

    /// Extract a u16 value (big endian / network order).
    pub fn u16_be(data: &[u8]) -> Result<u16> {
        if data.len() < 2 {
            return Err(Error::InvalidAttribute("truncated u16 attribute".into()));
        }
        Ok(u16::from_be_bytes([data[0], data[1]]))
    }

    /// Extract a u32 value (big endian / network order).
    pub fn u32_be(data: &[u8]) -> Result<u32> {
        if data.len() < 4 {
            return Err(Error::InvalidAttribute("truncated u32 attribute".into()));
        }
        Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Extract an i32 value (native endian).
    pub fn i32_ne(data: &[u8]) -> Result<i32> {
        if data.len() < 4 {
            return Err(Error::InvalidAttribute("truncated i32 attribute".into()));
        }
        Ok(i32::from_ne_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Extract a null-terminated string.
    pub fn string(data: &[u8]) -> Result<&str> {
        let len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        std::str::from_utf8(&data[..len])
            .map_err(|e| Error::InvalidAttribute(format!("invalid UTF-8: {}", e)))
    }

    /// Extract a fixed-size kernel struct by value.
    pub fn fixed<T: FromBytes + KnownLayout + Immutable + Copy>(data: &[u8]) -> Result<T> {
        T::read_from_prefix(data)
            .map(|(v, _)| v)
            .map_err(|_| Error::Truncated {
                expected: std::mem::size_of::<T>(),
                actual: data.len(),
            })
    }
}

/// Serialize a null-terminated string value.
pub fn cstring(value: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(value.len() + 1);
    data.extend_from_slice(value.as_bytes());
    data.push(0);
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_header_layout() {
        let bytes = encode(5, &[1, 2, 3], false).unwrap();
        assert_eq!(bytes.len(), 7);
        assert_eq!(u16::from_ne_bytes([bytes[0], bytes[1]]), 7);
        assert_eq!(u16::from_ne_bytes([bytes[2], bytes[3]]), 5);
        assert_eq!(&bytes[4..], &[1, 2, 3]);

        let nested = encode(2, &[], true).unwrap();
        assert_eq!(u16::from_ne_bytes([nested[2], nested[3]]), 2 | NLA_F_NESTED);
    }

    #[test]
    fn test_decode_sequence_skips_padding() {
        let mut buf = encode(1, &[0xaa], false).unwrap();
        // Garbage in padding must be ignored.
        buf.extend_from_slice(&[0xff, 0xff, 0xff]);
        buf.extend_from_slice(&encode(2, &7u32.to_ne_bytes(), false).unwrap());

        let attrs = decode(&buf).unwrap();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0], (1, &[0xaa][..]));
        assert_eq!(attrs[1].0, 2);
        assert_eq!(get::u32_ne(attrs[1].1).unwrap(), 7);
    }

    #[test]
    fn test_last_attribute_without_padding() {
        let buf = encode(3, &[1, 2, 3, 4, 5], false).unwrap();
        let attrs = decode(&buf).unwrap();
        assert_eq!(attrs, vec![(3, &[1, 2, 3, 4, 5][..])]);
    }

    #[test]
    fn test_header_truncated() {
        let mut buf = encode(1, &1u32.to_ne_bytes(), false).unwrap();
        buf.extend_from_slice(&[8, 0]);
        let err = decode(&buf).unwrap_err();
        assert!(matches!(err, Error::AttrHeaderTruncated));

        assert!(matches!(
            decode(&[1, 2, 3]).unwrap_err(),
            Error::AttrHeaderTruncated
        ));
    }

    #[test]
    fn test_body_truncated() {
        let mut buf = encode(1, &[0u8; 8], false).unwrap();
        buf.truncate(6);
        match decode(&buf).unwrap_err() {
            Error::AttrBodyTruncated {
                declared,
                remaining,
            } => {
                assert_eq!(declared, 12);
                assert_eq!(remaining, 6);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_iterator_stops_after_error() {
        let mut iter = AttrIter::new(&[4, 0]);
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_nested_tree_roundtrip_depth_three() {
        let mut root = RtAttr::nested(2);
        root.add_value(1, cstring("htb"));
        let opts = root.add_child(RtAttr::nested(3));
        opts.add_value(1, 10u32.to_ne_bytes());
        let inner = opts.add_child(RtAttr::nested(4));
        inner.add_value(7, vec![1, 2, 3]);
        inner.add_value(8, Vec::new());

        let bytes = root.serialize().unwrap();
        assert_eq!(bytes.len(), root.len());

        let tree = RtAttr::parse_tree(&bytes).unwrap();
        assert_eq!(tree, vec![root]);
    }

    #[test]
    fn test_lazy_nested_decode() {
        let mut nest = RtAttr::nested(9);
        nest.add_value(1, 42u16.to_ne_bytes());
        nest.add_value(2, 43u16.to_ne_bytes());
        let bytes = nest.serialize().unwrap();

        let outer = decode(&bytes).unwrap();
        assert_eq!(outer.len(), 1);
        assert_eq!(outer[0].0, 9);
        let inner = decode(outer[0].1).unwrap();
        assert_eq!(get::u16_ne(inner[0].1).unwrap(), 42);
        assert_eq!(get::u16_ne(inner[1].1).unwrap(), 43);
    }

    #[test]
    fn test_leaf_with_value_and_children_pads_value() {
        let mut attr = RtAttr::new(1, vec![0xde, 0xad]);
        attr.add_value(2, vec![0xbe]);
        let bytes = attr.serialize().unwrap();
        // header + padded value + padded child
        assert_eq!(bytes.len(), 4 + 4 + 8);
        assert_eq!(&bytes[4..8], &[0xde, 0xad, 0, 0]);
    }

    #[test]
    fn test_odd_length_segment_keeps_stride() {
        let odd = RtAttr::new(200, vec![1, 2, 3]);
        let next = RtAttr::new(201, 9u32.to_ne_bytes());

        let mut buf = Vec::new();
        let written = odd.write_to(&mut buf).unwrap();
        assert_eq!(written, odd.netlink_len());
        assert_eq!(buf.len(), 8);
        next.write_to(&mut buf).unwrap();

        let attrs = decode(&buf).unwrap();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0], (200, &[1u8, 2, 3][..]));
        assert_eq!(attrs[1].0, 201);
        assert_eq!(get::u32_ne(attrs[1].1).unwrap(), 9);
    }

    #[test]
    fn test_oversize_attribute_rejected() {
        let big = vec![0u8; u16::MAX as usize];
        assert!(matches!(
            encode(1, &big, false).unwrap_err(),
            Error::AttrTooLarge { len } if len == u16::MAX as usize + NLA_HDRLEN
        ));

        let mut nest = RtAttr::nested(1);
        nest.add_value(2, vec![0u8; 40_000]);
        nest.add_value(3, vec![0u8; 40_000]);
        assert!(matches!(
            nest.serialize().unwrap_err(),
            Error::AttrTooLarge { .. }
        ));
        assert!(nest.write_to(&mut Vec::new()).is_err());

        // largest value that still fits
        let fits = encode(1, &big[..u16::MAX as usize - NLA_HDRLEN], false).unwrap();
        assert_eq!(u16::from_ne_bytes([fits[0], fits[1]]), u16::MAX);
    }

    #[test]
    fn test_get_string() {
        assert_eq!(get::string(b"eth0\0\0\0\0").unwrap(), "eth0");
        assert_eq!(get::string(b"lo").unwrap(), "lo");
    }
}
