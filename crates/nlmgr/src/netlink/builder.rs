//! Message builder and request objects.
//!
//! [`MessageBuilder`] lays out a netlink message in a single buffer.
//! [`Request`] wraps a builder with a process-wide sequence number and
//! knows how to run itself against a [`Connection`].

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

use zerocopy::{Immutable, IntoBytes};

use super::attr::{NLA_F_NESTED, NLA_HDRLEN, NlAttr, attr_len, nla_align};
use super::connection::Connection;
use super::error::{Error, Result};
use super::message::{NLM_F_DUMP, NLM_F_REQUEST, NLMSG_HDRLEN, NlMsgHdr, nlmsg_align};
use super::parse::ToNetlink;
use super::socket::Protocol;

/// Token returned when starting a nested attribute.
/// Used to finalize the nested attribute length.
#[derive(Debug, Clone, Copy)]
pub struct NestToken {
    /// Offset of the nested attribute header in the buffer.
    offset: usize,
}

/// Builder for constructing netlink messages.
///
/// An attribute or nest too long for its 16-bit length is dropped and
/// reported by [`finish`](Self::finish).
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    buf: Vec<u8>,
    /// Length of the first attribute that did not fit.
    oversize: Option<usize>,
}

impl MessageBuilder {
    /// Create a new message builder with the given type and flags.
    pub fn new(msg_type: u16, flags: u16) -> Self {
        Self::with_header(NlMsgHdr::new(msg_type, flags))
    }

    /// Create a builder from an existing header.
    pub fn with_header(header: NlMsgHdr) -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(header.as_bytes());
        Self {
            buf,
            oversize: None,
        }
    }

    /// Get the current message length.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if the message is empty (header only).
    pub fn is_empty(&self) -> bool {
        self.buf.len() == NLMSG_HDRLEN
    }

    /// Append raw bytes to the message (with alignment padding).
    pub fn append_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        let aligned = nlmsg_align(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Append a fixed-size kernel struct to the message.
    pub fn append<T: IntoBytes + Immutable>(&mut self, data: &T) {
        self.append_bytes(data.as_bytes());
    }

    /// Append an attribute with the given type and data.
    pub fn append_attr(&mut self, attr_type: u16, data: &[u8]) {
        let attr = match NlAttr::new(attr_type, data.len()) {
            Ok(attr) => attr,
            Err(_) => {
                self.oversize = self.oversize.or(Some(NLA_HDRLEN + data.len()));
                return;
            }
        };
        self.buf.extend_from_slice(attr.as_bytes());
        self.buf.extend_from_slice(data);
        let aligned = nla_align(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Append a u8 attribute.
    pub fn append_attr_u8(&mut self, attr_type: u16, value: u8) {
        self.append_attr(attr_type, &[value]);
    }

    /// Append an empty (flag) attribute with no payload.
    pub fn append_attr_empty(&mut self, attr_type: u16) {
        self.append_attr(attr_type, &[]);
    }

    /// Append a u16 attribute (native endian).
    pub fn append_attr_u16(&mut self, attr_type: u16, value: u16) {
        self.append_attr(attr_type, &value.to_ne_bytes());
    }

    /// Append a u32 attribute (native endian).
    pub fn append_attr_u32(&mut self, attr_type: u16, value: u32) {
        self.append_attr(attr_type, &value.to_ne_bytes());
    }

    /// Append a u64 attribute (native endian).
    pub fn append_attr_u64(&mut self, attr_type: u16, value: u64) {
        self.append_attr(attr_type, &value.to_ne_bytes());
    }

    /// Append a u16 attribute (big endian / network order).
    pub fn append_attr_u16_be(&mut self, attr_type: u16, value: u16) {
        self.append_attr(attr_type, &value.to_be_bytes());
    }

    /// Append a u32 attribute (big endian / network order).
    pub fn append_attr_u32_be(&mut self, attr_type: u16, value: u32) {
        self.append_attr(attr_type, &value.to_be_bytes());
    }

    /// Append a null-terminated string attribute.
    pub fn append_attr_str(&mut self, attr_type: u16, value: &str) {
        let mut data = value.as_bytes().to_vec();
        data.push(0);
        self.append_attr(attr_type, &data);
    }

    /// Start a nested attribute. Returns a token to finalize it.
    pub fn nest_start(&mut self, attr_type: u16) -> NestToken {
        let offset = self.buf.len();
        let attr = NlAttr {
            nla_len: NLA_HDRLEN as u16,
            nla_type: attr_type | NLA_F_NESTED,
        };
        self.buf.extend_from_slice(attr.as_bytes());
        NestToken { offset }
    }

    /// End a nested attribute started with `nest_start`.
    pub fn nest_end(&mut self, token: NestToken) {
        let len = self.buf.len() - token.offset;
        let len = match attr_len(len) {
            Ok(len) => len,
            Err(_) => {
                self.oversize = self.oversize.or(Some(len));
                return;
            }
        };
        self.buf[token.offset..token.offset + 2].copy_from_slice(&len.to_ne_bytes());
        let aligned = nla_align(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Set the sequence number.
    pub fn set_seq(&mut self, seq: u32) {
        self.buf[8..12].copy_from_slice(&seq.to_ne_bytes());
    }

    /// Set the port ID.
    pub fn set_pid(&mut self, pid: u32) {
        self.buf[12..16].copy_from_slice(&pid.to_ne_bytes());
    }

    /// Finalize and return the message bytes.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        if let Some(len) = self.oversize {
            return Err(Error::AttrTooLarge { len });
        }
        let len = u32::try_from(self.buf.len()).map_err(|_| Error::Truncated {
            expected: u32::MAX as usize,
            actual: self.buf.len(),
        })?;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        Ok(self.buf)
    }

    /// Get the current buffer for inspection.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

static NEXT_SEQ: AtomicU32 = AtomicU32::new(1);

/// Draw the next process-wide sequence number.
pub fn next_seq() -> u32 {
    NEXT_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// A netlink request under construction.
///
/// Segments (fixed headers, attributes) are appended in order. The request
/// is consumed by [`serialize`](Self::serialize) or
/// [`execute`](Self::execute), so it cannot change after it is sent.
#[derive(Debug, Clone)]
pub struct Request {
    builder: MessageBuilder,
    msg_type: u16,
    flags: u16,
    seq: u32,
}

impl Request {
    /// Create a request, drawing a fresh sequence number.
    ///
    /// `NLM_F_REQUEST` is always set.
    pub fn new(msg_type: u16, flags: u16) -> Self {
        let flags = flags | NLM_F_REQUEST;
        let seq = next_seq();
        let mut builder = MessageBuilder::new(msg_type, flags);
        builder.set_seq(seq);
        Self {
            builder,
            msg_type,
            flags,
            seq,
        }
    }

    /// Sequence number carried by this request.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Message type.
    pub fn msg_type(&self) -> u16 {
        self.msg_type
    }

    /// Header flags, `NLM_F_REQUEST` included.
    pub fn flags(&self) -> u16 {
        self.flags
    }

    /// True when the request asks for a multi-part dump.
    pub fn is_dump(&self) -> bool {
        self.flags & NLM_F_DUMP == NLM_F_DUMP
    }

    /// Append a serializable segment.
    pub fn add_data<T: ToNetlink + ?Sized>(&mut self, segment: &T) -> Result<()> {
        let mut buf = Vec::with_capacity(segment.netlink_len());
        segment.write_to(&mut buf)?;
        self.builder.append_bytes(&buf);
        Ok(())
    }

    /// Append pre-encoded bytes.
    pub fn add_raw_data(&mut self, data: &[u8]) {
        self.builder.append_bytes(data);
    }

    /// Stamp the socket's port id and produce the wire bytes.
    ///
    /// The header always carries [`seq`](Self::seq), whatever was written
    /// through the builder.
    pub fn serialize(mut self, pid: u32) -> Result<Vec<u8>> {
        self.builder.set_seq(self.seq);
        self.builder.set_pid(pid);
        self.builder.finish()
    }

    /// Run the request on a fresh socket of `protocol`.
    ///
    /// Returns every payload of type `expected` (0 accepts any type).
    pub async fn execute(self, protocol: Protocol, expected: u16) -> Result<Vec<Vec<u8>>> {
        let conn = Connection::new(protocol)?;
        self.execute_on(&conn, expected).await
    }

    /// Run the request over an existing connection.
    pub async fn execute_on(self, conn: &Connection, expected: u16) -> Result<Vec<Vec<u8>>> {
        conn.execute(self, expected).await
    }
}

impl Deref for Request {
    type Target = MessageBuilder;

    fn deref(&self) -> &MessageBuilder {
        &self.builder
    }
}

impl DerefMut for Request {
    fn deref_mut(&mut self) -> &mut MessageBuilder {
        &mut self.builder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::attr::{self, NLA_HDRLEN, RtAttr};
    use crate::netlink::message::{NLM_F_ACK, NlMsgType};

    #[test]
    fn test_simple_message() {
        let msg = MessageBuilder::new(16, NLM_F_REQUEST).finish().unwrap();
        assert_eq!(msg.len(), NLMSG_HDRLEN);

        let header = NlMsgHdr::from_bytes(&msg).unwrap();
        assert_eq!(header.nlmsg_len as usize, NLMSG_HDRLEN);
        assert_eq!(header.nlmsg_type, 16);
        assert_eq!(header.nlmsg_flags, NLM_F_REQUEST);
    }

    #[test]
    fn test_attribute() {
        let mut builder = MessageBuilder::new(16, NLM_F_REQUEST);
        builder.append_attr_u32(1, 0x12345678);
        let msg = builder.finish().unwrap();

        assert_eq!(msg.len(), NLMSG_HDRLEN + NLA_HDRLEN + 4);
        let attrs = attr::decode(&msg[NLMSG_HDRLEN..]).unwrap();
        assert_eq!(attrs, vec![(1, &0x12345678u32.to_ne_bytes()[..])]);
    }

    #[test]
    fn test_nested_attribute() {
        let mut builder = MessageBuilder::new(16, NLM_F_REQUEST);
        let nest = builder.nest_start(1);
        builder.append_attr_u32(2, 100);
        builder.nest_end(nest);
        let msg = builder.finish().unwrap();

        let tree = RtAttr::parse_tree(&msg[NLMSG_HDRLEN..]).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].kind(), 1);
        assert_eq!(tree[0].children, vec![RtAttr::new(2, 100u32.to_ne_bytes())]);
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let a = Request::new(NlMsgType::RTM_GETLINK, NLM_F_DUMP);
        let b = Request::new(NlMsgType::RTM_GETLINK, NLM_F_DUMP);
        assert!(b.seq() > a.seq());
        assert!(a.is_dump());
        assert_eq!(a.flags() & NLM_F_REQUEST, NLM_F_REQUEST);
    }

    #[test]
    fn test_sequence_counter_is_thread_safe() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| (0..100).map(|_| next_seq()).collect::<Vec<_>>()))
            .collect();
        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 800);
    }

    #[test]
    fn test_serialize_backpatches_length_and_pid() {
        let mut req = Request::new(NlMsgType::RTM_NEWROUTE, NLM_F_ACK);
        req.add_data(&RtAttr::new(1, vec![10, 0, 0, 0])).unwrap();
        req.add_raw_data(&[1, 2, 3]);
        let seq = req.seq();
        let bytes = req.serialize(4242).unwrap();

        let hdr = NlMsgHdr::from_bytes(&bytes).unwrap();
        assert_eq!(hdr.nlmsg_len as usize, bytes.len());
        assert_eq!(hdr.nlmsg_seq, seq);
        assert_eq!(hdr.nlmsg_pid, 4242);
        assert_eq!(hdr.nlmsg_flags, NLM_F_REQUEST | NLM_F_ACK);
        // segments in insertion order, each padded
        let attrs = attr::decode(&bytes[16..24]).unwrap();
        assert_eq!(attrs, vec![(1, &[10u8, 0, 0, 0][..])]);
        assert_eq!(&bytes[24..], &[1, 2, 3, 0]);
    }

    #[test]
    fn test_serialize_keeps_request_seq() {
        let mut req = Request::new(NlMsgType::RTM_GETROUTE, 0);
        let seq = req.seq();
        req.set_seq(seq.wrapping_add(1000));
        let bytes = req.serialize(0).unwrap();
        assert_eq!(NlMsgHdr::from_bytes(&bytes).unwrap().nlmsg_seq, seq);
    }

    #[test]
    fn test_oversize_nest_fails_finish() {
        let mut builder = MessageBuilder::new(16, NLM_F_REQUEST);
        let nest = builder.nest_start(1);
        builder.append_attr(2, &[0u8; 40_000]);
        builder.append_attr(3, &[0u8; 40_000]);
        builder.nest_end(nest);
        assert!(matches!(
            builder.finish().unwrap_err(),
            Error::AttrTooLarge { len } if len > u16::MAX as usize
        ));

        let mut req = Request::new(16, 0);
        req.append_attr(1, &vec![0u8; u16::MAX as usize]);
        assert!(matches!(
            req.serialize(0).unwrap_err(),
            Error::AttrTooLarge { .. }
        ));
    }
}
