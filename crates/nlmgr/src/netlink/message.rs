//! Netlink message header and parsing.

use super::attr::{AttrIter, get};
use super::error::{Error, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Netlink message header alignment.
pub const NLMSG_ALIGNTO: usize = 4;

/// Align a length to NLMSG_ALIGNTO boundary.
#[inline]
pub const fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

/// Size of the netlink message header.
pub const NLMSG_HDRLEN: usize = nlmsg_align(std::mem::size_of::<NlMsgHdr>());

/// Netlink message header (mirrors struct nlmsghdr).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlMsgHdr {
    /// Length of message including header.
    pub nlmsg_len: u32,
    /// Message type.
    pub nlmsg_type: u16,
    /// Additional flags.
    pub nlmsg_flags: u16,
    /// Sequence number.
    pub nlmsg_seq: u32,
    /// Sending process port ID.
    pub nlmsg_pid: u32,
}

impl NlMsgHdr {
    /// Create a new message header.
    pub fn new(msg_type: u16, flags: u16) -> Self {
        Self {
            nlmsg_len: NLMSG_HDRLEN as u32,
            nlmsg_type: msg_type,
            nlmsg_flags: flags,
            nlmsg_seq: 0,
            nlmsg_pid: 0,
        }
    }

    /// Get the payload length (total length minus header).
    pub fn payload_len(&self) -> usize {
        (self.nlmsg_len as usize).saturating_sub(NLMSG_HDRLEN)
    }

    /// Check if this is an error message.
    pub fn is_error(&self) -> bool {
        self.nlmsg_type == NlMsgType::ERROR
    }

    /// Check if this is a done message.
    pub fn is_done(&self) -> bool {
        self.nlmsg_type == NlMsgType::DONE
    }

    /// Check if this message has the multi flag.
    pub fn is_multi(&self) -> bool {
        self.nlmsg_flags & NLM_F_MULTI != 0
    }

    /// Convert header to bytes.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }

    /// Parse header from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(data)
            .map(|(r, _)| r)
            .map_err(|_| Error::Truncated {
                expected: std::mem::size_of::<Self>(),
                actual: data.len(),
            })
    }
}

/// Standard netlink message types.
pub struct NlMsgType;

impl NlMsgType {
    /// No operation, message must be discarded.
    pub const NOOP: u16 = 1;
    /// Error message or ACK.
    pub const ERROR: u16 = 2;
    /// End of multipart message.
    pub const DONE: u16 = 3;
    /// Data lost, request resend.
    pub const OVERRUN: u16 = 4;

    // Link messages
    pub const RTM_NEWLINK: u16 = 16;
    pub const RTM_DELLINK: u16 = 17;
    pub const RTM_GETLINK: u16 = 18;
    pub const RTM_SETLINK: u16 = 19;

    // Address messages
    pub const RTM_NEWADDR: u16 = 20;
    pub const RTM_DELADDR: u16 = 21;
    pub const RTM_GETADDR: u16 = 22;

    // Route messages
    pub const RTM_NEWROUTE: u16 = 24;
    pub const RTM_DELROUTE: u16 = 25;
    pub const RTM_GETROUTE: u16 = 26;

    // Neighbor messages
    pub const RTM_NEWNEIGH: u16 = 28;
    pub const RTM_DELNEIGH: u16 = 29;
    pub const RTM_GETNEIGH: u16 = 30;

    // Qdisc messages
    pub const RTM_NEWQDISC: u16 = 36;
    pub const RTM_DELQDISC: u16 = 37;
    pub const RTM_GETQDISC: u16 = 38;

    // Traffic class messages
    pub const RTM_NEWTCLASS: u16 = 40;
    pub const RTM_DELTCLASS: u16 = 41;
    pub const RTM_GETTCLASS: u16 = 42;

    // Traffic filter messages
    pub const RTM_NEWTFILTER: u16 = 44;
    pub const RTM_DELTFILTER: u16 = 45;
    pub const RTM_GETTFILTER: u16 = 46;
}

/// Netlink message flags.
pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_MULTI: u16 = 0x02;
pub const NLM_F_ACK: u16 = 0x04;
pub const NLM_F_ECHO: u16 = 0x08;
pub const NLM_F_DUMP_INTR: u16 = 0x10;
pub const NLM_F_DUMP_FILTERED: u16 = 0x20;

// Modifiers to GET request
pub const NLM_F_ROOT: u16 = 0x100;
pub const NLM_F_MATCH: u16 = 0x200;
pub const NLM_F_ATOMIC: u16 = 0x400;
pub const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;

// Modifiers to NEW request
pub const NLM_F_REPLACE: u16 = 0x100;
pub const NLM_F_EXCL: u16 = 0x200;
pub const NLM_F_CREATE: u16 = 0x400;
pub const NLM_F_APPEND: u16 = 0x800;

// Flags on NLMSG_ERROR replies
pub const NLM_F_CAPPED: u16 = 0x100;
pub const NLM_F_ACK_TLVS: u16 = 0x200;

/// Extended ack attribute carrying a human-readable message.
pub const NLMSGERR_ATTR_MSG: u16 = 1;

/// An owned netlink message: header plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetlinkMessage {
    /// Message header as received.
    pub header: NlMsgHdr,
    /// Payload following the header.
    pub data: Vec<u8>,
}

impl NetlinkMessage {
    /// Build a message from a type, flags and payload.
    pub fn new(msg_type: u16, flags: u16, data: Vec<u8>) -> Self {
        let mut header = NlMsgHdr::new(msg_type, flags);
        header.nlmsg_len = (NLMSG_HDRLEN + data.len()) as u32;
        Self { header, data }
    }

    /// Set sequence number and port id.
    pub fn with_seq(mut self, seq: u32, pid: u32) -> Self {
        self.header.nlmsg_seq = seq;
        self.header.nlmsg_pid = pid;
        self
    }

    /// Message type.
    pub fn msg_type(&self) -> u16 {
        self.header.nlmsg_type
    }

    /// Serialize header and payload, padded to four bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(nlmsg_align(NLMSG_HDRLEN + self.data.len()));
        buf.extend_from_slice(self.header.as_bytes());
        buf.extend_from_slice(&self.data);
        buf.resize(nlmsg_align(buf.len()), 0);
        buf
    }
}

/// Parse one datagram into owned messages.
pub fn parse_messages(data: &[u8]) -> Result<Vec<NetlinkMessage>> {
    MessageIter::new(data)
        .map(|res| {
            res.map(|(header, payload)| NetlinkMessage {
                header: *header,
                data: payload.to_vec(),
            })
        })
        .collect()
}

/// Iterator over netlink messages in a buffer.
pub struct MessageIter<'a> {
    data: &'a [u8],
}

impl<'a> MessageIter<'a> {
    /// Create a new message iterator.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = Result<(&'a NlMsgHdr, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }

        let header = match NlMsgHdr::from_bytes(self.data) {
            Ok(h) => h,
            Err(e) => {
                self.data = &[];
                return Some(Err(e));
            }
        };

        let msg_len = header.nlmsg_len as usize;
        if msg_len < NLMSG_HDRLEN || msg_len > self.data.len() {
            self.data = &[];
            return Some(Err(Error::InvalidMessage(format!(
                "invalid message length: {}",
                msg_len
            ))));
        }

        let payload = &self.data[NLMSG_HDRLEN..msg_len];
        let aligned_len = nlmsg_align(msg_len).min(self.data.len());
        self.data = &self.data[aligned_len..];

        Some(Ok((header, payload)))
    }
}

/// Netlink error message payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlMsgError {
    /// Error code (negative errno or 0 for ACK).
    pub error: i32,
    /// Original message header that caused the error.
    pub msg: NlMsgHdr,
}

impl NlMsgError {
    /// Parse error message from payload.
    ///
    /// Only the leading error code is mandatory; some kernels truncate the
    /// echoed header.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if let Ok((err, _)) = Self::read_from_prefix(data) {
            return Ok(err);
        }
        let error = get::i32_ne(data).map_err(|_| Error::Truncated {
            expected: 4,
            actual: data.len(),
        })?;
        Ok(Self {
            error,
            msg: NlMsgHdr::default(),
        })
    }

    /// Check if this is an ACK (no error).
    pub fn is_ack(&self) -> bool {
        self.error == 0
    }

    /// Extract the extended-ack message, if the kernel attached one.
    pub fn ext_ack_message(&self, reply_flags: u16, payload: &[u8]) -> Option<String> {
        if reply_flags & NLM_F_ACK_TLVS == 0 {
            return None;
        }
        let offset = if reply_flags & NLM_F_CAPPED != 0 {
            std::mem::size_of::<Self>()
        } else {
            4 + nlmsg_align(self.msg.nlmsg_len as usize)
        };
        let tlvs = payload.get(offset..)?;
        AttrIter::new(tlvs)
            .filter_map(|a| a.ok())
            .find(|(kind, _)| *kind == NLMSGERR_ATTR_MSG)
            .and_then(|(_, value)| get::string(value).ok().map(str::to_owned))
    }

    /// Convert into the crate error, folding in any extended-ack text.
    pub fn into_error(self, reply_flags: u16, payload: &[u8]) -> Error {
        let err = Error::from_errno(self.error);
        match (self.ext_ack_message(reply_flags, payload), err) {
            (Some(extra), Error::Kernel { errno, message }) => Error::Kernel {
                errno,
                message: format!("{}: {}", message, extra),
            },
            (_, err) => err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::attr;

    #[test]
    fn test_header_size() {
        assert_eq!(NLMSG_HDRLEN, 16);
        assert_eq!(std::mem::size_of::<NlMsgError>(), 20);
    }

    #[test]
    fn test_parse_multiple_messages() {
        let a = NetlinkMessage::new(NlMsgType::RTM_NEWLINK, NLM_F_MULTI, vec![1, 2, 3]).with_seq(7, 0);
        let b = NetlinkMessage::new(NlMsgType::DONE, NLM_F_MULTI, 0i32.to_ne_bytes().to_vec())
            .with_seq(7, 0);
        let mut buf = a.to_bytes();
        buf.extend_from_slice(&b.to_bytes());

        let msgs = parse_messages(&buf).unwrap();
        assert_eq!(msgs, vec![a, b]);
        assert_eq!(msgs[0].data, vec![1, 2, 3]);
    }

    #[test]
    fn test_parse_rejects_bad_length() {
        let mut bytes = NetlinkMessage::new(NlMsgType::NOOP, 0, vec![0; 4]).to_bytes();
        bytes[0] = 200;
        assert!(parse_messages(&bytes).is_err());

        assert!(parse_messages(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_error_decoding() {
        let mut payload = (-17i32).to_ne_bytes().to_vec();
        payload.extend_from_slice(NlMsgHdr::new(24, NLM_F_REQUEST).as_bytes());
        let err = NlMsgError::from_bytes(&payload).unwrap();
        assert!(!err.is_ack());
        assert_eq!(err.into_error(0, &payload).errno(), Some(17));

        let ack = NlMsgError::from_bytes(&0i32.to_ne_bytes()).unwrap();
        assert!(ack.is_ack());
    }

    #[test]
    fn test_ext_ack_message() {
        let mut payload = (-22i32).to_ne_bytes().to_vec();
        payload.extend_from_slice(NlMsgHdr::new(24, NLM_F_REQUEST).as_bytes());
        let tlv = attr::encode(NLMSGERR_ATTR_MSG, &attr::cstring("bad gateway"), false).unwrap();
        payload.extend_from_slice(&tlv);

        let err = NlMsgError::from_bytes(&payload).unwrap();
        let msg = err.ext_ack_message(NLM_F_CAPPED | NLM_F_ACK_TLVS, &payload);
        assert_eq!(msg.as_deref(), Some("bad gateway"));

        let full = err.into_error(NLM_F_CAPPED | NLM_F_ACK_TLVS, &payload);
        assert!(full.to_string().contains("bad gateway"));
    }
}
