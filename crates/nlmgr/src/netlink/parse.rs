//! Parser combinators and traits for strongly-typed netlink message parsing.
//!
//! This module provides:
//! - `FromNetlink` trait for parsing netlink messages
//! - `ToNetlink` trait for serializing request segments
//! - Core parser combinators using winnow

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use winnow::error::{ContextError, ErrMode};
use winnow::prelude::*;
use winnow::token::take;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use super::error::{Error, Result};

/// Result type for winnow parsers.
pub type PResult<T> = core::result::Result<T, ErrMode<ContextError>>;

/// Trait for types that can be parsed from netlink wire format.
pub trait FromNetlink: Sized {
    /// Parse from a mutable byte slice reference.
    /// The slice is advanced past the consumed bytes.
    fn parse(input: &mut &[u8]) -> PResult<Self>;

    /// Parse from a complete byte slice.
    fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::parse
            .parse(data)
            .map_err(|e| Error::Parse(format!("{}", e)))
    }
}

/// Trait for types that can be serialized to netlink wire format.
///
/// Anything implementing this can be appended to a request as a segment.
pub trait ToNetlink {
    /// Calculate the serialized size in bytes.
    fn netlink_len(&self) -> usize;

    /// Write to a byte buffer.
    /// Returns the number of bytes written.
    fn write_to(&self, buf: &mut Vec<u8>) -> Result<usize>;

    /// Serialize to a new byte vector.
    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.netlink_len());
        self.write_to(&mut buf)?;
        Ok(buf)
    }
}

/// Error used when a parser hits malformed input.
pub(crate) fn cut() -> ErrMode<ContextError> {
    ErrMode::Cut(ContextError::new())
}

/// Parse a fixed-size kernel struct and advance the input past it.
pub fn parse_fixed<T>(input: &mut &[u8]) -> PResult<T>
where
    T: FromBytes + KnownLayout + Immutable + Copy,
{
    let bytes: &[u8] = take(std::mem::size_of::<T>()).parse_next(input)?;
    T::read_from_bytes(bytes).map_err(|_| cut())
}

/// Split a message payload into its fixed kernel header and the attribute
/// bytes that follow it.
pub fn split_header<T: FromNetlink>(data: &[u8]) -> Result<(T, &[u8])> {
    let mut input = data;
    let header = T::parse(&mut input).map_err(|_| Error::Truncated {
        expected: std::mem::size_of::<T>(),
        actual: data.len(),
    })?;
    Ok((header, input))
}

/// Take the rest of the input.
pub fn rest<'a>(input: &mut &'a [u8]) -> &'a [u8] {
    let all = *input;
    *input = &[];
    all
}

/// Parse a u32 in native endian.
pub fn parse_u32_ne(input: &mut &[u8]) -> PResult<u32> {
    let bytes: &[u8] = take(4usize).parse_next(input)?;
    Ok(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Parse an i32 in native endian.
pub fn parse_i32_ne(input: &mut &[u8]) -> PResult<i32> {
    let bytes: &[u8] = take(4usize).parse_next(input)?;
    Ok(i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Parse a string from a fixed-size buffer (null-terminated).
pub fn parse_string_from_bytes(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Parse an IP address based on address family.
pub fn parse_ip_addr(data: &[u8], family: u8) -> Result<IpAddr> {
    match family as i32 {
        libc::AF_INET => {
            if data.len() < 4 {
                return Err(Error::Truncated {
                    expected: 4,
                    actual: data.len(),
                });
            }
            Ok(IpAddr::V4(Ipv4Addr::new(
                data[0], data[1], data[2], data[3],
            )))
        }
        libc::AF_INET6 => {
            let arr: [u8; 16] = data
                .get(..16)
                .and_then(|b| b.try_into().ok())
                .ok_or(Error::Truncated {
                    expected: 16,
                    actual: data.len(),
                })?;
            Ok(IpAddr::V6(Ipv6Addr::from(arr)))
        }
        _ => Err(Error::InvalidMessage(format!(
            "unsupported address family: {}",
            family
        ))),
    }
}

/// Parse an IP address whose family is implied by its length.
pub fn parse_ip_by_len(data: &[u8]) -> Result<IpAddr> {
    match data.len() {
        4 => parse_ip_addr(data, libc::AF_INET as u8),
        16 => parse_ip_addr(data, libc::AF_INET6 as u8),
        n => Err(Error::InvalidAttribute(format!(
            "address of {} bytes is neither IPv4 nor IPv6",
            n
        ))),
    }
}

/// Raw bytes of an IP address.
pub fn ip_bytes(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Address family of an IP address.
pub fn ip_family(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => libc::AF_INET as u8,
        IpAddr::V6(_) => libc::AF_INET6 as u8,
    }
}
