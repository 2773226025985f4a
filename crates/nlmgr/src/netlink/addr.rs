//! Interface address management.
//!
//! # Example
//!
//! ```ignore
//! use nlmgr::netlink::addr::Addr;
//!
//! let addr = Addr::new("10.0.0.1".parse()?, 24).label("dummy0:web");
//! conn.addr_add(3, &addr).await?;
//! for a in conn.addr_list(3, libc::AF_INET as u8).await? {
//!     println!("{}/{}", a.ip, a.prefix_len);
//! }
//! ```

use std::net::{IpAddr, Ipv4Addr};

use zerocopy::IntoBytes;

use super::attr::{AttrIter, get};
use super::builder::Request;
use super::connection::{Connection, ack_request, create_request, dump_request, replace_request};
use super::error::{Error, Result};
use super::message::NlMsgType;
use super::parse::{ip_bytes, ip_family, parse_ip_addr, parse_string_from_bytes, split_header};
use super::types::addr::{IfAddrMsg, IfaCacheInfo, ifa};

/// Lifetime value meaning "forever".
pub const INFINITY_LIFE_TIME: u32 = u32::MAX;

/// An IP address assigned to an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addr {
    pub ip: IpAddr,
    pub prefix_len: u8,
    pub label: Option<String>,
    /// IFA_F_* flags.
    pub flags: u32,
    pub scope: u8,
    /// Remote end of a point-to-point link.
    pub peer: Option<IpAddr>,
    pub broadcast: Option<IpAddr>,
    pub link_index: u32,
    /// Seconds; 0 leaves the kernel default.
    pub preferred_lft: u32,
    pub valid_lft: u32,
}

impl Addr {
    pub fn new(ip: IpAddr, prefix_len: u8) -> Self {
        Self {
            ip,
            prefix_len,
            label: None,
            flags: 0,
            scope: 0,
            peer: None,
            broadcast: None,
            link_index: 0,
            preferred_lft: 0,
            valid_lft: 0,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn scope(mut self, scope: u8) -> Self {
        self.scope = scope;
        self
    }

    pub fn peer(mut self, peer: IpAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn broadcast(mut self, broadcast: IpAddr) -> Self {
        self.broadcast = Some(broadcast);
        self
    }

    /// Set preferred and valid lifetimes in seconds.
    pub fn lifetimes(mut self, preferred: u32, valid: u32) -> Self {
        self.preferred_lft = preferred;
        self.valid_lft = valid;
        self
    }

    fn write_request(&self, link_index: u32, req: &mut Request) -> Result<()> {
        let family = ip_family(&self.ip);
        let max = if self.ip.is_ipv4() { 32 } else { 128 };
        if self.prefix_len > max {
            return Err(Error::InvalidRequest(format!(
                "prefix length {} exceeds {max}",
                self.prefix_len
            )));
        }
        if self.peer.is_some_and(|p| ip_family(&p) != family) {
            return Err(Error::InvalidRequest("peer address family mismatch".into()));
        }
        if let Some(label) = &self.label
            && label.len() >= libc::IFNAMSIZ
        {
            return Err(Error::InvalidRequest(format!("label {label:?} too long")));
        }

        let mut header = IfAddrMsg::new().with_family(family).with_index(link_index);
        header.ifa_prefixlen = self.prefix_len;
        header.ifa_scope = self.scope;
        header.ifa_flags = (self.flags & 0xff) as u8;
        req.append(&header);

        let local = ip_bytes(&self.ip);
        req.append_attr(ifa::LOCAL, &local);
        match &self.peer {
            Some(peer) => req.append_attr(ifa::ADDRESS, &ip_bytes(peer)),
            None => req.append_attr(ifa::ADDRESS, &local),
        }
        if self.flags > 0xff {
            req.append_attr_u32(ifa::FLAGS, self.flags);
        }
        if let IpAddr::V4(v4) = self.ip {
            let broadcast = match self.broadcast {
                Some(b) => Some(b),
                None if self.prefix_len < 31 => Some(IpAddr::V4(broadcast_of(v4, self.prefix_len))),
                None => None,
            };
            if let Some(b) = broadcast {
                req.append_attr(ifa::BROADCAST, &ip_bytes(&b));
            }
        }
        if let Some(label) = &self.label {
            req.append_attr_str(ifa::LABEL, label);
        }
        if self.preferred_lft > 0 || self.valid_lft > 0 {
            let cache = IfaCacheInfo {
                ifa_prefered: self.preferred_lft,
                ifa_valid: self.valid_lft,
                ..Default::default()
            };
            req.append_attr(ifa::CACHEINFO, cache.as_bytes());
        }
        Ok(())
    }

    /// Decode an `RTM_NEWADDR`/`RTM_DELADDR` payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (header, attrs) = split_header::<IfAddrMsg>(payload)?;
        let family = header.ifa_family;

        let mut address = None;
        let mut local = None;
        let mut addr = Addr {
            flags: header.ifa_flags as u32,
            scope: header.ifa_scope,
            link_index: header.ifa_index,
            ..Addr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), header.ifa_prefixlen)
        };
        for attr in AttrIter::new(attrs) {
            let (kind, value) = attr?;
            match kind {
                ifa::ADDRESS => address = Some(parse_ip_addr(value, family)?),
                ifa::LOCAL => local = Some(parse_ip_addr(value, family)?),
                ifa::LABEL => addr.label = Some(parse_string_from_bytes(value)),
                ifa::BROADCAST => addr.broadcast = Some(parse_ip_addr(value, family)?),
                ifa::FLAGS => addr.flags = get::u32_ne(value)?,
                ifa::CACHEINFO => {
                    let cache = get::fixed::<IfaCacheInfo>(value)?;
                    addr.preferred_lft = cache.ifa_prefered;
                    addr.valid_lft = cache.ifa_valid;
                }
                _ => {}
            }
        }

        // IFA_LOCAL is the interface's own address when both are present;
        // a differing IFA_ADDRESS is then the point-to-point peer.
        match (local, address) {
            (Some(local), Some(address)) => {
                addr.ip = local;
                if local != address {
                    addr.peer = Some(address);
                }
            }
            (Some(ip), None) | (None, Some(ip)) => addr.ip = ip,
            (None, None) => {
                return Err(Error::InvalidMessage("address message without address".into()));
            }
        }
        Ok(addr)
    }
}

/// Directed broadcast address of `ip/prefix_len`.
pub fn broadcast_of(ip: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let host_mask = u32::MAX.checked_shr(prefix_len as u32).unwrap_or(0);
    Ipv4Addr::from(u32::from(ip) | host_mask)
}

impl Connection {
    /// Assign an address; fails if it is already present.
    pub async fn addr_add(&self, link_index: u32, addr: &Addr) -> Result<()> {
        let mut req = create_request(NlMsgType::RTM_NEWADDR);
        addr.write_request(link_index, &mut req)?;
        self.request_ack(req)
            .await
            .map_err(|e| e.with_context(format!("adding {}/{}", addr.ip, addr.prefix_len)))
    }

    /// Assign an address or update the existing one.
    pub async fn addr_replace(&self, link_index: u32, addr: &Addr) -> Result<()> {
        let mut req = replace_request(NlMsgType::RTM_NEWADDR);
        addr.write_request(link_index, &mut req)?;
        self.request_ack(req)
            .await
            .map_err(|e| e.with_context(format!("replacing {}/{}", addr.ip, addr.prefix_len)))
    }

    pub async fn addr_del(&self, link_index: u32, addr: &Addr) -> Result<()> {
        let mut req = ack_request(NlMsgType::RTM_DELADDR);
        addr.write_request(link_index, &mut req)?;
        self.request_ack(req)
            .await
            .map_err(|e| e.with_context(format!("deleting {}/{}", addr.ip, addr.prefix_len)))
    }

    /// List addresses. `link_index` 0 and `family` 0 match everything.
    pub async fn addr_list(&self, link_index: u32, family: u8) -> Result<Vec<Addr>> {
        let mut req = dump_request(NlMsgType::RTM_GETADDR);
        req.append(&IfAddrMsg::new().with_family(family));

        let mut out = Vec::new();
        for payload in self.dump(req, NlMsgType::RTM_NEWADDR).await? {
            let addr = Addr::decode(&payload)?;
            if link_index == 0 || addr.link_index == link_index {
                out.push(addr);
            }
        }
        Ok(out)
    }
}
