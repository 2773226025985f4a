//! Route management.
//!
//! [`Route`] is a plain value mapped to and from `RTM_*ROUTE` messages.
//! Unset fields fall back to the kernel defaults used by `ip route`:
//! table main, protocol boot, type unicast, scope universe.
//!
//! # Example
//!
//! ```ignore
//! use nlmgr::netlink::{Connection, Protocol};
//! use nlmgr::netlink::route::{IpNet, Route};
//!
//! let conn = Connection::new(Protocol::Route)?;
//! let route = Route::new()
//!     .dst("192.168.0.0/24".parse()?)
//!     .link_index(1)
//!     .src("127.1.1.1".parse()?);
//! conn.route_add(&route).await?;
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use zerocopy::FromBytes;

use super::attr::{AttrIter, RtAttr, get, nla_align};
use super::builder::Request;
use super::connection::{Connection, ack_request, append_request, create_request, replace_request};
use super::error::{Error, Result};
use super::message::{NLM_F_DUMP, NlMsgType};
use super::parse::{ToNetlink, ip_bytes, ip_family, parse_ip_addr, parse_ip_by_len, split_header};
use super::types::mpls::{decode_stack, encode_stack, lwtunnel_encap, mpls_tunnel};
use super::types::route::{
    AF_MPLS, RtMsg, RtNexthop, rt_scope, rt_table, rta, rtax, rtm_flags, rtn, rtprot,
};
use super::types::srv6::{decode_srh, encode_srh, seg6_iptunnel, seg6_mode};

/// An IP address with a prefix length.
///
/// Host bits are kept as given: `1.1.1.1/24` and `1.1.1.0/24` differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpNet {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpNet {
    /// Create a prefix, rejecting lengths beyond the address width.
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix_len > max {
            return Err(Error::InvalidRequest(format!(
                "prefix length {prefix_len} exceeds {max} for {addr}"
            )));
        }
        Ok(Self { addr, prefix_len })
    }

    /// A host prefix (/32 or /128).
    pub fn host(addr: IpAddr) -> Self {
        let prefix_len = if addr.is_ipv4() { 32 } else { 128 };
        Self { addr, prefix_len }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// AF_INET or AF_INET6.
    pub fn family(&self) -> u8 {
        ip_family(&self.addr)
    }
}

/// IPv4 default route destination.
pub const IPV4_DEFAULT: IpNet = IpNet {
    addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    prefix_len: 0,
};

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for IpNet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidRequest(format!("invalid prefix: {s}"));
        match s.split_once('/') {
            Some((addr, len)) => {
                let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
                let len: u8 = len.parse().map_err(|_| invalid())?;
                Self::new(addr, len)
            }
            None => Ok(Self::host(s.parse().map_err(|_| invalid())?)),
        }
    }
}

/// Lightweight tunnel encapsulation attached to a route or nexthop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encap {
    /// Push an MPLS label stack (outermost label first).
    Mpls { labels: Vec<u32> },
    /// Steer through an SRv6 segment list, in travel order.
    Seg6 { mode: u32, segments: Vec<Ipv6Addr> },
}

impl Encap {
    /// LWTUNNEL_ENCAP_* discriminant written to RTA_ENCAP_TYPE.
    pub fn kind(&self) -> u16 {
        match self {
            Self::Mpls { .. } => lwtunnel_encap::MPLS,
            Self::Seg6 { .. } => lwtunnel_encap::SEG6,
        }
    }

    /// SRv6 encap mode: new outer IPv6 header.
    pub fn seg6_encap(segments: Vec<Ipv6Addr>) -> Self {
        Self::Seg6 {
            mode: seg6_mode::ENCAP,
            segments,
        }
    }

    /// SRv6 inline mode: SRH inserted into the existing packet.
    pub fn seg6_inline(segments: Vec<Ipv6Addr>) -> Self {
        Self::Seg6 {
            mode: seg6_mode::INLINE,
            segments,
        }
    }

    fn to_attrs(&self) -> Result<[RtAttr; 2]> {
        let mut nest = RtAttr::nested(rta::ENCAP);
        match self {
            Self::Mpls { labels } => {
                if labels.is_empty() {
                    return Err(Error::InvalidRequest(
                        "MPLS encapsulation needs at least one label".into(),
                    ));
                }
                nest.add_value(mpls_tunnel::DST, encode_stack(labels));
            }
            Self::Seg6 { mode, segments } => {
                nest.add_value(seg6_iptunnel::SRH, encode_srh(*mode, segments)?);
            }
        }
        Ok([
            RtAttr::new(rta::ENCAP_TYPE, self.kind().to_ne_bytes()),
            nest,
        ])
    }

    /// Decode the body of RTA_ENCAP. Unknown kinds yield `None`.
    fn decode(kind: u16, data: &[u8]) -> Result<Option<Self>> {
        let wanted = match kind {
            lwtunnel_encap::MPLS => mpls_tunnel::DST,
            lwtunnel_encap::SEG6 => seg6_iptunnel::SRH,
            _ => return Ok(None),
        };
        for attr in AttrIter::new(data) {
            let (attr_type, value) = attr?;
            if attr_type != wanted {
                continue;
            }
            return Ok(Some(match kind {
                lwtunnel_encap::MPLS => Self::Mpls {
                    labels: decode_stack(value)?,
                },
                _ => {
                    let (mode, segments) = decode_srh(value)?;
                    Self::Seg6 { mode, segments }
                }
            }));
        }
        Ok(None)
    }
}

/// Per-route metrics (RTA_METRICS). Zero means unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteMetrics {
    pub mtu: u32,
    pub advmss: u32,
    pub hoplimit: u32,
}

impl RouteMetrics {
    fn has_any(&self) -> bool {
        self.mtu != 0 || self.advmss != 0 || self.hoplimit != 0
    }

    fn to_attr(self) -> RtAttr {
        let mut nest = RtAttr::new(rta::METRICS, Vec::new());
        for (kind, value) in [
            (rtax::MTU, self.mtu),
            (rtax::ADVMSS, self.advmss),
            (rtax::HOPLIMIT, self.hoplimit),
        ] {
            if value != 0 {
                nest.add_value(kind, value.to_ne_bytes());
            }
        }
        nest
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut metrics = Self::default();
        for attr in AttrIter::new(data) {
            let (kind, value) = attr?;
            match kind {
                rtax::MTU => metrics.mtu = get::u32_ne(value)?,
                rtax::ADVMSS => metrics.advmss = get::u32_ne(value)?,
                rtax::HOPLIMIT => metrics.hoplimit = get::u32_ne(value)?,
                _ => {}
            }
        }
        Ok(metrics)
    }
}

/// One path of a multipath route.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NexthopInfo {
    pub link_index: u32,
    /// Weight minus one, as stored by the kernel.
    pub hops: u8,
    pub gw: Option<IpAddr>,
    /// RTNH_F_* flags.
    pub flags: u8,
    /// MPLS swap stack for this path.
    pub new_dst: Option<Vec<u32>>,
    pub encap: Option<Encap>,
}

impl NexthopInfo {
    pub fn new(link_index: u32) -> Self {
        Self {
            link_index,
            ..Default::default()
        }
    }

    pub fn gateway(mut self, gw: IpAddr) -> Self {
        self.gw = Some(gw);
        self
    }

    pub fn hops(mut self, hops: u8) -> Self {
        self.hops = hops;
        self
    }

    pub fn encap(mut self, encap: Encap) -> Self {
        self.encap = Some(encap);
        self
    }

    pub fn new_dst(mut self, labels: Vec<u32>) -> Self {
        self.new_dst = Some(labels);
        self
    }

    fn encode(&self, family: &mut Option<u8>, buf: &mut Vec<u8>) -> Result<()> {
        let mut attrs = Vec::new();
        if let Some(gw) = &self.gw {
            check_family(family, ip_family(gw), "nexthop gateway")?;
            attrs.push(RtAttr::new(rta::GATEWAY, ip_bytes(gw)));
        }
        if let Some(labels) = &self.new_dst {
            check_family(family, AF_MPLS, "nexthop new destination")?;
            attrs.push(RtAttr::new(rta::NEWDST, encode_stack(labels)));
        }
        if let Some(encap) = &self.encap {
            attrs.extend(encap.to_attrs()?);
        }
        let mut children = Vec::new();
        for attr in &attrs {
            attr.write_to(&mut children)?;
            children.resize(nla_align(children.len()), 0);
        }

        let len = RtNexthop::SIZE + children.len();
        let header = RtNexthop {
            rtnh_len: u16::try_from(len)
                .map_err(|_| Error::InvalidRequest("nexthop attributes too large".into()))?,
            rtnh_flags: self.flags,
            rtnh_hops: self.hops,
            rtnh_ifindex: self.link_index as i32,
        };
        header.write_to(buf)?;
        buf.extend_from_slice(&children);
        buf.resize(nla_align(buf.len()), 0);
        Ok(())
    }

    fn decode_list(mut data: &[u8]) -> Result<Vec<Self>> {
        let mut hops = Vec::new();
        while !data.is_empty() {
            let (header, _) = RtNexthop::read_from_prefix(data).map_err(|_| Error::Truncated {
                expected: RtNexthop::SIZE,
                actual: data.len(),
            })?;
            let len = header.rtnh_len as usize;
            if len < RtNexthop::SIZE || len > data.len() {
                return Err(Error::InvalidAttribute(format!(
                    "nexthop length {} outside 8..={}",
                    len,
                    data.len()
                )));
            }

            let mut info = NexthopInfo {
                link_index: header.rtnh_ifindex as u32,
                hops: header.rtnh_hops,
                flags: header.rtnh_flags,
                ..Default::default()
            };
            let mut encap_type = None;
            let mut encap_data: &[u8] = &[];
            for attr in AttrIter::new(&data[RtNexthop::SIZE..len]) {
                let (kind, value) = attr?;
                match kind {
                    rta::GATEWAY => info.gw = Some(parse_ip_by_len(value)?),
                    rta::NEWDST => info.new_dst = Some(decode_stack(value)?),
                    rta::ENCAP_TYPE => encap_type = Some(get::u16_ne(value)?),
                    rta::ENCAP => encap_data = value,
                    _ => {}
                }
            }
            if let Some(kind) = encap_type {
                info.encap = Encap::decode(kind, encap_data)?;
            }
            hops.push(info);

            data = &data[nla_align(len).min(data.len())..];
        }
        Ok(hops)
    }
}

/// A routing table entry.
///
/// Numeric fields use zero for "unset"; see the module docs for the
/// defaults applied when the route is written.
#[derive(Debug, Clone, Default)]
pub struct Route {
    /// Address family. Inferred from the addresses when zero.
    pub family: u8,
    pub dst: Option<IpNet>,
    /// Preferred source address (RTA_PREFSRC).
    pub src: Option<IpAddr>,
    pub gw: Option<IpAddr>,
    /// Output interface.
    pub link_index: u32,
    /// Input interface (only reported by the kernel).
    pub ilink_index: u32,
    pub protocol: u8,
    pub priority: u32,
    pub table: u32,
    pub route_type: u8,
    pub tos: u8,
    /// RTNH_F_* flags.
    pub flags: u32,
    pub scope: u8,
    pub multipath: Vec<NexthopInfo>,
    pub encap: Option<Encap>,
    /// MPLS swap stack (RTA_NEWDST).
    pub new_dst: Option<Vec<u32>>,
    /// Incoming MPLS label, for AF_MPLS routes.
    pub mpls_dst: Option<u32>,
    pub metrics: RouteMetrics,
}

fn check_family(family: &mut Option<u8>, seen: u8, what: &str) -> Result<()> {
    match family {
        Some(f) if *f != seen => Err(Error::InvalidRequest(format!(
            "{what} family {seen} does not match route family {f}"
        ))),
        _ => {
            *family = Some(seen);
            Ok(())
        }
    }
}

impl Route {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dst(mut self, dst: IpNet) -> Self {
        self.dst = Some(dst);
        self
    }

    pub fn src(mut self, src: IpAddr) -> Self {
        self.src = Some(src);
        self
    }

    pub fn gateway(mut self, gw: IpAddr) -> Self {
        self.gw = Some(gw);
        self
    }

    pub fn link_index(mut self, index: u32) -> Self {
        self.link_index = index;
        self
    }

    pub fn table(mut self, table: u32) -> Self {
        self.table = table;
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn scope(mut self, scope: u8) -> Self {
        self.scope = scope;
        self
    }

    pub fn route_type(mut self, route_type: u8) -> Self {
        self.route_type = route_type;
        self
    }

    pub fn tos(mut self, tos: u8) -> Self {
        self.tos = tos;
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn multipath(mut self, nexthops: Vec<NexthopInfo>) -> Self {
        self.multipath = nexthops;
        self
    }

    pub fn encap(mut self, encap: Encap) -> Self {
        self.encap = Some(encap);
        self
    }

    /// Route an incoming MPLS label.
    pub fn mpls_dst(mut self, label: u32) -> Self {
        self.mpls_dst = Some(label);
        self
    }

    /// Swap the incoming label for this stack.
    pub fn new_dst(mut self, labels: Vec<u32>) -> Self {
        self.new_dst = Some(labels);
        self
    }

    pub fn mtu(mut self, mtu: u32) -> Self {
        self.metrics.mtu = mtu;
        self
    }

    /// Table id as the kernel would store it.
    pub fn effective_table(&self) -> u32 {
        if self.table == rt_table::UNSPEC {
            rt_table::MAIN
        } else {
            self.table
        }
    }

    fn effective_type(&self) -> u8 {
        if self.route_type == rtn::UNSPEC {
            rtn::UNICAST
        } else {
            self.route_type
        }
    }

    fn effective_protocol(&self) -> u8 {
        if self.protocol == rtprot::UNSPEC {
            rtprot::BOOT
        } else {
            self.protocol
        }
    }

    /// Semantic equality: every field must match, except that unset table,
    /// type and protocol equal their defaults (main, unicast, boot).
    pub fn equal(&self, other: &Route) -> bool {
        self.link_index == other.link_index
            && self.ilink_index == other.ilink_index
            && self.scope == other.scope
            && self.dst == other.dst
            && self.src == other.src
            && self.gw == other.gw
            && self.multipath == other.multipath
            && self.effective_protocol() == other.effective_protocol()
            && self.priority == other.priority
            && self.effective_table() == other.effective_table()
            && self.effective_type() == other.effective_type()
            && self.tos == other.tos
            && self.flags == other.flags
            && self.mpls_dst == other.mpls_dst
            && self.new_dst == other.new_dst
            && self.encap == other.encap
            && self.metrics == other.metrics
    }

    /// Reject routes the kernel could not place.
    pub fn validate(&self) -> Result<()> {
        if self.dst.is_none()
            && self.src.is_none()
            && self.gw.is_none()
            && self.mpls_dst.is_none()
            && self.multipath.is_empty()
        {
            return Err(Error::InvalidRequest(
                "route needs a destination, source, gateway or multipath".into(),
            ));
        }
        if self.family == AF_MPLS && self.mpls_dst.is_none() {
            return Err(Error::InvalidRequest("MPLS route without a label".into()));
        }
        Ok(())
    }

    /// Append the rtmsg header and attributes to `req`.
    ///
    /// Delete requests default the scope to RT_SCOPE_NOWHERE, which the
    /// kernel treats as a wildcard.
    pub fn write_request(&self, req: &mut Request, delete: bool) -> Result<()> {
        self.validate()?;

        let mut family = (self.family != 0).then_some(self.family);
        let mut header = RtMsg::new();
        let mut attrs = Vec::new();

        if let Some(dst) = &self.dst {
            check_family(&mut family, dst.family(), "destination")?;
            header.rtm_dst_len = dst.prefix_len();
            attrs.push(RtAttr::new(rta::DST, ip_bytes(&dst.addr())));
        }
        if let Some(label) = self.mpls_dst {
            check_family(&mut family, AF_MPLS, "MPLS destination")?;
            header.rtm_dst_len = 20;
            attrs.push(RtAttr::new(rta::DST, encode_stack(&[label])));
        }
        if let Some(labels) = &self.new_dst {
            check_family(&mut family, AF_MPLS, "new destination")?;
            attrs.push(RtAttr::new(rta::NEWDST, encode_stack(labels)));
        }
        if let Some(encap) = &self.encap {
            attrs.extend(encap.to_attrs()?);
        }
        if let Some(src) = &self.src {
            check_family(&mut family, ip_family(src), "source")?;
            attrs.push(RtAttr::new(rta::PREFSRC, ip_bytes(src)));
        }
        if let Some(gw) = &self.gw {
            check_family(&mut family, ip_family(gw), "gateway")?;
            attrs.push(RtAttr::new(rta::GATEWAY, ip_bytes(gw)));
        }
        if !self.multipath.is_empty() {
            let mut buf = Vec::new();
            for nh in &self.multipath {
                nh.encode(&mut family, &mut buf)?;
            }
            attrs.push(RtAttr::new(rta::MULTIPATH, buf));
        }

        header.rtm_family = family.unwrap_or(libc::AF_UNSPEC as u8);
        header.rtm_tos = self.tos;
        header.rtm_flags = self.flags;
        header.rtm_scope = match (delete, self.scope) {
            (true, rt_scope::UNIVERSE) => rt_scope::NOWHERE,
            (_, scope) => scope,
        };
        if !delete {
            header.rtm_protocol = self.effective_protocol();
            header.rtm_type = self.effective_type();
        } else {
            header.rtm_protocol = self.protocol;
            header.rtm_type = self.route_type;
        }

        let table = self.effective_table();
        if table > 255 {
            header.rtm_table = rt_table::UNSPEC as u8;
            attrs.push(RtAttr::new(rta::TABLE, table.to_ne_bytes()));
        } else {
            header.rtm_table = table as u8;
        }
        if self.priority > 0 {
            attrs.push(RtAttr::new(rta::PRIORITY, self.priority.to_ne_bytes()));
        }
        if self.metrics.has_any() {
            attrs.push(self.metrics.to_attr());
        }
        if self.link_index > 0 {
            attrs.push(RtAttr::new(rta::OIF, self.link_index.to_ne_bytes()));
        }

        req.add_data(&header)?;
        for attr in &attrs {
            req.add_data(attr)?;
        }
        Ok(())
    }

    /// Decode an `RTM_NEWROUTE`/`RTM_DELROUTE` payload.
    ///
    /// Unknown attributes are skipped.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (header, attrs) = split_header::<RtMsg>(payload)?;
        let family = header.rtm_family;
        let mut route = Route {
            family,
            protocol: header.rtm_protocol,
            table: header.rtm_table as u32,
            route_type: header.rtm_type,
            tos: header.rtm_tos,
            flags: header.rtm_flags,
            scope: header.rtm_scope,
            ..Default::default()
        };

        let mut encap_type = None;
        let mut encap_data: &[u8] = &[];
        for attr in AttrIter::new(attrs) {
            let (kind, value) = attr?;
            match kind {
                rta::DST if family == AF_MPLS => {
                    route.mpls_dst = decode_stack(value)?.first().copied();
                }
                rta::DST => {
                    route.dst = Some(IpNet::new(
                        parse_ip_addr(value, family)?,
                        header.rtm_dst_len,
                    )?);
                }
                rta::PREFSRC => route.src = Some(parse_ip_addr(value, family)?),
                rta::GATEWAY => route.gw = Some(parse_ip_by_len(value)?),
                rta::OIF => route.link_index = get::u32_ne(value)?,
                rta::IIF => route.ilink_index = get::u32_ne(value)?,
                rta::PRIORITY => route.priority = get::u32_ne(value)?,
                rta::TABLE => route.table = get::u32_ne(value)?,
                rta::MULTIPATH => route.multipath = NexthopInfo::decode_list(value)?,
                rta::NEWDST => route.new_dst = Some(decode_stack(value)?),
                rta::ENCAP_TYPE => encap_type = Some(get::u16_ne(value)?),
                rta::ENCAP => encap_data = value,
                rta::METRICS => route.metrics = RouteMetrics::decode(value)?,
                _ => {}
            }
        }
        if let Some(kind) = encap_type {
            route.encap = Encap::decode(kind, encap_data)?;
        }
        Ok(route)
    }
}

impl PartialEq for Route {
    fn eq(&self, other: &Self) -> bool {
        self.equal(other)
    }
}

impl Eq for Route {}

/// Client-side filter for [`Connection::route_list`].
///
/// Every `Some` field must match. Without a table filter only the main
/// table is returned; `table(0)` matches every table.
#[derive(Debug, Clone, Default)]
pub struct RouteFilter {
    pub table: Option<u32>,
    pub link_index: Option<u32>,
    pub ilink_index: Option<u32>,
    pub protocol: Option<u8>,
    pub scope: Option<u8>,
    pub route_type: Option<u8>,
    pub tos: Option<u8>,
    pub gw: Option<IpAddr>,
    pub src: Option<IpAddr>,
    /// `Some(None)` selects default routes (no RTA_DST).
    pub dst: Option<Option<IpNet>>,
    pub mpls_dst: Option<u32>,
}

impl RouteFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: u32) -> Self {
        self.table = Some(table);
        self
    }

    pub fn link_index(mut self, index: u32) -> Self {
        self.link_index = Some(index);
        self
    }

    pub fn protocol(mut self, protocol: u8) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn scope(mut self, scope: u8) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn route_type(mut self, route_type: u8) -> Self {
        self.route_type = Some(route_type);
        self
    }

    pub fn tos(mut self, tos: u8) -> Self {
        self.tos = Some(tos);
        self
    }

    pub fn gateway(mut self, gw: IpAddr) -> Self {
        self.gw = Some(gw);
        self
    }

    pub fn src(mut self, src: IpAddr) -> Self {
        self.src = Some(src);
        self
    }

    pub fn dst(mut self, dst: IpNet) -> Self {
        self.dst = Some(Some(dst));
        self
    }

    /// Match only default routes.
    pub fn default_route(mut self) -> Self {
        self.dst = Some(None);
        self
    }

    pub fn mpls_dst(mut self, label: u32) -> Self {
        self.mpls_dst = Some(label);
        self
    }

    /// Decide whether a dumped route is reported. `header_table` is the
    /// raw rtm_table byte, used for the implicit main-table restriction.
    pub fn matches(&self, header_table: u8, route: &Route) -> bool {
        if self.table.is_none() && header_table as u32 != rt_table::MAIN {
            return false;
        }
        if let Some(table) = self.table
            && table != rt_table::UNSPEC
            && route.table != table
        {
            return false;
        }
        if !field_matches(self.link_index, route.link_index)
            || !field_matches(self.ilink_index, route.ilink_index)
            || !field_matches(self.protocol, route.protocol)
            || !field_matches(self.scope, route.scope)
            || !field_matches(self.route_type, route.route_type)
            || !field_matches(self.tos, route.tos)
        {
            return false;
        }
        if self.gw.is_some_and(|gw| route.gw != Some(gw))
            || self.src.is_some_and(|src| route.src != Some(src))
        {
            return false;
        }
        if self.mpls_dst.is_some_and(|label| route.mpls_dst != Some(label)) {
            return false;
        }
        self.dst.is_none_or(|dst| dst == route.dst)
    }
}

fn field_matches<T: PartialEq>(want: Option<T>, got: T) -> bool {
    want.is_none_or(|w| w == got)
}

impl Connection {
    /// Add a route; fails if it exists.
    pub async fn route_add(&self, route: &Route) -> Result<()> {
        let mut req = create_request(NlMsgType::RTM_NEWROUTE);
        route.write_request(&mut req, false)?;
        self.request_ack(req)
            .await
            .map_err(|e| e.with_context("route_add"))
    }

    /// Add a route, appending to an existing multipath entry.
    pub async fn route_append(&self, route: &Route) -> Result<()> {
        let mut req = append_request(NlMsgType::RTM_NEWROUTE);
        route.write_request(&mut req, false)?;
        self.request_ack(req)
            .await
            .map_err(|e| e.with_context("route_append"))
    }

    /// Add a route or replace the existing one.
    pub async fn route_replace(&self, route: &Route) -> Result<()> {
        let mut req = replace_request(NlMsgType::RTM_NEWROUTE);
        route.write_request(&mut req, false)?;
        self.request_ack(req)
            .await
            .map_err(|e| e.with_context("route_replace"))
    }

    pub async fn route_del(&self, route: &Route) -> Result<()> {
        let mut req = ack_request(NlMsgType::RTM_DELROUTE);
        route.write_request(&mut req, true)?;
        self.request_ack(req)
            .await
            .map_err(|e| e.with_context("route_del"))
    }

    /// Dump routes of `family` (0 for all) that pass `filter`.
    ///
    /// Cloned cache entries are never reported.
    pub async fn route_list(&self, family: u8, filter: &RouteFilter) -> Result<Vec<Route>> {
        let mut req = Request::new(NlMsgType::RTM_GETROUTE, NLM_F_DUMP);
        req.add_data(&RtMsg::new().with_family(family))?;

        let mut routes = Vec::new();
        for payload in self.dump(req, NlMsgType::RTM_NEWROUTE).await? {
            let (header, _) = split_header::<RtMsg>(&payload)?;
            if header.rtm_flags & rtm_flags::CLONED != 0 {
                continue;
            }
            let route = Route::decode(&payload)?;
            if filter.matches(header.rtm_table, &route) {
                routes.push(route);
            }
        }
        Ok(routes)
    }

    /// Ask the kernel which route it would use to reach `dst`.
    pub async fn route_get(&self, dst: IpAddr) -> Result<Vec<Route>> {
        let net = IpNet::host(dst);
        let mut req = Request::new(NlMsgType::RTM_GETROUTE, 0);
        req.add_data(
            &RtMsg::new()
                .with_family(net.family())
                .with_dst_len(net.prefix_len()),
        )?;
        req.add_data(&RtAttr::new(rta::DST, ip_bytes(&dst)))?;

        self.execute(req, NlMsgType::RTM_NEWROUTE)
            .await?
            .iter()
            .map(|payload| Route::decode(payload))
            .collect()
    }
}
