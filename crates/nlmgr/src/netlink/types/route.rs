//! Route message types.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Route message (struct rtmsg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RtMsg {
    /// Address family.
    pub rtm_family: u8,
    /// Destination prefix length.
    pub rtm_dst_len: u8,
    /// Source prefix length.
    pub rtm_src_len: u8,
    /// TOS filter.
    pub rtm_tos: u8,
    /// Routing table ID; see RTA_TABLE for ids above 255.
    pub rtm_table: u8,
    /// Routing protocol (RTPROT_*).
    pub rtm_protocol: u8,
    /// Route scope (RT_SCOPE_*).
    pub rtm_scope: u8,
    /// Route type (RTN_*).
    pub rtm_type: u8,
    /// Route flags (RTM_F_* / RTNH_F_*).
    pub rtm_flags: u32,
}

impl RtMsg {
    /// Create a new route message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address family.
    pub fn with_family(mut self, family: u8) -> Self {
        self.rtm_family = family;
        self
    }

    /// Set the destination prefix length.
    pub fn with_dst_len(mut self, len: u8) -> Self {
        self.rtm_dst_len = len;
        self
    }

    /// Set the routing table.
    pub fn with_table(mut self, table: u8) -> Self {
        self.rtm_table = table;
        self
    }

    /// Set the scope.
    pub fn with_scope(mut self, scope: u8) -> Self {
        self.rtm_scope = scope;
        self
    }
}

/// Multipath next hop header (struct rtnexthop), followed by attributes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RtNexthop {
    /// Length of this header plus its attributes.
    pub rtnh_len: u16,
    /// RTNH_F_* flags.
    pub rtnh_flags: u8,
    /// Weight minus one.
    pub rtnh_hops: u8,
    /// Output interface index.
    pub rtnh_ifindex: i32,
}

/// Route cache information (struct rta_cacheinfo).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RtaCacheInfo {
    pub rta_clntref: u32,
    pub rta_lastuse: u32,
    pub rta_expires: i32,
    pub rta_error: u32,
    pub rta_used: u32,
    pub rta_id: u32,
    pub rta_ts: u32,
    pub rta_tsage: u32,
}

kernel_struct!(RtMsg, RtNexthop, RtaCacheInfo);

/// Route attributes (RTA_*).
pub mod rta {
    pub const DST: u16 = 1;
    pub const SRC: u16 = 2;
    pub const IIF: u16 = 3;
    pub const OIF: u16 = 4;
    pub const GATEWAY: u16 = 5;
    pub const PRIORITY: u16 = 6;
    pub const PREFSRC: u16 = 7;
    pub const METRICS: u16 = 8;
    pub const MULTIPATH: u16 = 9;
    pub const FLOW: u16 = 11;
    pub const CACHEINFO: u16 = 12;
    pub const TABLE: u16 = 15;
    pub const MARK: u16 = 16;
    pub const VIA: u16 = 18;
    pub const NEWDST: u16 = 19;
    pub const PREF: u16 = 20;
    pub const ENCAP_TYPE: u16 = 21;
    pub const ENCAP: u16 = 22;
    pub const EXPIRES: u16 = 23;
}

/// Route metrics nested in RTA_METRICS (RTAX_*).
pub mod rtax {
    pub const MTU: u16 = 2;
    pub const WINDOW: u16 = 3;
    pub const ADVMSS: u16 = 8;
    pub const HOPLIMIT: u16 = 10;
}

/// Routing tables (RT_TABLE_*).
pub mod rt_table {
    pub const UNSPEC: u32 = 0;
    /// Reported in rtm_table when RTA_TABLE carries the real id.
    pub const COMPAT: u32 = 252;
    pub const DEFAULT: u32 = 253;
    pub const MAIN: u32 = 254;
    pub const LOCAL: u32 = 255;
}

/// Route scopes (RT_SCOPE_*).
pub mod rt_scope {
    pub const UNIVERSE: u8 = 0;
    pub const SITE: u8 = 200;
    pub const LINK: u8 = 253;
    pub const HOST: u8 = 254;
    pub const NOWHERE: u8 = 255;
}

/// Route origins (RTPROT_*).
pub mod rtprot {
    pub const UNSPEC: u8 = 0;
    pub const REDIRECT: u8 = 1;
    pub const KERNEL: u8 = 2;
    pub const BOOT: u8 = 3;
    pub const STATIC: u8 = 4;
}

/// Route types (RTN_*).
pub mod rtn {
    pub const UNSPEC: u8 = 0;
    pub const UNICAST: u8 = 1;
    pub const LOCAL: u8 = 2;
    pub const BROADCAST: u8 = 3;
    pub const ANYCAST: u8 = 4;
    pub const MULTICAST: u8 = 5;
    pub const BLACKHOLE: u8 = 6;
    pub const UNREACHABLE: u8 = 7;
    pub const PROHIBIT: u8 = 8;
}

/// Next hop flags (RTNH_F_*).
pub mod rtnh_flags {
    pub const DEAD: u8 = 1;
    pub const PERVASIVE: u8 = 2;
    pub const ONLINK: u8 = 4;
}

/// Route message flags (RTM_F_*).
pub mod rtm_flags {
    pub const NOTIFY: u32 = 0x100;
    pub const CLONED: u32 = 0x200;
}

/// Address family for MPLS routes.
pub const AF_MPLS: u8 = 28;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::types::oracle::{self, i32_at, u16_at, u32_at};

    #[test]
    fn test_sizes() {
        assert_eq!(RtMsg::SIZE, 12);
        assert_eq!(RtNexthop::SIZE, 8);
        assert_eq!(RtaCacheInfo::SIZE, 32);
    }

    #[test]
    fn test_rtmsg_roundtrip() {
        oracle::roundtrip::<RtMsg, _>(64, |m, b| {
            assert_eq!(
                [
                    m.rtm_family,
                    m.rtm_dst_len,
                    m.rtm_src_len,
                    m.rtm_tos,
                    m.rtm_table,
                    m.rtm_protocol,
                    m.rtm_scope,
                    m.rtm_type
                ],
                b[..8]
            );
            assert_eq!(m.rtm_flags, u32_at(b, 8));
        });
    }

    #[test]
    fn test_rtnexthop_roundtrip() {
        oracle::roundtrip::<RtNexthop, _>(64, |n, b| {
            assert_eq!(n.rtnh_len, u16_at(b, 0));
            assert_eq!(n.rtnh_flags, b[2]);
            assert_eq!(n.rtnh_hops, b[3]);
            assert_eq!(n.rtnh_ifindex, i32_at(b, 4));
        });
    }

    #[test]
    fn test_cacheinfo_roundtrip() {
        oracle::roundtrip::<RtaCacheInfo, _>(32, |c, b| {
            assert_eq!(c.rta_expires, i32_at(b, 8));
            assert_eq!(c.rta_tsage, u32_at(b, 28));
        });
    }
}
