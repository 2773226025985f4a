//! Address message types.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Interface address message (struct ifaddrmsg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IfAddrMsg {
    /// Address family (AF_INET, AF_INET6).
    pub ifa_family: u8,
    /// Prefix length.
    pub ifa_prefixlen: u8,
    /// Address flags (IFA_F_*, low 8 bits).
    pub ifa_flags: u8,
    /// Address scope.
    pub ifa_scope: u8,
    /// Interface index.
    pub ifa_index: u32,
}

impl IfAddrMsg {
    /// Create a new address message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address family.
    pub fn with_family(mut self, family: u8) -> Self {
        self.ifa_family = family;
        self
    }

    /// Set the interface index.
    pub fn with_index(mut self, index: u32) -> Self {
        self.ifa_index = index;
        self
    }
}

/// Address lifetimes (struct ifa_cacheinfo).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IfaCacheInfo {
    /// Preferred lifetime in seconds.
    pub ifa_prefered: u32,
    /// Valid lifetime in seconds.
    pub ifa_valid: u32,
    /// Creation timestamp (hundredths of seconds).
    pub cstamp: u32,
    /// Update timestamp (hundredths of seconds).
    pub tstamp: u32,
}

kernel_struct!(IfAddrMsg, IfaCacheInfo);

/// Address attributes (IFA_*).
pub mod ifa {
    pub const ADDRESS: u16 = 1;
    pub const LOCAL: u16 = 2;
    pub const LABEL: u16 = 3;
    pub const BROADCAST: u16 = 4;
    pub const ANYCAST: u16 = 5;
    pub const CACHEINFO: u16 = 6;
    pub const MULTICAST: u16 = 7;
    pub const FLAGS: u16 = 8;
}

/// Address flags (IFA_F_*).
pub mod ifa_flags {
    pub const SECONDARY: u32 = 0x01;
    pub const NODAD: u32 = 0x02;
    pub const OPTIMISTIC: u32 = 0x04;
    pub const DADFAILED: u32 = 0x08;
    pub const HOMEADDRESS: u32 = 0x10;
    pub const DEPRECATED: u32 = 0x20;
    pub const TENTATIVE: u32 = 0x40;
    pub const PERMANENT: u32 = 0x80;
    pub const MANAGETEMPADDR: u32 = 0x100;
    pub const NOPREFIXROUTE: u32 = 0x200;
}

/// Lifetime meaning "forever".
pub const INFINITY_LIFE_TIME: u32 = u32::MAX;
