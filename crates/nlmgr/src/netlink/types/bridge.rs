//! Bridge VLAN structures.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// VLAN entry of a bridge port (struct bridge_vlan_info).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct BridgeVlanInfo {
    /// BRIDGE_VLAN_INFO_* flags.
    pub flags: u16,
    /// VLAN id.
    pub vid: u16,
}

impl BridgeVlanInfo {
    /// Create an entry for `vid` with no flags.
    pub fn new(vid: u16) -> Self {
        Self { flags: 0, vid }
    }

    /// This VLAN is the port's PVID.
    pub fn is_pvid(&self) -> bool {
        self.flags & bridge_vlan_info::PVID != 0
    }

    /// Frames leave the port untagged.
    pub fn is_untagged(&self) -> bool {
        self.flags & bridge_vlan_info::UNTAGGED != 0
    }
}

kernel_struct!(BridgeVlanInfo);

/// BRIDGE_VLAN_INFO_* flags.
pub mod bridge_vlan_info {
    pub const MASTER: u16 = 0x1;
    pub const PVID: u16 = 0x2;
    pub const UNTAGGED: u16 = 0x4;
    pub const RANGE_BEGIN: u16 = 0x8;
    pub const RANGE_END: u16 = 0x10;
}

/// Attributes nested in IFLA_AF_SPEC for AF_BRIDGE (IFLA_BRIDGE_*).
pub mod ifla_bridge {
    pub const FLAGS: u16 = 0;
    pub const MODE: u16 = 1;
    pub const VLAN_INFO: u16 = 2;
}

/// Values of IFLA_BRIDGE_FLAGS (BRIDGE_FLAGS_*).
pub mod bridge_flags {
    pub const MASTER: u16 = 1;
    pub const SELF: u16 = 2;
}
