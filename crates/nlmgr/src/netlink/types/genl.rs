//! Generic netlink header and control-family constants.
//!
//! ```text
//! nlmsghdr (16 bytes) | genlmsghdr (4 bytes) | attributes
//! ```

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Generic netlink message header (struct genlmsghdr).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GenlMsgHdr {
    /// Family-specific command.
    pub cmd: u8,
    /// Interface version.
    pub version: u8,
    pub reserved: u16,
}

impl GenlMsgHdr {
    pub const fn new(cmd: u8, version: u8) -> Self {
        Self {
            cmd,
            version,
            reserved: 0,
        }
    }
}

kernel_struct!(GenlMsgHdr);

/// The control family has a fixed id; all others are assigned at runtime.
pub const GENL_ID_CTRL: u16 = 0x10;

/// Version sent with control-family requests.
pub const CTRL_VERSION: u8 = 2;

/// Control family commands (CTRL_CMD_*).
pub mod ctrl_cmd {
    pub const NEWFAMILY: u8 = 1;
    pub const DELFAMILY: u8 = 2;
    pub const GETFAMILY: u8 = 3;
}

/// Control family attributes (CTRL_ATTR_*).
pub mod ctrl_attr {
    pub const FAMILY_ID: u16 = 1;
    pub const FAMILY_NAME: u16 = 2;
    pub const VERSION: u16 = 3;
    pub const HDRSIZE: u16 = 4;
    pub const MAXATTR: u16 = 5;
    pub const OPS: u16 = 6;
    pub const MCAST_GROUPS: u16 = 7;
}

/// Attributes of one entry in CTRL_ATTR_OPS (CTRL_ATTR_OP_*).
pub mod ctrl_attr_op {
    pub const ID: u16 = 1;
    pub const FLAGS: u16 = 2;
}

/// Attributes of one entry in CTRL_ATTR_MCAST_GROUPS (CTRL_ATTR_MCAST_GRP_*).
pub mod ctrl_attr_mcast_grp {
    pub const NAME: u16 = 1;
    pub const ID: u16 = 2;
}
