//! Traffic control message types.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Traffic control message (struct tcmsg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TcMsg {
    /// Address family (usually AF_UNSPEC).
    pub tcm_family: u8,
    /// Padding.
    pub tcm_pad1: u8,
    /// Padding.
    pub tcm_pad2: u16,
    /// Interface index.
    pub tcm_ifindex: i32,
    /// Qdisc/class/filter handle.
    pub tcm_handle: u32,
    /// Parent handle.
    pub tcm_parent: u32,
    /// Filters: priority << 16 | protocol (network order). Qdiscs: refcount.
    pub tcm_info: u32,
}

impl TcMsg {
    /// Create a new TC message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the interface index.
    pub fn with_ifindex(mut self, ifindex: i32) -> Self {
        self.tcm_ifindex = ifindex;
        self
    }

    /// Set the handle.
    pub fn with_handle(mut self, handle: u32) -> Self {
        self.tcm_handle = handle;
        self
    }

    /// Set the parent handle.
    pub fn with_parent(mut self, parent: u32) -> Self {
        self.tcm_parent = parent;
        self
    }

    /// Set the info field.
    pub fn with_info(mut self, info: u32) -> Self {
        self.tcm_info = info;
        self
    }
}

/// Rate specification (struct tc_ratespec).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TcRateSpec {
    pub cell_log: u8,
    pub linklayer: u8,
    pub overhead: u16,
    pub cell_align: i16,
    pub mpu: u16,
    /// Bytes per second, saturated at u32::MAX (see the *_RATE64 attributes).
    pub rate: u32,
}

/// HTB qdisc parameters (struct tc_htb_glob).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TcHtbGlob {
    pub version: u32,
    pub rate2quantum: u32,
    pub defcls: u32,
    pub debug: u32,
    pub direct_pkts: u32,
}

/// HTB class parameters (struct tc_htb_opt).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TcHtbOpt {
    pub rate: TcRateSpec,
    pub ceil: TcRateSpec,
    pub buffer: u32,
    pub cbuffer: u32,
    pub quantum: u32,
    pub level: u32,
    pub prio: u32,
}

/// Token bucket parameters (struct tc_tbf_qopt).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TcTbfQopt {
    pub rate: TcRateSpec,
    pub peakrate: TcRateSpec,
    pub limit: u32,
    pub buffer: u32,
    pub mtu: u32,
}

/// Priority qdisc parameters (struct tc_prio_qopt).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TcPrioQopt {
    pub bands: i32,
    pub priomap: [u8; 16],
}

/// U32 selector header (struct tc_u32_sel), followed by `nkeys` keys.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TcU32SelHdr {
    pub flags: u8,
    pub offshift: u8,
    pub nkeys: u8,
    pub pad: u8,
    /// Network byte order.
    pub offmask: u16,
    pub off: u16,
    pub offoff: i16,
    pub hoff: i16,
    /// Network byte order.
    pub hmask: u32,
}

/// U32 match key (struct tc_u32_key).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TcU32Key {
    /// Network byte order.
    pub mask: u32,
    /// Network byte order.
    pub val: u32,
    pub off: i32,
    pub offmask: i32,
}

kernel_struct!(
    TcMsg,
    TcRateSpec,
    TcHtbGlob,
    TcHtbOpt,
    TcTbfQopt,
    TcPrioQopt,
    TcU32SelHdr,
    TcU32Key
);

/// Generic TC attributes (TCA_*).
pub mod tca {
    pub const KIND: u16 = 1;
    pub const OPTIONS: u16 = 2;
    pub const STATS: u16 = 3;
    pub const XSTATS: u16 = 4;
    pub const RATE: u16 = 5;
    pub const FCNT: u16 = 6;
    pub const STATS2: u16 = 7;
    pub const STAB: u16 = 8;
    pub const CHAIN: u16 = 11;
}

/// Special handle values (TC_H_*).
pub mod tc_handle {
    pub const UNSPEC: u32 = 0;
    pub const ROOT: u32 = 0xFFFF_FFFF;
    pub const INGRESS: u32 = 0xFFFF_FFF1;
    pub const CLSACT: u32 = INGRESS;
    pub const MIN_INGRESS: u16 = 0xFFF2;
    pub const MIN_EGRESS: u16 = 0xFFF3;
}

/// Link layer of a rate table (TC_LINKLAYER_*).
pub mod linklayer {
    pub const ETHERNET: u8 = 1;
    pub const ATM: u8 = 2;
    pub const MASK: u8 = 0x0f;
}

/// HTB attributes (TCA_HTB_*).
pub mod htb {
    pub const PARMS: u16 = 1;
    pub const INIT: u16 = 2;
    pub const CTAB: u16 = 3;
    pub const RTAB: u16 = 4;
    pub const DIRECT_QLEN: u16 = 5;
    pub const RATE64: u16 = 6;
    pub const CEIL64: u16 = 7;
    /// Protocol version written into tc_htb_glob.
    pub const PROTO_VERSION: u32 = 3;
}

/// TBF attributes (TCA_TBF_*).
pub mod tbf {
    pub const PARMS: u16 = 1;
    pub const RTAB: u16 = 2;
    pub const PTAB: u16 = 3;
    pub const RATE64: u16 = 4;
    pub const PRATE64: u16 = 5;
    pub const BURST: u16 = 6;
    pub const PBURST: u16 = 7;
}

/// FQ attributes (TCA_FQ_*).
pub mod fq {
    pub const PLIMIT: u16 = 1;
    pub const FLOW_PLIMIT: u16 = 2;
    pub const QUANTUM: u16 = 3;
    pub const INITIAL_QUANTUM: u16 = 4;
    pub const RATE_ENABLE: u16 = 5;
    pub const FLOW_DEFAULT_RATE: u16 = 6;
    pub const FLOW_MAX_RATE: u16 = 7;
    pub const BUCKETS_LOG: u16 = 8;
    pub const FLOW_REFILL_DELAY: u16 = 9;
    pub const ORPHAN_MASK: u16 = 10;
    pub const LOW_RATE_THRESHOLD: u16 = 11;
}

/// FQ-CoDel attributes (TCA_FQ_CODEL_*).
pub mod fq_codel {
    pub const TARGET: u16 = 1;
    pub const LIMIT: u16 = 2;
    pub const INTERVAL: u16 = 3;
    pub const ECN: u16 = 4;
    pub const FLOWS: u16 = 5;
    pub const QUANTUM: u16 = 6;
    pub const CE_THRESHOLD: u16 = 7;
    pub const DROP_BATCH_SIZE: u16 = 8;
    pub const MEMORY_LIMIT: u16 = 9;
}

/// U32 classifier attributes (TCA_U32_*).
pub mod u32_attr {
    pub const CLASSID: u16 = 1;
    pub const HASH: u16 = 2;
    pub const LINK: u16 = 3;
    pub const DIVISOR: u16 = 4;
    pub const SEL: u16 = 5;
    pub const INDEV: u16 = 8;
    pub const MARK: u16 = 10;
    pub const FLAGS: u16 = 11;
    /// TC_U32_TERMINAL selector flag.
    pub const SEL_TERMINAL: u8 = 1;
}

/// FW classifier attributes (TCA_FW_*).
pub mod fw {
    pub const CLASSID: u16 = 1;
    pub const INDEV: u16 = 3;
    pub const MASK: u16 = 5;
}
