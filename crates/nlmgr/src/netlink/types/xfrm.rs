//! XFRM (IPsec) kernel structures.
//!
//! Unlike rtnetlink, the xfrm payloads embed 64-bit counters, so several of
//! these structs are 8-byte aligned. Trailing pad fields make the implicit
//! compiler padding explicit; the sizes are asserted in the tests below.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::netlink::error::{Error, Result};

/// Address in an xfrm structure (xfrm_address_t). IPv4 occupies the
/// first four bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct XfrmAddress {
    pub bytes: [u8; 16],
}

impl XfrmAddress {
    pub fn from_v4(addr: Ipv4Addr) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..4].copy_from_slice(&addr.octets());
        Self { bytes }
    }

    pub fn from_v6(addr: Ipv6Addr) -> Self {
        Self {
            bytes: addr.octets(),
        }
    }

    pub fn from_ip(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Self::from_v4(*v4),
            IpAddr::V6(v6) => Self::from_v6(*v6),
        }
    }

    /// Interpret the address for `family`. Returns `None` for families
    /// other than AF_INET and AF_INET6.
    pub fn to_ip(&self, family: u16) -> Option<IpAddr> {
        match family as i32 {
            libc::AF_INET => Some(IpAddr::V4(Ipv4Addr::new(
                self.bytes[0],
                self.bytes[1],
                self.bytes[2],
                self.bytes[3],
            ))),
            libc::AF_INET6 => Some(IpAddr::V6(Ipv6Addr::from(self.bytes))),
            _ => None,
        }
    }
}

/// Traffic selector (struct xfrm_selector).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct XfrmSelector {
    pub daddr: XfrmAddress,
    pub saddr: XfrmAddress,
    /// Network byte order.
    pub dport: u16,
    /// Network byte order.
    pub dport_mask: u16,
    /// Network byte order.
    pub sport: u16,
    /// Network byte order.
    pub sport_mask: u16,
    pub family: u16,
    pub prefixlen_d: u8,
    pub prefixlen_s: u8,
    pub proto: u8,
    pub _pad: [u8; 3],
    pub ifindex: i32,
    pub user: u32,
}

/// SA identity (struct xfrm_id).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct XfrmId {
    pub daddr: XfrmAddress,
    /// Network byte order.
    pub spi: u32,
    pub proto: u8,
    pub _pad: [u8; 3],
}

/// Configured lifetime limits (struct xfrm_lifetime_cfg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct XfrmLifetimeCfg {
    pub soft_byte_limit: u64,
    pub hard_byte_limit: u64,
    pub soft_packet_limit: u64,
    pub hard_packet_limit: u64,
    pub soft_add_expires_seconds: u64,
    pub hard_add_expires_seconds: u64,
    pub soft_use_expires_seconds: u64,
    pub hard_use_expires_seconds: u64,
}

impl XfrmLifetimeCfg {
    /// All limits set to [`XFRM_INF`].
    pub fn infinite() -> Self {
        Self {
            soft_byte_limit: XFRM_INF,
            hard_byte_limit: XFRM_INF,
            soft_packet_limit: XFRM_INF,
            hard_packet_limit: XFRM_INF,
            ..Default::default()
        }
    }
}

/// Current lifetime counters (struct xfrm_lifetime_cur).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct XfrmLifetimeCur {
    pub bytes: u64,
    pub packets: u64,
    pub add_time: u64,
    pub use_time: u64,
}

/// SA statistics (struct xfrm_stats).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct XfrmStats {
    pub replay_window: u32,
    pub replay: u32,
    pub integrity_failed: u32,
}

/// SA description (struct xfrm_usersa_info).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct XfrmUsersaInfo {
    pub sel: XfrmSelector,
    pub id: XfrmId,
    pub saddr: XfrmAddress,
    pub lft: XfrmLifetimeCfg,
    pub curlft: XfrmLifetimeCur,
    pub stats: XfrmStats,
    pub seq: u32,
    pub reqid: u32,
    pub family: u16,
    pub mode: u8,
    pub replay_window: u8,
    pub flags: u8,
    pub _pad: [u8; 7],
}

/// Expire notification (struct xfrm_user_expire).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct XfrmUserExpire {
    pub state: XfrmUsersaInfo,
    pub hard: u8,
    pub _pad: [u8; 7],
}

/// SA lookup key (struct xfrm_usersa_id).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct XfrmUsersaId {
    pub daddr: XfrmAddress,
    /// Network byte order.
    pub spi: u32,
    pub family: u16,
    pub proto: u8,
    pub _pad: u8,
}

/// SA flush request (struct xfrm_usersa_flush).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct XfrmUsersaFlush {
    pub proto: u8,
}

/// Policy description (struct xfrm_userpolicy_info).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct XfrmUserpolicyInfo {
    pub sel: XfrmSelector,
    pub lft: XfrmLifetimeCfg,
    pub curlft: XfrmLifetimeCur,
    pub priority: u32,
    pub index: u32,
    pub dir: u8,
    pub action: u8,
    pub flags: u8,
    pub share: u8,
    pub _pad: [u8; 4],
}

/// Policy lookup key (struct xfrm_userpolicy_id).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct XfrmUserpolicyId {
    pub sel: XfrmSelector,
    pub index: u32,
    pub dir: u8,
    pub _pad: [u8; 3],
}

/// Policy template (struct xfrm_user_tmpl).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct XfrmUserTmpl {
    pub id: XfrmId,
    pub family: u16,
    pub _pad1: [u8; 2],
    pub saddr: XfrmAddress,
    pub reqid: u32,
    pub mode: u8,
    pub share: u8,
    pub optional: u8,
    pub _pad2: u8,
    pub aalgos: u32,
    pub ealgos: u32,
    pub calgos: u32,
}

/// NAT-T encapsulation (struct xfrm_encap_tmpl).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct XfrmEncapTmpl {
    pub encap_type: u16,
    /// Network byte order.
    pub encap_sport: u16,
    /// Network byte order.
    pub encap_dport: u16,
    pub _pad: [u8; 2],
    pub encap_oa: XfrmAddress,
}

/// Firewall mark match (struct xfrm_mark).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct XfrmMarkRaw {
    pub v: u32,
    pub m: u32,
}

/// Fixed head of struct xfrm_replay_state_esn; `bmp_len` u32 words follow.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct XfrmReplayStateEsn {
    pub bmp_len: u32,
    pub oseq: u32,
    pub seq: u32,
    pub oseq_hi: u32,
    pub seq_hi: u32,
    pub replay_window: u32,
}

kernel_struct!(
    XfrmAddress,
    XfrmSelector,
    XfrmId,
    XfrmLifetimeCfg,
    XfrmLifetimeCur,
    XfrmStats,
    XfrmUsersaInfo,
    XfrmUserExpire,
    XfrmUsersaId,
    XfrmUsersaFlush,
    XfrmUserpolicyInfo,
    XfrmUserpolicyId,
    XfrmUserTmpl,
    XfrmEncapTmpl,
    XfrmMarkRaw,
    XfrmReplayStateEsn,
);

/// "No limit" value for lifetime fields.
pub const XFRM_INF: u64 = u64::MAX;

/// Length of the algorithm name field in struct xfrm_algo and friends.
pub const XFRM_ALG_NAME_LEN: usize = 64;

/// XFRM message types (XFRM_MSG_*).
pub mod xfrm_msg {
    pub const NEWSA: u16 = 0x10;
    pub const DELSA: u16 = 0x11;
    pub const GETSA: u16 = 0x12;
    pub const NEWPOLICY: u16 = 0x13;
    pub const DELPOLICY: u16 = 0x14;
    pub const GETPOLICY: u16 = 0x15;
    pub const ALLOCSPI: u16 = 0x16;
    pub const ACQUIRE: u16 = 0x17;
    pub const EXPIRE: u16 = 0x18;
    pub const UPDPOLICY: u16 = 0x19;
    pub const UPDSA: u16 = 0x1a;
    pub const POLEXPIRE: u16 = 0x1b;
    pub const FLUSHSA: u16 = 0x1c;
    pub const FLUSHPOLICY: u16 = 0x1d;
}

/// XFRM attributes (XFRMA_*).
pub mod xfrma {
    pub const ALG_AUTH: u16 = 1;
    pub const ALG_CRYPT: u16 = 2;
    pub const ALG_COMP: u16 = 3;
    pub const ENCAP: u16 = 4;
    pub const TMPL: u16 = 5;
    pub const SA: u16 = 6;
    pub const POLICY: u16 = 7;
    pub const SEC_CTX: u16 = 8;
    pub const LTIME_VAL: u16 = 9;
    pub const REPLAY_VAL: u16 = 10;
    pub const REPLAY_THRESH: u16 = 11;
    pub const ETIMER_THRESH: u16 = 12;
    pub const SRCADDR: u16 = 13;
    pub const COADDR: u16 = 14;
    pub const LASTUSED: u16 = 15;
    pub const POLICY_TYPE: u16 = 16;
    pub const MIGRATE: u16 = 17;
    pub const ALG_AEAD: u16 = 18;
    pub const KMADDRESS: u16 = 19;
    pub const ALG_AUTH_TRUNC: u16 = 20;
    pub const MARK: u16 = 21;
    pub const TFCPAD: u16 = 22;
    pub const REPLAY_ESN_VAL: u16 = 23;
    pub const SA_EXTRA_FLAGS: u16 = 24;
    pub const PROTO: u16 = 25;
    pub const ADDRESS_FILTER: u16 = 26;
    pub const PAD: u16 = 27;
    pub const OFFLOAD_DEV: u16 = 28;
    pub const SET_MARK: u16 = 29;
    pub const SET_MARK_MASK: u16 = 30;
    pub const IF_ID: u16 = 31;
}

/// SA flags (XFRM_STATE_*).
pub mod xfrm_state_flags {
    pub const NOECN: u8 = 1;
    pub const DECAP_DSCP: u8 = 2;
    pub const NOPMTUDISC: u8 = 4;
    pub const WILDRECV: u8 = 8;
    pub const ICMP: u8 = 16;
    pub const AF_UNSPEC: u8 = 32;
    pub const ALIGN4: u8 = 64;
    pub const ESN: u8 = 128;
}

/// Encapsulation types (UDP_ENCAP_*).
pub mod encap_type {
    pub const ESPINUDP_NON_IKE: u16 = 1;
    pub const ESPINUDP: u16 = 2;
}

/// Policy directions (XFRM_POLICY_*).
pub mod policy_dir {
    pub const IN: u8 = 0;
    pub const OUT: u8 = 1;
    pub const FWD: u8 = 2;
}

/// Policy actions.
pub mod policy_action {
    pub const ALLOW: u8 = 0;
    pub const BLOCK: u8 = 1;
}

/// IPsec protocol numbers.
pub mod ipsec_proto {
    /// IPv6 routing header (Mobile IPv6).
    pub const ROUTE2: u8 = 43;
    pub const ESP: u8 = 50;
    pub const AH: u8 = 51;
    /// Home address option (Mobile IPv6).
    pub const HAO: u8 = 60;
    pub const COMP: u8 = 108;
    /// Matches any IPsec protocol in a flush.
    pub const ANY: u8 = 255;
}

/// SA modes (XFRM_MODE_*).
pub mod xfrm_mode {
    pub const TRANSPORT: u8 = 0;
    pub const TUNNEL: u8 = 1;
    pub const ROUTEOPTIMIZATION: u8 = 2;
    pub const IN_TRIGGER: u8 = 3;
    pub const BEET: u8 = 4;
}

fn alg_name(name: &str) -> Result<[u8; XFRM_ALG_NAME_LEN]> {
    if name.len() >= XFRM_ALG_NAME_LEN {
        return Err(Error::InvalidRequest(format!(
            "algorithm name '{name}' longer than {} bytes",
            XFRM_ALG_NAME_LEN - 1
        )));
    }
    let mut buf = [0u8; XFRM_ALG_NAME_LEN];
    buf[..name.len()].copy_from_slice(name.as_bytes());
    Ok(buf)
}

fn key_bits(key: &[u8]) -> Result<u32> {
    u32::try_from(key.len() * 8)
        .map_err(|_| Error::InvalidRequest(format!("key of {} bytes too long", key.len())))
}

/// Encode struct xfrm_algo: name, key length in bits, key.
pub fn encode_algo(name: &str, key: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(XFRM_ALG_NAME_LEN + 4 + key.len());
    buf.extend_from_slice(&alg_name(name)?);
    buf.extend_from_slice(&key_bits(key)?.to_ne_bytes());
    buf.extend_from_slice(key);
    Ok(buf)
}

/// Encode struct xfrm_algo_auth: name, key bits, truncation bits, key.
pub fn encode_algo_auth(name: &str, key: &[u8], trunc_len: u32) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(XFRM_ALG_NAME_LEN + 8 + key.len());
    buf.extend_from_slice(&alg_name(name)?);
    buf.extend_from_slice(&key_bits(key)?.to_ne_bytes());
    buf.extend_from_slice(&trunc_len.to_ne_bytes());
    buf.extend_from_slice(key);
    Ok(buf)
}

/// Encode struct xfrm_algo_aead: name, key bits, ICV bits, key.
pub fn encode_algo_aead(name: &str, key: &[u8], icv_len: u32) -> Result<Vec<u8>> {
    encode_algo_auth(name, key, icv_len)
}

/// A decoded algorithm attribute. `extra` is the truncation length for
/// auth_trunc and the ICV length for AEAD; zero for plain algorithms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedAlgo {
    pub name: String,
    pub key: Vec<u8>,
    pub extra: u32,
}

fn decode_algo_inner(data: &[u8], with_extra: bool) -> Result<DecodedAlgo> {
    let head = XFRM_ALG_NAME_LEN + if with_extra { 8 } else { 4 };
    if data.len() < head {
        return Err(Error::Truncated {
            expected: head,
            actual: data.len(),
        });
    }
    let name = crate::netlink::parse::parse_string_from_bytes(&data[..XFRM_ALG_NAME_LEN]);
    let bits = u32::from_ne_bytes([data[64], data[65], data[66], data[67]]) as usize;
    let extra = if with_extra {
        u32::from_ne_bytes([data[68], data[69], data[70], data[71]])
    } else {
        0
    };
    let key_len = bits.div_ceil(8);
    let key = data.get(head..head + key_len).ok_or(Error::Truncated {
        expected: head + key_len,
        actual: data.len(),
    })?;
    Ok(DecodedAlgo {
        name,
        key: key.to_vec(),
        extra,
    })
}

/// Decode struct xfrm_algo.
pub fn decode_algo(data: &[u8]) -> Result<DecodedAlgo> {
    decode_algo_inner(data, false)
}

/// Decode struct xfrm_algo_auth or struct xfrm_algo_aead.
pub fn decode_algo_with_len(data: &[u8]) -> Result<DecodedAlgo> {
    decode_algo_inner(data, true)
}

/// Encode struct xfrm_replay_state_esn with an all-zero bitmap.
pub fn encode_replay_esn(replay_window: u32) -> Vec<u8> {
    let bmp_len = replay_window.div_ceil(32);
    let head = XfrmReplayStateEsn {
        bmp_len,
        replay_window,
        ..Default::default()
    };
    let mut buf = Vec::with_capacity(XfrmReplayStateEsn::SIZE + bmp_len as usize * 4);
    buf.extend_from_slice(zerocopy::IntoBytes::as_bytes(&head));
    buf.resize(XfrmReplayStateEsn::SIZE + bmp_len as usize * 4, 0);
    buf
}
