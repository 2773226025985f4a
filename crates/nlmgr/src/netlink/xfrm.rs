//! IPsec security associations and policies over `NETLINK_XFRM`.
//!
//! The methods here must be called on a [`Connection`] opened with
//! [`Protocol::Xfrm`](super::socket::Protocol::Xfrm).
//!
//! # Example
//!
//! ```ignore
//! use nlmgr::netlink::{Connection, Protocol};
//! use nlmgr::netlink::xfrm::*;
//!
//! let conn = Connection::new(Protocol::Xfrm)?;
//!
//! let state = XfrmState::new(src, dst, XfrmProto::Esp, 0x100)
//!     .mode(XfrmMode::Tunnel)
//!     .auth(XfrmAlgo::auth("hmac(sha256)", key, 96))
//!     .crypt(XfrmAlgo::new("cbc(aes)", enc_key));
//! conn.xfrm_state_add(&state).await?;
//!
//! for sa in conn.xfrm_state_list(0).await? {
//!     println!("{} -> {} spi {:#x}", sa.src, sa.dst, sa.spi);
//! }
//! ```

use std::fmt;
use std::net::IpAddr;

use zerocopy::IntoBytes;

use super::attr::{AttrIter, get};
use super::builder::Request;
use super::connection::{Connection, ack_request, dump_request};
use super::error::{Error, Result};
use super::parse::{ip_family, split_header};
use super::route::IpNet;
use super::types::xfrm::{
    XFRM_INF, XfrmAddress, XfrmEncapTmpl, XfrmId, XfrmLifetimeCfg, XfrmMarkRaw,
    XfrmReplayStateEsn, XfrmSelector, XfrmUserExpire, XfrmUserTmpl, XfrmUsersaFlush,
    XfrmUsersaId, XfrmUsersaInfo, XfrmUserpolicyId, XfrmUserpolicyInfo, decode_algo,
    decode_algo_with_len, encap_type, encode_algo, encode_algo_aead, encode_algo_auth,
    encode_replay_esn, ipsec_proto, policy_action, policy_dir, xfrm_mode, xfrm_msg,
    xfrm_state_flags, xfrma,
};

/// Transform protocol of a state or template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XfrmProto {
    Route2,
    Esp,
    Ah,
    Hao,
    Comp,
    /// Any IPsec protocol.
    IpsecAny,
    Other(u8),
}

impl XfrmProto {
    pub fn from_u8(val: u8) -> Self {
        match val {
            ipsec_proto::ROUTE2 => Self::Route2,
            ipsec_proto::ESP => Self::Esp,
            ipsec_proto::AH => Self::Ah,
            ipsec_proto::HAO => Self::Hao,
            ipsec_proto::COMP => Self::Comp,
            ipsec_proto::ANY => Self::IpsecAny,
            other => Self::Other(other),
        }
    }

    /// IP protocol number.
    pub fn number(&self) -> u8 {
        match self {
            Self::Route2 => ipsec_proto::ROUTE2,
            Self::Esp => ipsec_proto::ESP,
            Self::Ah => ipsec_proto::AH,
            Self::Hao => ipsec_proto::HAO,
            Self::Comp => ipsec_proto::COMP,
            Self::IpsecAny => ipsec_proto::ANY,
            Self::Other(n) => *n,
        }
    }
}

impl fmt::Display for XfrmProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Route2 => f.write_str("route2"),
            Self::Esp => f.write_str("esp"),
            Self::Ah => f.write_str("ah"),
            Self::Hao => f.write_str("hao"),
            Self::Comp => f.write_str("comp"),
            Self::IpsecAny => f.write_str("ipsec-any"),
            Self::Other(n) => write!(f, "{n}"),
        }
    }
}

/// Encapsulation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum XfrmMode {
    #[default]
    Transport,
    Tunnel,
    RouteOptimization,
    InTrigger,
    Beet,
    Other(u8),
}

impl XfrmMode {
    pub fn from_u8(val: u8) -> Self {
        match val {
            xfrm_mode::TRANSPORT => Self::Transport,
            xfrm_mode::TUNNEL => Self::Tunnel,
            xfrm_mode::ROUTEOPTIMIZATION => Self::RouteOptimization,
            xfrm_mode::IN_TRIGGER => Self::InTrigger,
            xfrm_mode::BEET => Self::Beet,
            other => Self::Other(other),
        }
    }

    pub fn number(&self) -> u8 {
        match self {
            Self::Transport => xfrm_mode::TRANSPORT,
            Self::Tunnel => xfrm_mode::TUNNEL,
            Self::RouteOptimization => xfrm_mode::ROUTEOPTIMIZATION,
            Self::InTrigger => xfrm_mode::IN_TRIGGER,
            Self::Beet => xfrm_mode::BEET,
            Self::Other(n) => *n,
        }
    }
}

impl fmt::Display for XfrmMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => f.write_str("transport"),
            Self::Tunnel => f.write_str("tunnel"),
            Self::RouteOptimization => f.write_str("ro"),
            Self::InTrigger => f.write_str("in_trigger"),
            Self::Beet => f.write_str("beet"),
            Self::Other(n) => write!(f, "{n}"),
        }
    }
}

/// Firewall mark a state or policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XfrmMark {
    pub value: u32,
    pub mask: u32,
}

impl XfrmMark {
    pub fn new(value: u32, mask: u32) -> Self {
        Self { value, mask }
    }

    fn to_raw(self) -> XfrmMarkRaw {
        XfrmMarkRaw {
            v: self.value,
            m: self.mask,
        }
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let raw = get::fixed::<XfrmMarkRaw>(data)?;
        Ok(Self::new(raw.v, raw.m))
    }
}

/// An algorithm with its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XfrmAlgo {
    pub name: String,
    pub key: Vec<u8>,
    /// Truncated ICV length in bits (authentication only).
    pub truncate_len: u32,
    /// ICV length in bits (AEAD only).
    pub icv_len: u32,
}

impl XfrmAlgo {
    /// A cipher such as `cbc(aes)`.
    pub fn new(name: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            truncate_len: 0,
            icv_len: 0,
        }
    }

    /// An authentication algorithm truncated to `truncate_len` bits.
    pub fn auth(name: impl Into<String>, key: impl Into<Vec<u8>>, truncate_len: u32) -> Self {
        Self {
            truncate_len,
            ..Self::new(name, key)
        }
    }

    /// An AEAD algorithm such as `rfc4106(gcm(aes))`.
    pub fn aead(name: impl Into<String>, key: impl Into<Vec<u8>>, icv_len: u32) -> Self {
        Self {
            icv_len,
            ..Self::new(name, key)
        }
    }
}

/// Kind of UDP encapsulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncapType {
    EspInUdpNonIke,
    EspInUdp,
    Other(u16),
}

impl EncapType {
    fn from_u16(val: u16) -> Self {
        match val {
            encap_type::ESPINUDP_NON_IKE => Self::EspInUdpNonIke,
            encap_type::ESPINUDP => Self::EspInUdp,
            other => Self::Other(other),
        }
    }

    fn number(&self) -> u16 {
        match self {
            Self::EspInUdpNonIke => encap_type::ESPINUDP_NON_IKE,
            Self::EspInUdp => encap_type::ESPINUDP,
            Self::Other(n) => *n,
        }
    }
}

impl fmt::Display for EncapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EspInUdpNonIke => f.write_str("espinudp-non-ike"),
            Self::EspInUdp => f.write_str("espinudp"),
            Self::Other(_) => f.write_str("unknown"),
        }
    }
}

/// NAT traversal encapsulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XfrmEncap {
    pub encap_type: EncapType,
    pub src_port: u16,
    pub dst_port: u16,
    pub original_address: Option<IpAddr>,
}

impl XfrmEncap {
    fn to_raw(self) -> XfrmEncapTmpl {
        XfrmEncapTmpl {
            encap_type: self.encap_type.number(),
            encap_sport: self.src_port.to_be(),
            encap_dport: self.dst_port.to_be(),
            encap_oa: self
                .original_address
                .as_ref()
                .map(XfrmAddress::from_ip)
                .unwrap_or_default(),
            ..Default::default()
        }
    }

    fn decode(data: &[u8], family: u16) -> Result<Self> {
        let raw = get::fixed::<XfrmEncapTmpl>(data)?;
        let original_address = raw
            .encap_oa
            .to_ip(family)
            .filter(|ip| !ip.is_unspecified());
        Ok(Self {
            encap_type: EncapType::from_u16(raw.encap_type),
            src_port: u16::from_be(raw.encap_sport),
            dst_port: u16::from_be(raw.encap_dport),
            original_address,
        })
    }
}

/// Lifetime limits. Zero byte and packet limits mean unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XfrmLimits {
    pub byte_soft: u64,
    pub byte_hard: u64,
    pub packet_soft: u64,
    pub packet_hard: u64,
    pub time_soft: u64,
    pub time_hard: u64,
    pub time_use_soft: u64,
    pub time_use_hard: u64,
}

fn or_infinite(limit: u64) -> u64 {
    if limit == 0 { XFRM_INF } else { limit }
}

fn from_infinite(limit: u64) -> u64 {
    if limit == XFRM_INF { 0 } else { limit }
}

impl XfrmLimits {
    fn to_lifetime(self) -> XfrmLifetimeCfg {
        XfrmLifetimeCfg {
            soft_byte_limit: or_infinite(self.byte_soft),
            hard_byte_limit: or_infinite(self.byte_hard),
            soft_packet_limit: or_infinite(self.packet_soft),
            hard_packet_limit: or_infinite(self.packet_hard),
            soft_add_expires_seconds: self.time_soft,
            hard_add_expires_seconds: self.time_hard,
            soft_use_expires_seconds: self.time_use_soft,
            hard_use_expires_seconds: self.time_use_hard,
        }
    }

    fn from_lifetime(lft: &XfrmLifetimeCfg) -> Self {
        Self {
            byte_soft: from_infinite(lft.soft_byte_limit),
            byte_hard: from_infinite(lft.hard_byte_limit),
            packet_soft: from_infinite(lft.soft_packet_limit),
            packet_hard: from_infinite(lft.hard_packet_limit),
            time_soft: lft.soft_add_expires_seconds,
            time_hard: lft.hard_add_expires_seconds,
            time_use_soft: lft.soft_use_expires_seconds,
            time_use_hard: lft.hard_use_expires_seconds,
        }
    }
}

/// Counters reported by the kernel. Ignored on write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XfrmStats {
    pub replay_window: u32,
    pub replay: u32,
    pub failed: u32,
    pub bytes: u64,
    pub packets: u64,
    /// Seconds since the epoch.
    pub add_time: u64,
    pub use_time: u64,
}

/// An IPsec security association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XfrmState {
    pub dst: IpAddr,
    pub src: IpAddr,
    pub proto: XfrmProto,
    pub mode: XfrmMode,
    pub spi: u32,
    pub reqid: u32,
    /// Anti-replay window in packets. At most 255 unless `esn` is set.
    pub replay_window: u32,
    pub limits: XfrmLimits,
    pub statistics: XfrmStats,
    pub mark: Option<XfrmMark>,
    pub auth: Option<XfrmAlgo>,
    pub crypt: Option<XfrmAlgo>,
    pub aead: Option<XfrmAlgo>,
    pub encap: Option<XfrmEncap>,
    /// Extended sequence numbers.
    pub esn: bool,
}

impl XfrmState {
    pub fn new(src: IpAddr, dst: IpAddr, proto: XfrmProto, spi: u32) -> Self {
        Self {
            dst,
            src,
            proto,
            mode: XfrmMode::Transport,
            spi,
            reqid: 0,
            replay_window: 0,
            limits: XfrmLimits::default(),
            statistics: XfrmStats::default(),
            mark: None,
            auth: None,
            crypt: None,
            aead: None,
            encap: None,
            esn: false,
        }
    }

    pub fn mode(mut self, mode: XfrmMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn reqid(mut self, reqid: u32) -> Self {
        self.reqid = reqid;
        self
    }

    pub fn replay_window(mut self, window: u32) -> Self {
        self.replay_window = window;
        self
    }

    pub fn limits(mut self, limits: XfrmLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn mark(mut self, mark: XfrmMark) -> Self {
        self.mark = Some(mark);
        self
    }

    pub fn auth(mut self, algo: XfrmAlgo) -> Self {
        self.auth = Some(algo);
        self
    }

    pub fn crypt(mut self, algo: XfrmAlgo) -> Self {
        self.crypt = Some(algo);
        self
    }

    pub fn aead(mut self, algo: XfrmAlgo) -> Self {
        self.aead = Some(algo);
        self
    }

    pub fn encap(mut self, encap: XfrmEncap) -> Self {
        self.encap = Some(encap);
        self
    }

    pub fn esn(mut self) -> Self {
        self.esn = true;
        self
    }

    fn family(&self) -> Result<u16> {
        let family = ip_family(&self.dst);
        if family != ip_family(&self.src) {
            return Err(Error::InvalidRequest(format!(
                "state endpoints {} and {} differ in family",
                self.src, self.dst
            )));
        }
        Ok(family as u16)
    }

    fn write_request(&self, req: &mut Request) -> Result<()> {
        let family = self.family()?;
        let mut info = XfrmUsersaInfo {
            id: XfrmId {
                daddr: XfrmAddress::from_ip(&self.dst),
                spi: self.spi.to_be(),
                proto: self.proto.number(),
                ..Default::default()
            },
            saddr: XfrmAddress::from_ip(&self.src),
            lft: self.limits.to_lifetime(),
            reqid: self.reqid,
            family,
            mode: self.mode.number(),
            ..Default::default()
        };
        if self.esn {
            if self.replay_window == 0 {
                return Err(Error::InvalidRequest(
                    "ESN flag set without a replay window".into(),
                ));
            }
            info.flags |= xfrm_state_flags::ESN;
        } else {
            info.replay_window = u8::try_from(self.replay_window).map_err(|_| {
                Error::InvalidRequest(format!(
                    "replay window {} needs ESN",
                    self.replay_window
                ))
            })?;
        }
        req.append(&info);

        if let Some(auth) = &self.auth {
            req.append_attr(
                xfrma::ALG_AUTH_TRUNC,
                &encode_algo_auth(&auth.name, &auth.key, auth.truncate_len)?,
            );
        }
        if let Some(crypt) = &self.crypt {
            req.append_attr(xfrma::ALG_CRYPT, &encode_algo(&crypt.name, &crypt.key)?);
        }
        if let Some(aead) = &self.aead {
            req.append_attr(
                xfrma::ALG_AEAD,
                &encode_algo_aead(&aead.name, &aead.key, aead.icv_len)?,
            );
        }
        if let Some(encap) = self.encap {
            req.append_attr(xfrma::ENCAP, encap.to_raw().as_bytes());
        }
        if let Some(mark) = self.mark {
            req.append_attr(xfrma::MARK, mark.to_raw().as_bytes());
        }
        if self.esn {
            req.append_attr(xfrma::REPLAY_ESN_VAL, &encode_replay_esn(self.replay_window));
        }
        Ok(())
    }

    /// Identify the state for get and delete.
    fn write_id(&self, req: &mut Request) -> Result<()> {
        let family = self.family()?;
        req.append(&XfrmUsersaId {
            daddr: XfrmAddress::from_ip(&self.dst),
            spi: self.spi.to_be(),
            family,
            proto: self.proto.number(),
            ..Default::default()
        });
        req.append_attr(xfrma::SRCADDR, XfrmAddress::from_ip(&self.src).as_bytes());
        if let Some(mark) = self.mark {
            req.append_attr(xfrma::MARK, mark.to_raw().as_bytes());
        }
        Ok(())
    }

    fn from_info(info: &XfrmUsersaInfo, attrs: &[u8]) -> Result<Self> {
        let unsupported = || {
            Error::InvalidMessage(format!("xfrm state with address family {}", info.family))
        };
        let dst = info.id.daddr.to_ip(info.family).ok_or_else(unsupported)?;
        let src = info.saddr.to_ip(info.family).ok_or_else(unsupported)?;

        let mut state = Self::new(src, dst, XfrmProto::from_u8(info.id.proto), u32::from_be(info.id.spi));
        state.mode = XfrmMode::from_u8(info.mode);
        state.reqid = info.reqid;
        state.replay_window = info.replay_window as u32;
        state.limits = XfrmLimits::from_lifetime(&info.lft);
        state.statistics = XfrmStats {
            replay_window: info.stats.replay_window,
            replay: info.stats.replay,
            failed: info.stats.integrity_failed,
            bytes: info.curlft.bytes,
            packets: info.curlft.packets,
            add_time: info.curlft.add_time,
            use_time: info.curlft.use_time,
        };

        for attr in AttrIter::new(attrs) {
            let (kind, value) = attr?;
            match kind {
                xfrma::ALG_AUTH => {
                    let algo = decode_algo(value)?;
                    state.auth = Some(XfrmAlgo::new(algo.name, algo.key));
                }
                xfrma::ALG_AUTH_TRUNC => {
                    let algo = decode_algo_with_len(value)?;
                    state.auth = Some(XfrmAlgo::auth(algo.name, algo.key, algo.extra));
                }
                xfrma::ALG_CRYPT => {
                    let algo = decode_algo(value)?;
                    state.crypt = Some(XfrmAlgo::new(algo.name, algo.key));
                }
                xfrma::ALG_AEAD => {
                    let algo = decode_algo_with_len(value)?;
                    state.aead = Some(XfrmAlgo::aead(algo.name, algo.key, algo.extra));
                }
                xfrma::ENCAP => state.encap = Some(XfrmEncap::decode(value, info.family)?),
                xfrma::MARK => state.mark = Some(XfrmMark::decode(value)?),
                xfrma::REPLAY_ESN_VAL => {
                    let esn = get::fixed::<XfrmReplayStateEsn>(value)?;
                    state.esn = true;
                    state.replay_window = esn.replay_window;
                }
                _ => {}
            }
        }
        Ok(state)
    }

    /// Decode an `XFRM_MSG_NEWSA` payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (info, attrs) = split_header::<XfrmUsersaInfo>(payload)?;
        Self::from_info(&info, attrs)
    }
}

/// Notification that a state reached a lifetime limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XfrmExpire {
    pub state: XfrmState,
    /// Hard expiry; the kernel has deleted the state.
    pub hard: bool,
}

impl XfrmExpire {
    /// Decode an `XFRM_MSG_EXPIRE` payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (expire, attrs) = split_header::<XfrmUserExpire>(payload)?;
        Ok(Self {
            state: XfrmState::from_info(&expire.state, attrs)?,
            hard: expire.hard != 0,
        })
    }
}

/// Direction a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PolicyDir {
    In,
    #[default]
    Out,
    Fwd,
    Other(u8),
}

impl PolicyDir {
    pub fn from_u8(val: u8) -> Self {
        match val {
            policy_dir::IN => Self::In,
            policy_dir::OUT => Self::Out,
            policy_dir::FWD => Self::Fwd,
            other => Self::Other(other),
        }
    }

    pub fn number(&self) -> u8 {
        match self {
            Self::In => policy_dir::IN,
            Self::Out => policy_dir::OUT,
            Self::Fwd => policy_dir::FWD,
            Self::Other(n) => *n,
        }
    }
}

impl fmt::Display for PolicyDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::In => f.write_str("dir in"),
            Self::Out => f.write_str("dir out"),
            Self::Fwd => f.write_str("dir fwd"),
            Self::Other(n) => write!(f, "socket {n}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PolicyAction {
    #[default]
    Allow,
    Block,
}

/// A transform a policy requires, matched against states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XfrmPolicyTmpl {
    pub dst: Option<IpAddr>,
    pub src: Option<IpAddr>,
    pub proto: XfrmProto,
    pub mode: XfrmMode,
    pub spi: u32,
    pub reqid: u32,
}

impl XfrmPolicyTmpl {
    pub fn new(proto: XfrmProto, mode: XfrmMode) -> Self {
        Self {
            dst: None,
            src: None,
            proto,
            mode,
            spi: 0,
            reqid: 0,
        }
    }

    pub fn endpoints(mut self, src: IpAddr, dst: IpAddr) -> Self {
        self.src = Some(src);
        self.dst = Some(dst);
        self
    }

    pub fn reqid(mut self, reqid: u32) -> Self {
        self.reqid = reqid;
        self
    }

    fn to_raw(self) -> XfrmUserTmpl {
        let family = self.dst.or(self.src).map(|ip| ip_family(&ip) as u16).unwrap_or(0);
        XfrmUserTmpl {
            id: XfrmId {
                daddr: self.dst.as_ref().map(XfrmAddress::from_ip).unwrap_or_default(),
                spi: self.spi.to_be(),
                proto: self.proto.number(),
                ..Default::default()
            },
            family,
            saddr: self.src.as_ref().map(XfrmAddress::from_ip).unwrap_or_default(),
            reqid: self.reqid,
            mode: self.mode.number(),
            aalgos: u32::MAX,
            ealgos: u32::MAX,
            calgos: u32::MAX,
            ..Default::default()
        }
    }

    fn from_raw(raw: &XfrmUserTmpl) -> Self {
        Self {
            dst: raw.id.daddr.to_ip(raw.family),
            src: raw.saddr.to_ip(raw.family),
            proto: XfrmProto::from_u8(raw.id.proto),
            mode: XfrmMode::from_u8(raw.mode),
            spi: u32::from_be(raw.id.spi),
            reqid: raw.reqid,
        }
    }
}

/// An IPsec security policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XfrmPolicy {
    pub dst: Option<IpNet>,
    pub src: Option<IpNet>,
    /// Upper layer protocol (e.g. `IPPROTO_TCP`); 0 matches any.
    pub proto: u8,
    pub dst_port: u16,
    pub src_port: u16,
    pub dir: PolicyDir,
    pub action: PolicyAction,
    pub priority: u32,
    /// Kernel-assigned index; identifies the policy when non-zero.
    pub index: u32,
    pub mark: Option<XfrmMark>,
    pub templates: Vec<XfrmPolicyTmpl>,
}

impl XfrmPolicy {
    pub fn new(src: IpNet, dst: IpNet, dir: PolicyDir) -> Self {
        Self {
            src: Some(src),
            dst: Some(dst),
            dir,
            ..Default::default()
        }
    }

    pub fn template(mut self, tmpl: XfrmPolicyTmpl) -> Self {
        self.templates.push(tmpl);
        self
    }

    pub fn ports(mut self, proto: u8, src_port: u16, dst_port: u16) -> Self {
        self.proto = proto;
        self.src_port = src_port;
        self.dst_port = dst_port;
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn mark(mut self, mark: XfrmMark) -> Self {
        self.mark = Some(mark);
        self
    }

    fn selector(&self) -> Result<XfrmSelector> {
        if let (Some(src), Some(dst)) = (&self.src, &self.dst)
            && src.family() != dst.family()
        {
            return Err(Error::InvalidRequest(format!(
                "policy selectors {src} and {dst} differ in family"
            )));
        }
        let mut sel = XfrmSelector {
            family: libc::AF_INET as u16,
            proto: self.proto,
            dport: self.dst_port.to_be(),
            sport: self.src_port.to_be(),
            ..Default::default()
        };
        if let Some(dst) = &self.dst {
            sel.family = dst.family() as u16;
            sel.daddr = XfrmAddress::from_ip(&dst.addr());
            sel.prefixlen_d = dst.prefix_len();
        }
        if let Some(src) = &self.src {
            sel.family = src.family() as u16;
            sel.saddr = XfrmAddress::from_ip(&src.addr());
            sel.prefixlen_s = src.prefix_len();
        }
        if self.dst_port != 0 {
            sel.dport_mask = u16::MAX;
        }
        if self.src_port != 0 {
            sel.sport_mask = u16::MAX;
        }
        Ok(sel)
    }

    fn write_request(&self, req: &mut Request) -> Result<()> {
        req.append(&XfrmUserpolicyInfo {
            sel: self.selector()?,
            lft: XfrmLifetimeCfg::infinite(),
            priority: self.priority,
            index: self.index,
            dir: self.dir.number(),
            action: match self.action {
                PolicyAction::Allow => policy_action::ALLOW,
                PolicyAction::Block => policy_action::BLOCK,
            },
            ..Default::default()
        });
        if !self.templates.is_empty() {
            let mut tmpls = Vec::with_capacity(self.templates.len() * XfrmUserTmpl::SIZE);
            for tmpl in &self.templates {
                tmpls.extend_from_slice(tmpl.to_raw().as_bytes());
            }
            req.append_attr(xfrma::TMPL, &tmpls);
        }
        if let Some(mark) = self.mark {
            req.append_attr(xfrma::MARK, mark.to_raw().as_bytes());
        }
        Ok(())
    }

    fn write_id(&self, req: &mut Request) -> Result<()> {
        req.append(&XfrmUserpolicyId {
            sel: self.selector()?,
            index: self.index,
            dir: self.dir.number(),
            ..Default::default()
        });
        if let Some(mark) = self.mark {
            req.append_attr(xfrma::MARK, mark.to_raw().as_bytes());
        }
        Ok(())
    }

    /// Decode an `XFRM_MSG_NEWPOLICY` payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (info, attrs) = split_header::<XfrmUserpolicyInfo>(payload)?;
        let sel = &info.sel;
        let net = |addr: &XfrmAddress, len: u8| {
            addr.to_ip(sel.family)
                .map(|ip| IpNet::new(ip, len))
                .transpose()
        };
        let mut policy = Self {
            dst: net(&sel.daddr, sel.prefixlen_d)?,
            src: net(&sel.saddr, sel.prefixlen_s)?,
            proto: sel.proto,
            dst_port: u16::from_be(sel.dport),
            src_port: u16::from_be(sel.sport),
            dir: PolicyDir::from_u8(info.dir),
            action: if info.action == policy_action::BLOCK {
                PolicyAction::Block
            } else {
                PolicyAction::Allow
            },
            priority: info.priority,
            index: info.index,
            ..Default::default()
        };
        for attr in AttrIter::new(attrs) {
            let (kind, value) = attr?;
            match kind {
                xfrma::TMPL => {
                    if value.len() % XfrmUserTmpl::SIZE != 0 {
                        return Err(Error::InvalidAttribute(format!(
                            "template list of {} bytes",
                            value.len()
                        )));
                    }
                    for chunk in value.chunks_exact(XfrmUserTmpl::SIZE) {
                        let raw = get::fixed::<XfrmUserTmpl>(chunk)?;
                        policy.templates.push(XfrmPolicyTmpl::from_raw(&raw));
                    }
                }
                xfrma::MARK => policy.mark = Some(XfrmMark::decode(value)?),
                _ => {}
            }
        }
        Ok(policy)
    }

    fn family(&self) -> u8 {
        self.dst
            .or(self.src)
            .map(|net| net.family())
            .unwrap_or(libc::AF_INET as u8)
    }
}

fn single<T>(payloads: Vec<Vec<u8>>, what: &str, decode: fn(&[u8]) -> Result<T>) -> Result<T> {
    match payloads.first() {
        Some(payload) => decode(payload),
        None => Err(Error::InvalidMessage(format!("empty {what} reply"))),
    }
}

impl Connection {
    /// Add a state; fails if one with the same id exists.
    pub async fn xfrm_state_add(&self, state: &XfrmState) -> Result<()> {
        self.xfrm_state_write(xfrm_msg::NEWSA, state, "adding").await
    }

    /// Change an existing state.
    pub async fn xfrm_state_update(&self, state: &XfrmState) -> Result<()> {
        self.xfrm_state_write(xfrm_msg::UPDSA, state, "updating").await
    }

    async fn xfrm_state_write(&self, msg_type: u16, state: &XfrmState, op: &str) -> Result<()> {
        let mut req = ack_request(msg_type);
        state.write_request(&mut req)?;
        self.request_ack(req)
            .await
            .map_err(|e| e.with_context(format!("{op} xfrm state spi {:#x}", state.spi)))
    }

    /// Delete the state matching `state`'s destination, SPI, protocol, source and mark.
    pub async fn xfrm_state_del(&self, state: &XfrmState) -> Result<()> {
        let mut req = ack_request(xfrm_msg::DELSA);
        state.write_id(&mut req)?;
        self.request_ack(req)
            .await
            .map_err(|e| e.with_context(format!("deleting xfrm state spi {:#x}", state.spi)))
    }

    /// Fetch the kernel's copy of a state, statistics included.
    pub async fn xfrm_state_get(&self, state: &XfrmState) -> Result<XfrmState> {
        let mut req = Request::new(xfrm_msg::GETSA, 0);
        state.write_id(&mut req)?;
        let payloads = self
            .execute(req, xfrm_msg::NEWSA)
            .await
            .map_err(|e| e.with_context(format!("getting xfrm state spi {:#x}", state.spi)))?;
        single(payloads, "xfrm state", XfrmState::decode)
    }

    /// List states. `family` 0 lists both IPv4 and IPv6.
    pub async fn xfrm_state_list(&self, family: u8) -> Result<Vec<XfrmState>> {
        let req = dump_request(xfrm_msg::GETSA);
        let mut out = Vec::new();
        for payload in self.dump(req, xfrm_msg::NEWSA).await? {
            let state = XfrmState::decode(&payload)?;
            if family == 0 || ip_family(&state.dst) == family {
                out.push(state);
            }
        }
        Ok(out)
    }

    /// Delete every state of `proto`, or every state when `None`.
    pub async fn xfrm_state_flush(&self, proto: Option<XfrmProto>) -> Result<()> {
        let mut req = ack_request(xfrm_msg::FLUSHSA);
        req.append(&XfrmUsersaFlush {
            proto: proto.map_or(0, |p| p.number()),
        });
        self.request_ack(req)
            .await
            .map_err(|e| e.with_context("flushing xfrm states"))
    }

    pub async fn xfrm_policy_add(&self, policy: &XfrmPolicy) -> Result<()> {
        self.xfrm_policy_write(xfrm_msg::NEWPOLICY, policy, "adding").await
    }

    pub async fn xfrm_policy_update(&self, policy: &XfrmPolicy) -> Result<()> {
        self.xfrm_policy_write(xfrm_msg::UPDPOLICY, policy, "updating").await
    }

    async fn xfrm_policy_write(&self, msg_type: u16, policy: &XfrmPolicy, op: &str) -> Result<()> {
        let mut req = ack_request(msg_type);
        policy.write_request(&mut req)?;
        self.request_ack(req)
            .await
            .map_err(|e| e.with_context(format!("{op} xfrm policy {}", policy.dir)))
    }

    /// Delete a policy by index, or by selector and direction when the
    /// index is zero.
    pub async fn xfrm_policy_del(&self, policy: &XfrmPolicy) -> Result<()> {
        let mut req = ack_request(xfrm_msg::DELPOLICY);
        policy.write_id(&mut req)?;
        self.request_ack(req)
            .await
            .map_err(|e| e.with_context(format!("deleting xfrm policy {}", policy.dir)))
    }

    pub async fn xfrm_policy_get(&self, policy: &XfrmPolicy) -> Result<XfrmPolicy> {
        let mut req = Request::new(xfrm_msg::GETPOLICY, 0);
        policy.write_id(&mut req)?;
        let payloads = self
            .execute(req, xfrm_msg::NEWPOLICY)
            .await
            .map_err(|e| e.with_context(format!("getting xfrm policy {}", policy.dir)))?;
        single(payloads, "xfrm policy", XfrmPolicy::decode)
    }

    /// List policies. `family` 0 lists both IPv4 and IPv6.
    pub async fn xfrm_policy_list(&self, family: u8) -> Result<Vec<XfrmPolicy>> {
        let req = dump_request(xfrm_msg::GETPOLICY);
        let mut out = Vec::new();
        for payload in self.dump(req, xfrm_msg::NEWPOLICY).await? {
            let policy = XfrmPolicy::decode(&payload)?;
            if family == 0 || policy.family() == family {
                out.push(policy);
            }
        }
        Ok(out)
    }

    pub async fn xfrm_policy_flush(&self) -> Result<()> {
        self.request_ack(ack_request(xfrm_msg::FLUSHPOLICY))
            .await
            .map_err(|e| e.with_context("flushing xfrm policies"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::attr::RtAttr;
    use crate::netlink::message::MessageIter;

    fn payload_of(req: Request) -> Vec<u8> {
        let bytes = req.serialize(0).unwrap();
        let (_, payload) = MessageIter::new(&bytes).next().unwrap().unwrap();
        payload.to_vec()
    }

    fn sample_state() -> XfrmState {
        XfrmState::new(
            "127.0.0.1".parse().unwrap(),
            "127.0.0.2".parse().unwrap(),
            XfrmProto::Esp,
            0x00ab_cdef,
        )
        .mode(XfrmMode::Tunnel)
        .reqid(7)
        .replay_window(32)
        .auth(XfrmAlgo::auth("hmac(sha256)", vec![0x11; 32], 128))
        .crypt(XfrmAlgo::new("cbc(aes)", vec![0x22; 16]))
        .mark(XfrmMark::new(0x1234, 0xffff))
    }

    #[test]
    fn test_state_roundtrip() {
        let state = sample_state().limits(XfrmLimits {
            byte_hard: 1 << 20,
            time_soft: 60,
            ..Default::default()
        });
        let mut req = ack_request(xfrm_msg::NEWSA);
        state.write_request(&mut req).unwrap();
        let payload = payload_of(req);

        let (info, _) = split_header::<XfrmUsersaInfo>(&payload).unwrap();
        assert_eq!(info.id.spi, 0x00ab_cdefu32.to_be());
        assert_eq!(info.lft.soft_byte_limit, XFRM_INF);
        assert_eq!(info.lft.hard_byte_limit, 1 << 20);
        assert_eq!(info.family, libc::AF_INET as u16);
        assert_eq!(info.replay_window, 32);

        assert_eq!(XfrmState::decode(&payload).unwrap(), state);
    }

    #[test]
    fn test_esn_state() {
        let state = sample_state().replay_window(1024).esn();
        let mut req = ack_request(xfrm_msg::NEWSA);
        state.write_request(&mut req).unwrap();
        let payload = payload_of(req);

        let (info, _) = split_header::<XfrmUsersaInfo>(&payload).unwrap();
        assert_eq!(info.flags & xfrm_state_flags::ESN, xfrm_state_flags::ESN);
        assert_eq!(info.replay_window, 0);

        let decoded = XfrmState::decode(&payload).unwrap();
        assert!(decoded.esn);
        assert_eq!(decoded.replay_window, 1024);
    }

    #[test]
    fn test_invalid_states_rejected() {
        let mut req = ack_request(xfrm_msg::NEWSA);
        assert!(sample_state().esn().replay_window(0).write_request(&mut req).is_err());
        assert!(sample_state().replay_window(256).write_request(&mut req).is_err());

        let mixed = XfrmState::new(
            "10.0.0.1".parse().unwrap(),
            "2001:db8::1".parse().unwrap(),
            XfrmProto::Esp,
            1,
        );
        assert!(mixed.write_request(&mut req).is_err());
    }

    #[test]
    fn test_aead_and_encap_roundtrip() {
        let state = XfrmState::new(
            "2001:db8::1".parse().unwrap(),
            "2001:db8::2".parse().unwrap(),
            XfrmProto::Esp,
            9,
        )
        .aead(XfrmAlgo::aead("rfc4106(gcm(aes))", vec![0x33; 20], 128))
        .encap(XfrmEncap {
            encap_type: EncapType::EspInUdp,
            src_port: 4500,
            dst_port: 4500,
            original_address: None,
        });
        let mut req = ack_request(xfrm_msg::NEWSA);
        state.write_request(&mut req).unwrap();
        let payload = payload_of(req);

        let (_, attrs) = split_header::<XfrmUsersaInfo>(&payload).unwrap();
        let tree = RtAttr::parse_tree(attrs).unwrap();
        let encap = tree.iter().find(|a| a.kind() == xfrma::ENCAP).unwrap();
        assert_eq!(&encap.value[2..4], &4500u16.to_be_bytes());

        assert_eq!(XfrmState::decode(&payload).unwrap(), state);
    }

    #[test]
    fn test_state_id_request() {
        let state = sample_state();
        let mut req = ack_request(xfrm_msg::DELSA);
        state.write_id(&mut req).unwrap();
        let payload = payload_of(req);
        let (id, attrs) = split_header::<XfrmUsersaId>(&payload).unwrap();
        assert_eq!(id.proto, ipsec_proto::ESP);
        assert_eq!(u32::from_be(id.spi), 0x00ab_cdef);

        let tree = RtAttr::parse_tree(attrs).unwrap();
        assert_eq!(tree[0].kind(), xfrma::SRCADDR);
        assert_eq!(&tree[0].value[..4], &[127, 0, 0, 1]);
        assert_eq!(tree[1].kind(), xfrma::MARK);
    }

    #[test]
    fn test_expire_decode() {
        let state = sample_state();
        let mut req = ack_request(xfrm_msg::NEWSA);
        state.write_request(&mut req).unwrap();
        let payload = payload_of(req);
        let (info, attrs) = split_header::<XfrmUsersaInfo>(&payload).unwrap();

        let expire = XfrmUserExpire {
            state: info,
            hard: 1,
            ..Default::default()
        };
        let mut buf = expire.as_bytes().to_vec();
        buf.extend_from_slice(attrs);

        let decoded = XfrmExpire::decode(&buf).unwrap();
        assert!(decoded.hard);
        assert_eq!(decoded.state, state);
    }

    #[test]
    fn test_policy_roundtrip() {
        let policy = XfrmPolicy::new(
            "10.0.0.0/24".parse().unwrap(),
            "10.0.1.0/24".parse().unwrap(),
            PolicyDir::Out,
        )
        .ports(libc::IPPROTO_TCP as u8, 0, 443)
        .priority(10)
        .mark(XfrmMark::new(1, 0xff))
        .template(
            XfrmPolicyTmpl::new(XfrmProto::Esp, XfrmMode::Tunnel)
                .endpoints("127.0.0.1".parse().unwrap(), "127.0.0.2".parse().unwrap())
                .reqid(7),
        );

        let mut req = ack_request(xfrm_msg::NEWPOLICY);
        policy.write_request(&mut req).unwrap();
        let payload = payload_of(req);

        let (info, _) = split_header::<XfrmUserpolicyInfo>(&payload).unwrap();
        assert_eq!(info.sel.dport, 443u16.to_be());
        assert_eq!(info.sel.dport_mask, u16::MAX);
        assert_eq!(info.sel.sport_mask, 0);
        assert_eq!(info.lft.hard_byte_limit, XFRM_INF);

        assert_eq!(XfrmPolicy::decode(&payload).unwrap(), policy);
    }

    #[test]
    fn test_policy_template_algos_wildcard() {
        let raw = XfrmPolicyTmpl::new(XfrmProto::Ah, XfrmMode::Transport).to_raw();
        assert_eq!(raw.aalgos, u32::MAX);
        assert_eq!(raw.ealgos, u32::MAX);
        assert_eq!(raw.calgos, u32::MAX);
        assert_eq!(raw.family, 0);
    }

    #[test]
    fn test_policy_selector_families() {
        let empty = XfrmPolicy::default();
        assert_eq!(empty.selector().unwrap().family, libc::AF_INET as u16);

        let mixed = XfrmPolicy::new(
            "10.0.0.0/8".parse().unwrap(),
            "2001:db8::/32".parse().unwrap(),
            PolicyDir::In,
        );
        assert!(mixed.selector().is_err());
    }

    #[test]
    fn test_policy_truncated_templates() {
        let policy = XfrmPolicy::default();
        let mut req = ack_request(xfrm_msg::NEWPOLICY);
        policy.write_request(&mut req).unwrap();
        req.append_attr(xfrma::TMPL, &[0u8; 10]);
        assert!(XfrmPolicy::decode(&payload_of(req)).is_err());
    }

    #[test]
    fn test_enum_strings() {
        assert_eq!(XfrmProto::from_u8(50), XfrmProto::Esp);
        assert_eq!(XfrmProto::IpsecAny.to_string(), "ipsec-any");
        assert_eq!(XfrmProto::Other(7).to_string(), "7");
        assert_eq!(XfrmMode::from_u8(2).to_string(), "ro");
        assert_eq!(PolicyDir::from_u8(2), PolicyDir::Fwd);
        assert_eq!(EncapType::from_u16(1).to_string(), "espinudp-non-ike");
    }
}
