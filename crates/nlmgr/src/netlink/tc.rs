//! Traffic control: queueing disciplines, classes and filters.
//!
//! Each object family is a closed enum dispatched on the kernel's
//! `TCA_KIND` string. Kinds without a typed representation decode into the
//! `Generic` variant, which carries only the kind and common attributes.
//!
//! # Example
//!
//! ```ignore
//! use nlmgr::netlink::tc::*;
//!
//! let root = QdiscAttrs::new(ifindex, make_handle(1, 0), HANDLE_ROOT);
//! conn.qdisc_add(&Qdisc::Htb(HtbQdisc::new(root))).await?;
//!
//! let class = ClassAttrs::new(ifindex, make_handle(1, 1), make_handle(1, 0));
//! conn.class_add(&Class::Htb(HtbClass::new(class, 1_250_000))).await?;
//! ```

use std::fmt;
use std::str::FromStr;

use zerocopy::{FromBytes, IntoBytes};

use super::attr::{AttrIter, RtAttr, cstring, get};
use super::builder::Request;
use super::connection::{Connection, ack_request, create_request, dump_request, replace_request};
use super::error::{Error, Result};
use super::message::{NLM_F_ACK, NLM_F_CREATE, NlMsgType};
use super::parse::{parse_string_from_bytes, split_header};
use super::types::tc::{
    TcHtbGlob, TcHtbOpt, TcMsg, TcPrioQopt, TcRateSpec, TcTbfQopt, TcU32Key, TcU32SelHdr, fq,
    fq_codel, fw, htb, linklayer, tbf, tc_handle, tca, u32_attr,
};

/// No handle; the kernel picks one.
pub const HANDLE_NONE: u32 = tc_handle::UNSPEC;
pub const HANDLE_ROOT: u32 = tc_handle::ROOT;
pub const HANDLE_INGRESS: u32 = tc_handle::INGRESS;
/// Parent of a clsact qdisc; shares its value with the ingress parent.
pub const HANDLE_CLSACT: u32 = tc_handle::CLSACT;
pub const HANDLE_MIN_INGRESS: u32 = make_handle(0xffff, tc_handle::MIN_INGRESS);
pub const HANDLE_MIN_EGRESS: u32 = make_handle(0xffff, tc_handle::MIN_EGRESS);

/// Compose a handle from its 16-bit halves.
pub const fn make_handle(major: u16, minor: u16) -> u32 {
    (major as u32) << 16 | minor as u32
}

/// Split a handle into major and minor.
pub const fn major_minor(handle: u32) -> (u16, u16) {
    ((handle >> 16) as u16, handle as u16)
}

/// A handle formatted the way `tc` prints it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Handle(pub u32);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            HANDLE_NONE => f.write_str("none"),
            HANDLE_ROOT => f.write_str("root"),
            HANDLE_INGRESS => f.write_str("ingress"),
            handle => {
                let (major, minor) = major_minor(handle);
                write!(f, "{major:x}:{minor:x}")
            }
        }
    }
}

impl FromStr for Handle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidRequest(format!("invalid tc handle: {s}"));
        let hex = |part: &str| -> Result<u16> {
            if part.is_empty() {
                Ok(0)
            } else {
                u16::from_str_radix(part, 16).map_err(|_| invalid())
            }
        };
        match s {
            "none" => Ok(Self(HANDLE_NONE)),
            "root" => Ok(Self(HANDLE_ROOT)),
            "ingress" | "clsact" => Ok(Self(HANDLE_INGRESS)),
            _ => {
                let (major, minor) = s.split_once(':').unwrap_or((s, ""));
                if major.is_empty() {
                    return Err(invalid());
                }
                Ok(Self(make_handle(hex(major)?, hex(minor)?)))
            }
        }
    }
}

impl From<Handle> for u32 {
    fn from(handle: Handle) -> u32 {
        handle.0
    }
}

/// Kernel packet scheduler clock (`/proc/net/psched`), used to express
/// buffer sizes as scheduler ticks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PschedClock {
    tick_in_usec: f64,
    hz: f64,
}

/// Microseconds per second.
const TIME_UNITS_PER_SEC: f64 = 1_000_000.0;

impl Default for PschedClock {
    /// The values reported by kernels with high resolution timers.
    fn default() -> Self {
        Self {
            tick_in_usec: 15.625,
            hz: 1_000_000_000.0,
        }
    }
}

impl PschedClock {
    /// Read the clock of the running kernel.
    pub fn from_proc() -> Result<Self> {
        Self::parse(&std::fs::read_to_string("/proc/net/psched")?)
    }

    /// Parse the four hex words of `/proc/net/psched`.
    pub fn parse(text: &str) -> Result<Self> {
        let words: Vec<u64> = text
            .split_whitespace()
            .take(4)
            .map(|w| u64::from_str_radix(w, 16))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Parse(format!("psched: {e}")))?;
        let [mut t2us, us2t, clock_res, hz] = words[..] else {
            return Err(Error::Parse("psched: expected four words".into()));
        };
        if us2t == 0 {
            return Err(Error::Parse("psched: zero tick divisor".into()));
        }
        if clock_res == 1_000_000_000 {
            t2us = us2t;
        }
        let clock_factor = clock_res as f64 / TIME_UNITS_PER_SEC;
        Ok(Self {
            tick_in_usec: t2us as f64 / us2t as f64 * clock_factor,
            hz: if clock_res == 1_000_000 { hz as f64 } else { 100.0 },
        })
    }

    /// Convert microseconds to scheduler ticks.
    pub fn tick(&self, usec: u32) -> u32 {
        (usec as f64 * self.tick_in_usec) as u32
    }

    /// Ticks needed to send `size` bytes at `rate` bytes per second.
    pub fn xmit_time(&self, rate: u64, size: u32) -> u32 {
        if rate == 0 {
            return 0;
        }
        self.tick((TIME_UNITS_PER_SEC * (size as f64 / rate as f64)) as u32)
    }

    /// Default burst for `rate`: one timer interval worth of data plus one MTU.
    pub fn default_buffer(&self, rate: u64, mtu: u32) -> u32 {
        let bytes = (rate as f64 / self.hz + mtu as f64) as u32;
        self.xmit_time(rate, bytes)
    }

    /// Fill in `spec`'s cell parameters and return the matching rate table.
    pub fn rate_table(&self, spec: &mut TcRateSpec, mtu: u32) -> [u32; 256] {
        let mtu = if mtu == 0 { 2047 } else { mtu };
        let mut cell_log = 0u32;
        while (mtu >> cell_log) > 255 {
            cell_log += 1;
        }

        let mut table = [0u32; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            let size = (((i as u32) + 1) << cell_log).max(spec.mpu as u32);
            *slot = self.xmit_time(spec.rate as u64, size);
        }
        spec.cell_align = -1;
        spec.cell_log = cell_log as u8;
        spec.linklayer = linklayer::ETHERNET & linklayer::MASK;
        table
    }
}

/// MTU assumed when sizing rate tables.
pub const RATE_TABLE_MTU: u32 = 1600;

fn rate_spec(rate: u64) -> TcRateSpec {
    TcRateSpec {
        rate: rate.min(u32::MAX as u64) as u32,
        ..Default::default()
    }
}

fn table_bytes(table: &[u32; 256]) -> Vec<u8> {
    table.as_bytes().to_vec()
}

/// Split a tc payload into header, kind and raw `TCA_OPTIONS` bytes.
fn split_tc(payload: &[u8]) -> Result<(TcMsg, String, &[u8])> {
    let (header, attrs) = split_header::<TcMsg>(payload)?;
    let mut kind = String::new();
    let mut options: &[u8] = &[];
    for attr in AttrIter::new(attrs) {
        let (attr_type, value) = attr?;
        match attr_type {
            tca::KIND => kind = parse_string_from_bytes(value),
            tca::OPTIONS => options = value,
            _ => {}
        }
    }
    Ok((header, kind, options))
}

fn write_tc(
    req: &mut Request,
    header: TcMsg,
    kind: &str,
    options: Option<RtAttr>,
) -> Result<()> {
    req.append(&header);
    req.append_attr_str(tca::KIND, kind);
    if let Some(options) = options {
        req.add_data(&options)?;
    }
    Ok(())
}

fn options_attr() -> RtAttr {
    RtAttr::new(tca::OPTIONS, Vec::new())
}

// ============================================================================
// Qdiscs
// ============================================================================

/// Attributes shared by every qdisc.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QdiscAttrs {
    pub link_index: u32,
    pub handle: u32,
    pub parent: u32,
    /// Reference count reported by the kernel.
    pub refcnt: u32,
}

impl QdiscAttrs {
    pub fn new(link_index: u32, handle: u32, parent: u32) -> Self {
        Self {
            link_index,
            handle,
            parent,
            refcnt: 0,
        }
    }

    fn header(&self) -> TcMsg {
        TcMsg::new()
            .with_ifindex(self.link_index as i32)
            .with_handle(self.handle)
            .with_parent(self.parent)
    }

    fn from_header(header: &TcMsg) -> Self {
        Self {
            link_index: header.tcm_ifindex as u32,
            handle: header.tcm_handle,
            parent: header.tcm_parent,
            refcnt: header.tcm_info,
        }
    }
}

/// Hierarchical token bucket root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtbQdisc {
    pub attrs: QdiscAttrs,
    pub version: u32,
    pub rate2quantum: u32,
    /// Minor id of the class for unclassified traffic.
    pub defcls: u32,
    pub debug: u32,
    pub direct_pkts: u32,
    pub direct_qlen: Option<u32>,
}

impl HtbQdisc {
    pub fn new(attrs: QdiscAttrs) -> Self {
        Self {
            attrs,
            version: htb::PROTO_VERSION,
            rate2quantum: 10,
            defcls: 0,
            debug: 0,
            direct_pkts: 0,
            direct_qlen: None,
        }
    }

    pub fn default_class(mut self, minor: u32) -> Self {
        self.defcls = minor;
        self
    }

    pub fn rate2quantum(mut self, value: u32) -> Self {
        self.rate2quantum = value;
        self
    }

    fn options(&self) -> RtAttr {
        let glob = TcHtbGlob {
            version: self.version,
            rate2quantum: self.rate2quantum,
            defcls: self.defcls,
            debug: self.debug,
            direct_pkts: self.direct_pkts,
        };
        let mut opts = options_attr();
        opts.add_value(htb::INIT, glob.as_bytes());
        if let Some(qlen) = self.direct_qlen {
            opts.add_value(htb::DIRECT_QLEN, qlen.to_ne_bytes());
        }
        opts
    }

    fn decode(attrs: QdiscAttrs, options: &[u8]) -> Result<Self> {
        let mut qdisc = Self::new(attrs);
        for attr in AttrIter::new(options) {
            let (kind, value) = attr?;
            match kind {
                htb::INIT => {
                    let glob = get::fixed::<TcHtbGlob>(value)?;
                    qdisc.version = glob.version;
                    qdisc.rate2quantum = glob.rate2quantum;
                    qdisc.defcls = glob.defcls;
                    qdisc.debug = glob.debug;
                    qdisc.direct_pkts = glob.direct_pkts;
                }
                htb::DIRECT_QLEN => qdisc.direct_qlen = Some(get::u32_ne(value)?),
                _ => {}
            }
        }
        Ok(qdisc)
    }
}

/// Token bucket filter.
///
/// `rate` and `peakrate` are bytes per second; `buffer` is in scheduler
/// ticks, as the kernel stores it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TbfQdisc {
    pub attrs: QdiscAttrs,
    pub rate: u64,
    pub peakrate: u64,
    pub limit: u32,
    pub buffer: u32,
    pub minburst: u32,
}

impl TbfQdisc {
    pub fn new(attrs: QdiscAttrs, rate: u64, limit: u32, buffer: u32) -> Self {
        Self {
            attrs,
            rate,
            limit,
            buffer,
            ..Default::default()
        }
    }

    fn options(&self) -> RtAttr {
        let qopt = TcTbfQopt {
            rate: rate_spec(self.rate),
            peakrate: rate_spec(self.peakrate),
            limit: self.limit,
            buffer: self.buffer,
            mtu: 0,
        };
        let mut opts = options_attr();
        opts.add_value(tbf::PARMS, qopt.as_bytes());
        if self.rate > u32::MAX as u64 {
            opts.add_value(tbf::RATE64, self.rate.to_ne_bytes());
        }
        if self.peakrate > u32::MAX as u64 {
            opts.add_value(tbf::PRATE64, self.peakrate.to_ne_bytes());
        }
        if self.peakrate > 0 {
            opts.add_value(tbf::PBURST, self.minburst.to_ne_bytes());
        }
        opts
    }

    fn decode(attrs: QdiscAttrs, options: &[u8]) -> Result<Self> {
        let mut qdisc = Self {
            attrs,
            ..Default::default()
        };
        for attr in AttrIter::new(options) {
            let (kind, value) = attr?;
            match kind {
                tbf::PARMS => {
                    let qopt = get::fixed::<TcTbfQopt>(value)?;
                    qdisc.rate = qopt.rate.rate as u64;
                    qdisc.peakrate = qopt.peakrate.rate as u64;
                    qdisc.limit = qopt.limit;
                    qdisc.buffer = qopt.buffer;
                }
                tbf::RATE64 => qdisc.rate = get::u64_ne(value)?,
                tbf::PRATE64 => qdisc.peakrate = get::u64_ne(value)?,
                tbf::PBURST => qdisc.minburst = get::u32_ne(value)?,
                _ => {}
            }
        }
        Ok(qdisc)
    }
}

/// Priority map installed by `tc qdisc add ... prio`.
pub const PRIOMAP_DEFAULT: [u8; 16] = [1, 2, 2, 2, 1, 2, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1];

/// Strict priority bands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrioQdisc {
    pub attrs: QdiscAttrs,
    pub bands: u8,
    pub priomap: [u8; 16],
}

impl PrioQdisc {
    pub fn new(attrs: QdiscAttrs) -> Self {
        Self {
            attrs,
            bands: 3,
            priomap: PRIOMAP_DEFAULT,
        }
    }

    fn options(&self) -> RtAttr {
        let qopt = TcPrioQopt {
            bands: self.bands as i32,
            priomap: self.priomap,
        };
        RtAttr::new(tca::OPTIONS, qopt.as_bytes())
    }

    fn decode(attrs: QdiscAttrs, options: &[u8]) -> Result<Self> {
        let qopt = get::fixed::<TcPrioQopt>(options)?;
        Ok(Self {
            attrs,
            bands: qopt.bands as u8,
            priomap: qopt.priomap,
        })
    }
}

/// Fair queue with pacing. Unset fields keep the kernel defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FqQdisc {
    pub attrs: QdiscAttrs,
    pub packet_limit: Option<u32>,
    pub flow_packet_limit: Option<u32>,
    pub quantum: Option<u32>,
    pub initial_quantum: Option<u32>,
    pub pacing: Option<bool>,
    pub flow_default_rate: Option<u32>,
    pub flow_max_rate: Option<u32>,
    pub buckets_log: Option<u32>,
    pub flow_refill_delay: Option<u32>,
    pub low_rate_threshold: Option<u32>,
}

impl FqQdisc {
    pub fn new(attrs: QdiscAttrs) -> Self {
        Self {
            attrs,
            ..Default::default()
        }
    }

    fn fields(&self) -> [(u16, Option<u32>); 10] {
        [
            (fq::PLIMIT, self.packet_limit),
            (fq::FLOW_PLIMIT, self.flow_packet_limit),
            (fq::QUANTUM, self.quantum),
            (fq::INITIAL_QUANTUM, self.initial_quantum),
            (fq::RATE_ENABLE, self.pacing.map(u32::from)),
            (fq::FLOW_DEFAULT_RATE, self.flow_default_rate),
            (fq::FLOW_MAX_RATE, self.flow_max_rate),
            (fq::BUCKETS_LOG, self.buckets_log),
            (fq::FLOW_REFILL_DELAY, self.flow_refill_delay),
            (fq::LOW_RATE_THRESHOLD, self.low_rate_threshold),
        ]
    }

    fn options(&self) -> RtAttr {
        let mut opts = options_attr();
        for (kind, value) in self.fields() {
            if let Some(value) = value {
                opts.add_value(kind, value.to_ne_bytes());
            }
        }
        opts
    }

    fn decode(attrs: QdiscAttrs, options: &[u8]) -> Result<Self> {
        let mut qdisc = Self::new(attrs);
        for attr in AttrIter::new(options) {
            let (kind, value) = attr?;
            let slot = match kind {
                fq::PLIMIT => &mut qdisc.packet_limit,
                fq::FLOW_PLIMIT => &mut qdisc.flow_packet_limit,
                fq::QUANTUM => &mut qdisc.quantum,
                fq::INITIAL_QUANTUM => &mut qdisc.initial_quantum,
                fq::RATE_ENABLE => {
                    qdisc.pacing = Some(get::u32_ne(value)? != 0);
                    continue;
                }
                fq::FLOW_DEFAULT_RATE => &mut qdisc.flow_default_rate,
                fq::FLOW_MAX_RATE => &mut qdisc.flow_max_rate,
                fq::BUCKETS_LOG => &mut qdisc.buckets_log,
                fq::FLOW_REFILL_DELAY => &mut qdisc.flow_refill_delay,
                fq::LOW_RATE_THRESHOLD => &mut qdisc.low_rate_threshold,
                _ => continue,
            };
            *slot = Some(get::u32_ne(value)?);
        }
        Ok(qdisc)
    }
}

/// Fair queue controlled delay. Times are in microseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FqCodelQdisc {
    pub attrs: QdiscAttrs,
    pub target: Option<u32>,
    pub limit: Option<u32>,
    pub interval: Option<u32>,
    pub ecn: Option<bool>,
    pub flows: Option<u32>,
    pub quantum: Option<u32>,
    pub ce_threshold: Option<u32>,
    pub drop_batch_size: Option<u32>,
    pub memory_limit: Option<u32>,
}

impl FqCodelQdisc {
    pub fn new(attrs: QdiscAttrs) -> Self {
        Self {
            attrs,
            ..Default::default()
        }
    }

    fn options(&self) -> RtAttr {
        let mut opts = options_attr();
        for (kind, value) in [
            (fq_codel::TARGET, self.target),
            (fq_codel::LIMIT, self.limit),
            (fq_codel::INTERVAL, self.interval),
            (fq_codel::ECN, self.ecn.map(u32::from)),
            (fq_codel::FLOWS, self.flows),
            (fq_codel::QUANTUM, self.quantum),
            (fq_codel::CE_THRESHOLD, self.ce_threshold),
            (fq_codel::DROP_BATCH_SIZE, self.drop_batch_size),
            (fq_codel::MEMORY_LIMIT, self.memory_limit),
        ] {
            if let Some(value) = value {
                opts.add_value(kind, value.to_ne_bytes());
            }
        }
        opts
    }

    fn decode(attrs: QdiscAttrs, options: &[u8]) -> Result<Self> {
        let mut qdisc = Self::new(attrs);
        for attr in AttrIter::new(options) {
            let (kind, value) = attr?;
            let slot = match kind {
                fq_codel::TARGET => &mut qdisc.target,
                fq_codel::LIMIT => &mut qdisc.limit,
                fq_codel::INTERVAL => &mut qdisc.interval,
                fq_codel::ECN => {
                    qdisc.ecn = Some(get::u32_ne(value)? != 0);
                    continue;
                }
                fq_codel::FLOWS => &mut qdisc.flows,
                fq_codel::QUANTUM => &mut qdisc.quantum,
                fq_codel::CE_THRESHOLD => &mut qdisc.ce_threshold,
                fq_codel::DROP_BATCH_SIZE => &mut qdisc.drop_batch_size,
                fq_codel::MEMORY_LIMIT => &mut qdisc.memory_limit,
                _ => continue,
            };
            *slot = Some(get::u32_ne(value)?);
        }
        Ok(qdisc)
    }
}

/// Ingress hook qdisc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngressQdisc {
    pub attrs: QdiscAttrs,
}

impl IngressQdisc {
    /// The ingress qdisc of `link_index` (`ffff:` under the ingress parent).
    pub fn new(link_index: u32) -> Self {
        Self {
            attrs: QdiscAttrs::new(link_index, make_handle(0xffff, 0), HANDLE_INGRESS),
        }
    }
}

/// A qdisc of any other kind (`clsact`, `noqueue`, `pfifo_fast`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericQdisc {
    pub attrs: QdiscAttrs,
    pub kind: String,
}

/// A queueing discipline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Qdisc {
    Htb(HtbQdisc),
    Tbf(TbfQdisc),
    Prio(PrioQdisc),
    Fq(FqQdisc),
    FqCodel(FqCodelQdisc),
    Ingress(IngressQdisc),
    Generic(GenericQdisc),
}

impl Qdisc {
    pub fn attrs(&self) -> &QdiscAttrs {
        match self {
            Self::Htb(q) => &q.attrs,
            Self::Tbf(q) => &q.attrs,
            Self::Prio(q) => &q.attrs,
            Self::Fq(q) => &q.attrs,
            Self::FqCodel(q) => &q.attrs,
            Self::Ingress(q) => &q.attrs,
            Self::Generic(q) => &q.attrs,
        }
    }

    /// The `TCA_KIND` string.
    pub fn kind(&self) -> &str {
        match self {
            Self::Htb(_) => "htb",
            Self::Tbf(_) => "tbf",
            Self::Prio(_) => "prio",
            Self::Fq(_) => "fq",
            Self::FqCodel(_) => "fq_codel",
            Self::Ingress(_) => "ingress",
            Self::Generic(q) => &q.kind,
        }
    }

    fn options(&self) -> Option<RtAttr> {
        match self {
            Self::Htb(q) => Some(q.options()),
            Self::Tbf(q) => Some(q.options()),
            Self::Prio(q) => Some(q.options()),
            Self::Fq(q) => Some(q.options()),
            Self::FqCodel(q) => Some(q.options()),
            Self::Ingress(_) | Self::Generic(_) => None,
        }
    }

    fn write_request(&self, req: &mut Request, with_options: bool) -> Result<()> {
        let attrs = self.attrs();
        if let Self::Ingress(_) = self
            && attrs.parent != HANDLE_INGRESS
        {
            return Err(Error::InvalidRequest(
                "ingress qdisc must be attached to the ingress parent".into(),
            ));
        }
        if self.kind().is_empty() {
            return Err(Error::InvalidRequest("qdisc kind is empty".into()));
        }
        let options = if with_options { self.options() } else { None };
        write_tc(req, attrs.header(), self.kind(), options)
    }

    /// Decode an `RTM_NEWQDISC` payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (header, kind, options) = split_tc(payload)?;
        let attrs = QdiscAttrs::from_header(&header);
        Ok(match kind.as_str() {
            "htb" => Self::Htb(HtbQdisc::decode(attrs, options)?),
            "tbf" => Self::Tbf(TbfQdisc::decode(attrs, options)?),
            "prio" => Self::Prio(PrioQdisc::decode(attrs, options)?),
            "fq" => Self::Fq(FqQdisc::decode(attrs, options)?),
            "fq_codel" => Self::FqCodel(FqCodelQdisc::decode(attrs, options)?),
            "ingress" => Self::Ingress(IngressQdisc { attrs }),
            _ => Self::Generic(GenericQdisc { attrs, kind }),
        })
    }
}

// ============================================================================
// Classes
// ============================================================================

/// Attributes shared by every class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassAttrs {
    pub link_index: u32,
    pub handle: u32,
    pub parent: u32,
    /// Handle of the leaf qdisc, as reported by the kernel.
    pub leaf: u32,
}

impl ClassAttrs {
    pub fn new(link_index: u32, handle: u32, parent: u32) -> Self {
        Self {
            link_index,
            handle,
            parent,
            leaf: 0,
        }
    }

    fn header(&self) -> TcMsg {
        TcMsg::new()
            .with_ifindex(self.link_index as i32)
            .with_handle(self.handle)
            .with_parent(self.parent)
    }
}

/// HTB class.
///
/// `rate` and `ceil` are bytes per second. `buffer` and `cbuffer` are
/// scheduler ticks; zero asks for the default burst of the rate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HtbClass {
    pub attrs: ClassAttrs,
    pub rate: u64,
    pub ceil: u64,
    pub buffer: u32,
    pub cbuffer: u32,
    pub quantum: u32,
    pub level: u32,
    pub prio: u32,
}

impl HtbClass {
    /// A class guaranteed `rate` bytes per second, borrowing up to the same.
    pub fn new(attrs: ClassAttrs, rate: u64) -> Self {
        Self {
            attrs,
            rate,
            ceil: rate,
            ..Default::default()
        }
    }

    pub fn ceil(mut self, ceil: u64) -> Self {
        self.ceil = ceil;
        self
    }

    pub fn prio(mut self, prio: u32) -> Self {
        self.prio = prio;
        self
    }

    pub fn quantum(mut self, quantum: u32) -> Self {
        self.quantum = quantum;
        self
    }

    /// Burst sizes in bytes, converted to ticks with `clock`.
    pub fn burst(mut self, clock: &PschedClock, buffer: u32, cbuffer: u32) -> Self {
        self.buffer = clock.xmit_time(self.rate, buffer);
        self.cbuffer = clock.xmit_time(self.ceil, cbuffer);
        self
    }

    fn options(&self, clock: &PschedClock) -> Result<RtAttr> {
        if self.rate == 0 {
            return Err(Error::InvalidRequest("HTB class needs a rate".into()));
        }
        let ceil = if self.ceil == 0 { self.rate } else { self.ceil };
        let buffer = match self.buffer {
            0 => clock.default_buffer(self.rate, RATE_TABLE_MTU),
            ticks => ticks,
        };
        let cbuffer = match self.cbuffer {
            0 => clock.default_buffer(ceil, RATE_TABLE_MTU),
            ticks => ticks,
        };

        let mut opt = TcHtbOpt {
            rate: rate_spec(self.rate),
            ceil: rate_spec(ceil),
            buffer,
            cbuffer,
            quantum: self.quantum,
            level: self.level,
            prio: self.prio,
        };
        let rtab = clock.rate_table(&mut opt.rate, RATE_TABLE_MTU);
        let ctab = clock.rate_table(&mut opt.ceil, RATE_TABLE_MTU);

        let mut opts = options_attr();
        opts.add_value(htb::PARMS, opt.as_bytes());
        if self.rate > u32::MAX as u64 {
            opts.add_value(htb::RATE64, self.rate.to_ne_bytes());
        }
        if ceil > u32::MAX as u64 {
            opts.add_value(htb::CEIL64, ceil.to_ne_bytes());
        }
        opts.add_value(htb::RTAB, table_bytes(&rtab));
        opts.add_value(htb::CTAB, table_bytes(&ctab));
        Ok(opts)
    }

    fn decode(attrs: ClassAttrs, options: &[u8]) -> Result<Self> {
        let mut class = Self {
            attrs,
            ..Default::default()
        };
        for attr in AttrIter::new(options) {
            let (kind, value) = attr?;
            match kind {
                htb::PARMS => {
                    let opt = get::fixed::<TcHtbOpt>(value)?;
                    class.rate = opt.rate.rate as u64;
                    class.ceil = opt.ceil.rate as u64;
                    class.buffer = opt.buffer;
                    class.cbuffer = opt.cbuffer;
                    class.quantum = opt.quantum;
                    class.level = opt.level;
                    class.prio = opt.prio;
                }
                htb::RATE64 => class.rate = get::u64_ne(value)?,
                htb::CEIL64 => class.ceil = get::u64_ne(value)?,
                _ => {}
            }
        }
        Ok(class)
    }
}

/// A class of any other kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericClass {
    pub attrs: ClassAttrs,
    pub kind: String,
}

/// A traffic class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Class {
    Htb(HtbClass),
    Generic(GenericClass),
}

impl Class {
    pub fn attrs(&self) -> &ClassAttrs {
        match self {
            Self::Htb(c) => &c.attrs,
            Self::Generic(c) => &c.attrs,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Htb(_) => "htb",
            Self::Generic(c) => &c.kind,
        }
    }

    fn write_request(&self, req: &mut Request, clock: &PschedClock) -> Result<()> {
        let options = match self {
            Self::Htb(c) => Some(c.options(clock)?),
            Self::Generic(_) => None,
        };
        write_tc(req, self.attrs().header(), self.kind(), options)
    }

    /// Decode an `RTM_NEWTCLASS` payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (header, kind, options) = split_tc(payload)?;
        let attrs = ClassAttrs {
            link_index: header.tcm_ifindex as u32,
            handle: header.tcm_handle,
            parent: header.tcm_parent,
            leaf: header.tcm_info,
        };
        Ok(match kind.as_str() {
            "htb" => Self::Htb(HtbClass::decode(attrs, options)?),
            _ => Self::Generic(GenericClass { attrs, kind }),
        })
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Attributes shared by every filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterAttrs {
    pub link_index: u32,
    pub handle: u32,
    pub parent: u32,
    pub priority: u16,
    /// Ethertype in host byte order (e.g. `ETH_P_IP`).
    pub protocol: u16,
}

impl FilterAttrs {
    pub fn new(link_index: u32, parent: u32, priority: u16, protocol: u16) -> Self {
        Self {
            link_index,
            handle: 0,
            parent,
            priority,
            protocol,
        }
    }

    pub fn handle(mut self, handle: u32) -> Self {
        self.handle = handle;
        self
    }

    fn header(&self) -> TcMsg {
        TcMsg::new()
            .with_ifindex(self.link_index as i32)
            .with_handle(self.handle)
            .with_parent(self.parent)
            .with_info(make_handle(self.priority, self.protocol.to_be()))
    }

    fn from_header(header: &TcMsg) -> Self {
        let (priority, protocol) = major_minor(header.tcm_info);
        Self {
            link_index: header.tcm_ifindex as u32,
            handle: header.tcm_handle,
            parent: header.tcm_parent,
            priority,
            protocol: u16::from_be(protocol),
        }
    }
}

/// One u32 match: `(packet[off] & mask) == val`. Host byte order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct U32Key {
    pub mask: u32,
    pub val: u32,
    pub off: i32,
    pub offmask: i32,
}

/// u32 selector, in host byte order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct U32Sel {
    pub flags: u8,
    pub offshift: u8,
    pub offmask: u16,
    pub off: u16,
    pub offoff: i16,
    pub hoff: i16,
    pub hmask: u32,
    pub keys: Vec<U32Key>,
}

impl U32Sel {
    /// Terminal selector matching every packet.
    pub fn match_all() -> Self {
        Self {
            flags: u32_attr::SEL_TERMINAL,
            keys: vec![U32Key::default()],
            ..Default::default()
        }
    }

    /// Wire form: masks, values and hash fields in network byte order.
    fn encode(&self) -> Result<Vec<u8>> {
        let nkeys = u8::try_from(self.keys.len())
            .map_err(|_| Error::InvalidRequest("too many u32 keys".into()))?;
        let header = TcU32SelHdr {
            flags: self.flags,
            offshift: self.offshift,
            nkeys,
            pad: 0,
            offmask: self.offmask.to_be(),
            off: self.off,
            offoff: self.offoff,
            hoff: self.hoff,
            hmask: self.hmask.to_be(),
        };
        let mut buf = header.as_bytes().to_vec();
        for key in &self.keys {
            let wire = TcU32Key {
                mask: key.mask.to_be(),
                val: key.val.to_be(),
                off: key.off,
                offmask: key.offmask,
            };
            buf.extend_from_slice(wire.as_bytes());
        }
        Ok(buf)
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let (header, mut rest) = TcU32SelHdr::read_from_prefix(data).map_err(|_| {
            Error::Truncated {
                expected: TcU32SelHdr::SIZE,
                actual: data.len(),
            }
        })?;
        let mut keys = Vec::with_capacity(header.nkeys as usize);
        for _ in 0..header.nkeys {
            let (key, tail) = TcU32Key::read_from_prefix(rest).map_err(|_| Error::Truncated {
                expected: TcU32SelHdr::SIZE + TcU32Key::SIZE * header.nkeys as usize,
                actual: data.len(),
            })?;
            keys.push(U32Key {
                mask: u32::from_be(key.mask),
                val: u32::from_be(key.val),
                off: key.off,
                offmask: key.offmask,
            });
            rest = tail;
        }
        Ok(Self {
            flags: header.flags,
            offshift: header.offshift,
            offmask: u16::from_be(header.offmask),
            off: header.off,
            offoff: header.offoff,
            hoff: header.hoff,
            hmask: u32::from_be(header.hmask),
            keys,
        })
    }
}

/// Universal 32-bit key classifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct U32Filter {
    pub attrs: FilterAttrs,
    pub class_id: u32,
    /// Creates a hash table with this many buckets (power of two, at most 256).
    pub divisor: u32,
    /// Hash table the filter is inserted into.
    pub hash: u32,
    /// Hash table to continue matching in.
    pub link: u32,
    /// `None` matches every packet.
    pub sel: Option<U32Sel>,
}

impl U32Filter {
    pub fn new(attrs: FilterAttrs) -> Self {
        Self {
            attrs,
            ..Default::default()
        }
    }

    pub fn class_id(mut self, class_id: u32) -> Self {
        self.class_id = class_id;
        self
    }

    pub fn sel(mut self, sel: U32Sel) -> Self {
        self.sel = Some(sel);
        self
    }

    fn options(&self) -> Result<RtAttr> {
        if self.divisor != 0 && (!self.divisor.is_power_of_two() || self.divisor > 256) {
            return Err(Error::InvalidRequest(format!(
                "illegal u32 divisor {}",
                self.divisor
            )));
        }
        let sel = match &self.sel {
            Some(sel) => sel.encode()?,
            None => U32Sel::match_all().encode()?,
        };

        let mut opts = options_attr();
        opts.add_value(u32_attr::SEL, sel);
        for (kind, value) in [
            (u32_attr::CLASSID, self.class_id),
            (u32_attr::DIVISOR, self.divisor),
            (u32_attr::HASH, self.hash),
            (u32_attr::LINK, self.link),
        ] {
            if value != 0 {
                opts.add_value(kind, value.to_ne_bytes());
            }
        }
        Ok(opts)
    }

    fn decode(attrs: FilterAttrs, options: &[u8]) -> Result<Self> {
        let mut filter = Self::new(attrs);
        for attr in AttrIter::new(options) {
            let (kind, value) = attr?;
            match kind {
                u32_attr::SEL => filter.sel = Some(U32Sel::decode(value)?),
                u32_attr::CLASSID => filter.class_id = get::u32_ne(value)?,
                u32_attr::DIVISOR => filter.divisor = get::u32_ne(value)?,
                u32_attr::HASH => filter.hash = get::u32_ne(value)?,
                u32_attr::LINK => filter.link = get::u32_ne(value)?,
                _ => {}
            }
        }
        Ok(filter)
    }
}

/// Firewall mark classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FwFilter {
    pub attrs: FilterAttrs,
    pub class_id: u32,
    /// Only match packets that arrived on this device.
    pub in_dev: Option<String>,
    pub mask: u32,
}

impl FwFilter {
    /// Match the mark stored in the filter handle.
    pub fn new(attrs: FilterAttrs, class_id: u32) -> Self {
        Self {
            attrs,
            class_id,
            in_dev: None,
            mask: u32::MAX,
        }
    }

    fn options(&self) -> RtAttr {
        let mut opts = options_attr();
        if self.class_id != 0 {
            opts.add_value(fw::CLASSID, self.class_id.to_ne_bytes());
        }
        if let Some(dev) = &self.in_dev {
            opts.add_value(fw::INDEV, cstring(dev));
        }
        if self.mask != 0 {
            opts.add_value(fw::MASK, self.mask.to_ne_bytes());
        }
        opts
    }

    fn decode(attrs: FilterAttrs, options: &[u8]) -> Result<Self> {
        let mut filter = Self {
            attrs,
            class_id: 0,
            in_dev: None,
            mask: 0,
        };
        for attr in AttrIter::new(options) {
            let (kind, value) = attr?;
            match kind {
                fw::CLASSID => filter.class_id = get::u32_ne(value)?,
                fw::INDEV => filter.in_dev = Some(parse_string_from_bytes(value)),
                fw::MASK => filter.mask = get::u32_ne(value)?,
                _ => {}
            }
        }
        Ok(filter)
    }
}

/// A filter of any other kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericFilter {
    pub attrs: FilterAttrs,
    pub kind: String,
}

/// A classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    U32(U32Filter),
    Fw(FwFilter),
    Generic(GenericFilter),
}

impl Filter {
    pub fn attrs(&self) -> &FilterAttrs {
        match self {
            Self::U32(f) => &f.attrs,
            Self::Fw(f) => &f.attrs,
            Self::Generic(f) => &f.attrs,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::U32(_) => "u32",
            Self::Fw(_) => "fw",
            Self::Generic(f) => &f.kind,
        }
    }

    fn write_request(&self, req: &mut Request, with_options: bool) -> Result<()> {
        let options = match (with_options, self) {
            (false, _) | (_, Self::Generic(_)) => None,
            (true, Self::U32(f)) => Some(f.options()?),
            (true, Self::Fw(f)) => Some(f.options()),
        };
        write_tc(req, self.attrs().header(), self.kind(), options)
    }

    /// Decode an `RTM_NEWTFILTER` payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (header, kind, options) = split_tc(payload)?;
        let attrs = FilterAttrs::from_header(&header);
        Ok(match kind.as_str() {
            "u32" => Self::U32(U32Filter::decode(attrs, options)?),
            "fw" => Self::Fw(FwFilter::decode(attrs, options)?),
            _ => Self::Generic(GenericFilter { attrs, kind }),
        })
    }
}

fn tc_dump(msg_type: u16, link_index: u32, parent: u32) -> Request {
    let mut req = dump_request(msg_type);
    req.append(
        &TcMsg::new()
            .with_ifindex(link_index as i32)
            .with_parent(parent),
    );
    req
}

fn clock() -> PschedClock {
    PschedClock::from_proc().unwrap_or_else(|e| {
        tracing::debug!(error = %e, "psched clock unavailable, using defaults");
        PschedClock::default()
    })
}

impl Connection {
    async fn qdisc_modify(&self, mut req: Request, qdisc: &Qdisc, op: &str) -> Result<()> {
        qdisc.write_request(&mut req, true)?;
        self.request_ack(req).await.map_err(|e| {
            e.with_context(format!(
                "{op} {} qdisc {}",
                qdisc.kind(),
                Handle(qdisc.attrs().handle)
            ))
        })
    }

    /// Add a qdisc; fails if one already sits at that parent.
    pub async fn qdisc_add(&self, qdisc: &Qdisc) -> Result<()> {
        self.qdisc_modify(create_request(NlMsgType::RTM_NEWQDISC), qdisc, "adding")
            .await
    }

    /// Change the parameters of an existing qdisc.
    pub async fn qdisc_change(&self, qdisc: &Qdisc) -> Result<()> {
        self.qdisc_modify(ack_request(NlMsgType::RTM_NEWQDISC), qdisc, "changing")
            .await
    }

    /// Add a qdisc or replace the one at its parent.
    pub async fn qdisc_replace(&self, qdisc: &Qdisc) -> Result<()> {
        self.qdisc_modify(replace_request(NlMsgType::RTM_NEWQDISC), qdisc, "replacing")
            .await
    }

    pub async fn qdisc_del(&self, qdisc: &Qdisc) -> Result<()> {
        let mut req = ack_request(NlMsgType::RTM_DELQDISC);
        qdisc.write_request(&mut req, false)?;
        self.request_ack(req)
            .await
            .map_err(|e| e.with_context(format!("deleting {} qdisc", qdisc.kind())))
    }

    /// List qdiscs; `link_index` 0 lists every interface.
    pub async fn qdisc_list(&self, link_index: u32) -> Result<Vec<Qdisc>> {
        let req = tc_dump(NlMsgType::RTM_GETQDISC, link_index, 0);
        let mut out = Vec::new();
        for payload in self.dump(req, NlMsgType::RTM_NEWQDISC).await? {
            let qdisc = Qdisc::decode(&payload)?;
            if link_index == 0 || qdisc.attrs().link_index == link_index {
                out.push(qdisc);
            }
        }
        Ok(out)
    }

    async fn class_modify(&self, mut req: Request, class: &Class, op: &str) -> Result<()> {
        class.write_request(&mut req, &clock())?;
        self.request_ack(req).await.map_err(|e| {
            e.with_context(format!("{op} class {}", Handle(class.attrs().handle)))
        })
    }

    pub async fn class_add(&self, class: &Class) -> Result<()> {
        self.class_modify(create_request(NlMsgType::RTM_NEWTCLASS), class, "adding")
            .await
    }

    pub async fn class_change(&self, class: &Class) -> Result<()> {
        self.class_modify(ack_request(NlMsgType::RTM_NEWTCLASS), class, "changing")
            .await
    }

    pub async fn class_replace(&self, class: &Class) -> Result<()> {
        self.class_modify(replace_request(NlMsgType::RTM_NEWTCLASS), class, "replacing")
            .await
    }

    pub async fn class_del(&self, class: &Class) -> Result<()> {
        let mut req = ack_request(NlMsgType::RTM_DELTCLASS);
        write_tc(&mut req, class.attrs().header(), class.kind(), None)?;
        self.request_ack(req).await.map_err(|e| {
            e.with_context(format!("deleting class {}", Handle(class.attrs().handle)))
        })
    }

    /// List the classes below `parent` on a link.
    pub async fn class_list(&self, link_index: u32, parent: u32) -> Result<Vec<Class>> {
        let req = tc_dump(NlMsgType::RTM_GETTCLASS, link_index, parent);
        self.dump(req, NlMsgType::RTM_NEWTCLASS)
            .await?
            .iter()
            .map(|payload| Class::decode(payload))
            .collect()
    }

    /// Add a filter; fails if the handle is taken.
    ///
    /// The kernel may merge a hash table id into the handle, so delete the
    /// value returned by [`filter_list`](Self::filter_list) rather than the
    /// one passed here.
    pub async fn filter_add(&self, filter: &Filter) -> Result<()> {
        let mut req = create_request(NlMsgType::RTM_NEWTFILTER);
        filter.write_request(&mut req, true)?;
        self.request_ack(req)
            .await
            .map_err(|e| e.with_context(format!("adding {} filter", filter.kind())))
    }

    /// Add a filter or replace the one with the same handle.
    pub async fn filter_replace(&self, filter: &Filter) -> Result<()> {
        let mut req = Request::new(NlMsgType::RTM_NEWTFILTER, NLM_F_ACK | NLM_F_CREATE);
        filter.write_request(&mut req, true)?;
        self.request_ack(req)
            .await
            .map_err(|e| e.with_context(format!("replacing {} filter", filter.kind())))
    }

    pub async fn filter_del(&self, filter: &Filter) -> Result<()> {
        let mut req = ack_request(NlMsgType::RTM_DELTFILTER);
        filter.write_request(&mut req, false)?;
        self.request_ack(req)
            .await
            .map_err(|e| e.with_context(format!("deleting {} filter", filter.kind())))
    }

    /// List the filters attached to `parent` on a link.
    pub async fn filter_list(&self, link_index: u32, parent: u32) -> Result<Vec<Filter>> {
        let req = tc_dump(NlMsgType::RTM_GETTFILTER, link_index, parent);
        self.dump(req, NlMsgType::RTM_NEWTFILTER)
            .await?
            .iter()
            .map(|payload| Filter::decode(payload))
            .collect()
    }
}
