//! Bridge port VLAN filtering.
//!
//! Requests use `AF_BRIDGE` link messages carrying `IFLA_AF_SPEC` with one
//! `IFLA_BRIDGE_VLAN_INFO` entry.
//!
//! # Example
//!
//! ```ignore
//! use nlmgr::netlink::bridge_vlan::BridgeVlan;
//!
//! // VLAN 100 as the untagged native VLAN of port 4
//! conn.bridge_vlan_add(&BridgeVlan::new(4, 100).pvid().untagged()).await?;
//!
//! for (ifindex, vlans) in conn.bridge_vlan_list().await? {
//!     println!("{ifindex}: {vlans:?}");
//! }
//! ```

use std::collections::BTreeMap;

use zerocopy::IntoBytes;

use super::attr::{AttrIter, get};
use super::builder::Request;
use super::connection::{Connection, ack_request, dump_request};
use super::error::{Error, Result};
use super::message::NlMsgType;
use super::parse::split_header;
use super::types::bridge::{BridgeVlanInfo, bridge_flags, bridge_vlan_info, ifla_bridge};
use super::types::link::{IfInfoMsg, ifla, rtext_filter};

/// Highest usable VLAN id.
pub const VLAN_MAX: u16 = 4094;

/// One VLAN membership change on a bridge port.
#[derive(Debug, Clone, Default)]
pub struct BridgeVlan {
    ifindex: u32,
    vid: u16,
    pvid: bool,
    untagged: bool,
    self_: bool,
    master: bool,
}

impl BridgeVlan {
    pub fn new(ifindex: u32, vid: u16) -> Self {
        Self {
            ifindex,
            vid,
            ..Default::default()
        }
    }

    /// Untagged ingress frames join this VLAN.
    pub fn pvid(mut self) -> Self {
        self.pvid = true;
        self
    }

    /// Strip the tag on egress.
    pub fn untagged(mut self) -> Self {
        self.untagged = true;
        self
    }

    /// Apply to the bridge device itself (`self` in `bridge vlan`).
    pub fn self_(mut self) -> Self {
        self.self_ = true;
        self
    }

    /// Apply through the port's master (`master` in `bridge vlan`).
    pub fn master(mut self) -> Self {
        self.master = true;
        self
    }

    fn vlan_info(&self) -> BridgeVlanInfo {
        let mut info = BridgeVlanInfo::new(self.vid);
        if self.pvid {
            info.flags |= bridge_vlan_info::PVID;
        }
        if self.untagged {
            info.flags |= bridge_vlan_info::UNTAGGED;
        }
        info
    }

    fn write_request(&self, req: &mut Request) -> Result<()> {
        if self.vid == 0 || self.vid > VLAN_MAX {
            return Err(Error::InvalidRequest(format!(
                "VLAN id {} outside 1..={VLAN_MAX}",
                self.vid
            )));
        }
        if self.ifindex == 0 {
            return Err(Error::InvalidRequest("bridge VLAN needs a port index".into()));
        }

        req.append(
            &IfInfoMsg::new()
                .with_family(libc::AF_BRIDGE as u8)
                .with_index(self.ifindex as i32),
        );
        let spec = req.nest_start(ifla::AF_SPEC);
        let mut flags = 0;
        if self.self_ {
            flags |= bridge_flags::SELF;
        }
        if self.master {
            flags |= bridge_flags::MASTER;
        }
        if flags != 0 {
            req.append_attr_u16(ifla_bridge::FLAGS, flags);
        }
        req.append_attr(ifla_bridge::VLAN_INFO, self.vlan_info().as_bytes());
        req.nest_end(spec);
        Ok(())
    }
}

/// Decode the VLAN entries of one `AF_BRIDGE` link message.
///
/// Returns the port index and its entries; links without `IFLA_AF_SPEC`
/// yield an empty list.
pub fn decode_vlans(payload: &[u8]) -> Result<(u32, Vec<BridgeVlanInfo>)> {
    let (header, attrs) = split_header::<IfInfoMsg>(payload)?;
    let mut vlans = Vec::new();
    for attr in AttrIter::new(attrs) {
        let (kind, value) = attr?;
        if kind != ifla::AF_SPEC {
            continue;
        }
        for spec in AttrIter::new(value) {
            let (spec_kind, spec_value) = spec?;
            if spec_kind == ifla_bridge::VLAN_INFO {
                vlans.push(get::fixed::<BridgeVlanInfo>(spec_value)?);
            }
        }
    }
    Ok((header.ifi_index as u32, vlans))
}

impl Connection {
    /// Add a VLAN to a bridge port (or update its flags).
    pub async fn bridge_vlan_add(&self, vlan: &BridgeVlan) -> Result<()> {
        let mut req = ack_request(NlMsgType::RTM_SETLINK);
        vlan.write_request(&mut req)?;
        self.request_ack(req).await.map_err(|e| {
            e.with_context(format!("adding vlan {} to link {}", vlan.vid, vlan.ifindex))
        })
    }

    /// Remove a VLAN from a bridge port. Only the id and flags selecting
    /// `self`/`master` matter.
    pub async fn bridge_vlan_del(&self, vlan: &BridgeVlan) -> Result<()> {
        let mut req = ack_request(NlMsgType::RTM_DELLINK);
        vlan.write_request(&mut req)?;
        self.request_ack(req).await.map_err(|e| {
            e.with_context(format!("deleting vlan {} from link {}", vlan.vid, vlan.ifindex))
        })
    }

    /// VLAN entries of every bridge port, keyed by interface index.
    pub async fn bridge_vlan_list(&self) -> Result<BTreeMap<u32, Vec<BridgeVlanInfo>>> {
        let mut req = dump_request(NlMsgType::RTM_GETLINK);
        req.append(&IfInfoMsg::new().with_family(libc::AF_BRIDGE as u8));
        req.append_attr_u32(ifla::EXT_MASK, rtext_filter::BRVLAN);

        let mut out = BTreeMap::new();
        for payload in self.dump(req, NlMsgType::RTM_NEWLINK).await? {
            let (ifindex, vlans) = decode_vlans(&payload)?;
            if !vlans.is_empty() {
                out.insert(ifindex, vlans);
            }
        }
        Ok(out)
    }
}
