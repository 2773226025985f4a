//! Generic netlink family resolution through the control family.
//!
//! Family ids other than the control family's are assigned at runtime, so
//! any generic netlink user first looks its family up by name.
//!
//! # Example
//!
//! ```ignore
//! use nlmgr::netlink::{Connection, Protocol};
//!
//! let conn = Connection::new(Protocol::Generic)?;
//! let family = conn.genl_family_get("nlctrl").await?;
//! println!("{} id={} groups={:?}", family.name, family.id, family.groups);
//! ```

use super::attr::{AttrIter, get};
use super::builder::Request;
use super::connection::{Connection, dump_request};
use super::error::{Error, Result};
use super::parse::split_header;
use super::types::genl::{
    CTRL_VERSION, GENL_ID_CTRL, GenlMsgHdr, ctrl_attr, ctrl_attr_mcast_grp, ctrl_attr_op, ctrl_cmd,
};

/// One command a family supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenlOp {
    pub id: u32,
    /// GENL_* permission and capability flags.
    pub flags: u32,
}

/// A multicast group a family publishes events on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenlMulticastGroup {
    pub id: u32,
    pub name: String,
}

/// A registered generic netlink family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenlFamily {
    /// Used as the message type of requests to this family.
    pub id: u16,
    pub name: String,
    pub version: u32,
    /// Size of the family-specific header after `genlmsghdr`.
    pub hdr_size: u32,
    pub max_attr: u32,
    pub ops: Vec<GenlOp>,
    pub groups: Vec<GenlMulticastGroup>,
}

impl GenlFamily {
    /// Id of the multicast group called `name`.
    pub fn group_id(&self, name: &str) -> Option<u32> {
        self.groups.iter().find(|g| g.name == name).map(|g| g.id)
    }

    /// Decode a `CTRL_CMD_NEWFAMILY` payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (_, attrs) = split_header::<GenlMsgHdr>(payload)?;
        let mut family = Self::default();
        for attr in AttrIter::new(attrs) {
            let (kind, value) = attr?;
            match kind {
                ctrl_attr::FAMILY_ID => family.id = get::u16_ne(value)?,
                ctrl_attr::FAMILY_NAME => family.name = get::string(value)?.to_string(),
                ctrl_attr::VERSION => family.version = get::u32_ne(value)?,
                ctrl_attr::HDRSIZE => family.hdr_size = get::u32_ne(value)?,
                ctrl_attr::MAXATTR => family.max_attr = get::u32_ne(value)?,
                ctrl_attr::OPS => family.ops = decode_ops(value)?,
                ctrl_attr::MCAST_GROUPS => family.groups = decode_groups(value)?,
                _ => {}
            }
        }
        Ok(family)
    }
}

// Both lists are arrays: each element is a nest keyed by its position.

fn decode_ops(data: &[u8]) -> Result<Vec<GenlOp>> {
    let mut ops = Vec::new();
    for entry in AttrIter::new(data) {
        let (_, nest) = entry?;
        let mut op = GenlOp::default();
        for attr in AttrIter::new(nest) {
            let (kind, value) = attr?;
            match kind {
                ctrl_attr_op::ID => op.id = get::u32_ne(value)?,
                ctrl_attr_op::FLAGS => op.flags = get::u32_ne(value)?,
                _ => {}
            }
        }
        ops.push(op);
    }
    Ok(ops)
}

fn decode_groups(data: &[u8]) -> Result<Vec<GenlMulticastGroup>> {
    let mut groups = Vec::new();
    for entry in AttrIter::new(data) {
        let (_, nest) = entry?;
        let mut group = GenlMulticastGroup::default();
        for attr in AttrIter::new(nest) {
            let (kind, value) = attr?;
            match kind {
                ctrl_attr_mcast_grp::ID => group.id = get::u32_ne(value)?,
                ctrl_attr_mcast_grp::NAME => group.name = get::string(value)?.to_string(),
                _ => {}
            }
        }
        groups.push(group);
    }
    Ok(groups)
}

fn ctrl_header() -> GenlMsgHdr {
    GenlMsgHdr::new(ctrl_cmd::GETFAMILY, CTRL_VERSION)
}

impl Connection {
    /// List every registered family.
    ///
    /// Requires a connection opened with
    /// [`Protocol::Generic`](super::socket::Protocol::Generic).
    pub async fn genl_family_list(&self) -> Result<Vec<GenlFamily>> {
        let mut req = dump_request(GENL_ID_CTRL);
        req.append(&ctrl_header());
        self.dump(req, GENL_ID_CTRL)
            .await?
            .iter()
            .map(|payload| GenlFamily::decode(payload))
            .collect()
    }

    /// Look a family up by name.
    pub async fn genl_family_get(&self, name: &str) -> Result<GenlFamily> {
        let mut req = Request::new(GENL_ID_CTRL, 0);
        req.append(&ctrl_header());
        req.append_attr_str(ctrl_attr::FAMILY_NAME, name);

        let payloads = self.execute(req, GENL_ID_CTRL).await.map_err(|e| {
            if e.errno() == Some(libc::ENOENT) {
                Error::FamilyNotFound {
                    name: name.to_string(),
                }
            } else {
                e.with_context(format!("resolving generic netlink family {name}"))
            }
        })?;
        let family = match payloads.first() {
            Some(payload) => GenlFamily::decode(payload)?,
            None => return Err(Error::InvalidMessage("empty family reply".into())),
        };
        tracing::debug!(name, id = family.id, "resolved generic netlink family");
        Ok(family)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::attr::RtAttr;
    use crate::netlink::parse::ToNetlink;
    use crate::netlink::socket::Protocol;

    fn family_payload() -> Vec<u8> {
        let mut payload = GenlMsgHdr::new(ctrl_cmd::NEWFAMILY, CTRL_VERSION)
            .to_bytes()
            .unwrap();
        let mut attrs = vec![
            RtAttr::new(ctrl_attr::FAMILY_ID, 0x15u16.to_ne_bytes()),
            RtAttr::new(ctrl_attr::FAMILY_NAME, &b"thermal\0"[..]),
            RtAttr::new(ctrl_attr::VERSION, 1u32.to_ne_bytes()),
            RtAttr::new(ctrl_attr::HDRSIZE, 0u32.to_ne_bytes()),
            RtAttr::new(ctrl_attr::MAXATTR, 12u32.to_ne_bytes()),
        ];

        let mut ops = RtAttr::nested(ctrl_attr::OPS);
        for (index, id) in [(1u16, 1u32), (2, 3)] {
            let op = ops.add_child(RtAttr::nested(index));
            op.add_value(ctrl_attr_op::ID, id.to_ne_bytes());
            op.add_value(ctrl_attr_op::FLAGS, 0x0au32.to_ne_bytes());
        }
        attrs.push(ops);

        let mut groups = RtAttr::nested(ctrl_attr::MCAST_GROUPS);
        for (index, name, id) in [(1u16, &b"thermal\0"[..], 4u32), (2, &b"sampling\0"[..], 5)] {
            let group = groups.add_child(RtAttr::nested(index));
            group.add_value(ctrl_attr_mcast_grp::NAME, name);
            group.add_value(ctrl_attr_mcast_grp::ID, id.to_ne_bytes());
        }
        attrs.push(groups);

        for attr in &attrs {
            payload.extend_from_slice(&attr.serialize().unwrap());
            payload.resize(payload.len().next_multiple_of(4), 0);
        }
        payload
    }

    #[test]
    fn test_decode_family() {
        let family = GenlFamily::decode(&family_payload()).unwrap();
        assert_eq!(family.id, 0x15);
        assert_eq!(family.name, "thermal");
        assert_eq!(family.version, 1);
        assert_eq!(family.max_attr, 12);
        assert_eq!(
            family.ops,
            vec![GenlOp { id: 1, flags: 0x0a }, GenlOp { id: 3, flags: 0x0a }]
        );
        assert_eq!(family.groups.len(), 2);
        assert_eq!(family.group_id("sampling"), Some(5));
        assert_eq!(family.group_id("missing"), None);
    }

    #[test]
    fn test_decode_truncated_family() {
        let payload = family_payload();
        assert!(GenlFamily::decode(&payload[..2]).is_err());
        assert!(GenlFamily::decode(&payload[..payload.len() - 3]).is_err());
    }

    #[tokio::test]
    async fn test_resolve_control_family() {
        let Ok(conn) = Connection::new(Protocol::Generic) else {
            return;
        };
        let family = conn.genl_family_get("nlctrl").await.unwrap();
        assert_eq!(family.id, GENL_ID_CTRL);
        assert!(family.group_id("notify").is_some());

        let err = conn.genl_family_get("nlmgr-no-such").await.unwrap_err();
        assert!(matches!(err, Error::FamilyNotFound { .. }));
        assert!(err.is_not_found());

        let families = conn.genl_family_list().await.unwrap();
        assert!(families.iter().any(|f| f.name == "nlctrl"));
    }
}
