//! Network interface queries and management.
//!
//! # Example
//!
//! ```ignore
//! use nlmgr::netlink::{Connection, Protocol};
//! use nlmgr::netlink::link::{LinkKind, NewLink};
//!
//! let conn = Connection::new(Protocol::Route)?;
//! conn.link_add(&NewLink::new("dummy0", LinkKind::Dummy).mtu(9000)).await?;
//! let link = conn.link_by_name("dummy0").await?;
//! conn.link_set_up(link.index).await?;
//! ```

use super::attr::{AttrIter, get};
use super::builder::Request;
use super::connection::{Connection, ack_request, create_request, dump_request};
use super::error::{Error, Result};
use super::message::NlMsgType;
use super::parse::{parse_string_from_bytes, split_header};
use super::types::link::{IfInfoMsg, OperState, iff, ifla, ifla_info};

/// Interface types this crate can create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Dummy,
    Bridge,
    /// Intermediate functional block, used to shape ingress traffic.
    Ifb,
    /// Any other `IFLA_INFO_KIND` reported by the kernel.
    Other(String),
}

impl LinkKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Dummy => "dummy",
            Self::Bridge => "bridge",
            Self::Ifb => "ifb",
            Self::Other(kind) => kind,
        }
    }
}

impl From<&str> for LinkKind {
    fn from(kind: &str) -> Self {
        match kind {
            "dummy" => Self::Dummy,
            "bridge" => Self::Bridge,
            "ifb" => Self::Ifb,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A network interface as reported by `RTM_NEWLINK`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub mtu: u32,
    /// IFF_* flags.
    pub flags: u32,
    pub hardware_addr: Vec<u8>,
    pub kind: Option<LinkKind>,
    /// Index of the bridge or bond this link is enslaved to, 0 if none.
    pub master_index: u32,
    pub oper_state: OperState,
    /// ARPHRD_* device type.
    pub link_type: u16,
}

impl Link {
    pub fn is_up(&self) -> bool {
        self.flags & iff::UP != 0
    }

    pub fn is_loopback(&self) -> bool {
        self.flags & iff::LOOPBACK != 0
    }

    /// Decode an `RTM_NEWLINK`/`RTM_DELLINK` payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (header, attrs) = split_header::<IfInfoMsg>(payload)?;
        let mut link = Link {
            index: header.ifi_index as u32,
            flags: header.ifi_flags,
            link_type: header.ifi_type,
            ..Default::default()
        };

        for attr in AttrIter::new(attrs) {
            let (kind, value) = attr?;
            match kind {
                ifla::IFNAME => link.name = parse_string_from_bytes(value),
                ifla::MTU => link.mtu = get::u32_ne(value)?,
                ifla::ADDRESS => link.hardware_addr = value.to_vec(),
                ifla::MASTER => link.master_index = get::u32_ne(value)?,
                ifla::OPERSTATE => link.oper_state = OperState::from(get::u8(value)?),
                ifla::LINKINFO => {
                    for info in AttrIter::new(value) {
                        let (info_kind, info_value) = info?;
                        if info_kind == ifla_info::KIND {
                            link.kind = Some(LinkKind::from(get::string(info_value)?));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(link)
    }
}

/// Parameters for creating an interface.
#[derive(Debug, Clone)]
pub struct NewLink {
    name: String,
    kind: LinkKind,
    mtu: Option<u32>,
    address: Option<Vec<u8>>,
    master_index: Option<u32>,
}

impl NewLink {
    pub fn new(name: impl Into<String>, kind: LinkKind) -> Self {
        Self {
            name: name.into(),
            kind,
            mtu: None,
            address: None,
            master_index: None,
        }
    }

    pub fn mtu(mut self, mtu: u32) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// Set the hardware address.
    pub fn address(mut self, addr: impl Into<Vec<u8>>) -> Self {
        self.address = Some(addr.into());
        self
    }

    /// Enslave the new link to a bridge.
    pub fn master(mut self, index: u32) -> Self {
        self.master_index = Some(index);
        self
    }

    fn write_request(&self, req: &mut Request) -> Result<()> {
        if self.name.is_empty() || self.name.len() >= libc::IFNAMSIZ {
            return Err(Error::InvalidRequest(format!(
                "invalid interface name {:?}",
                self.name
            )));
        }
        if let LinkKind::Other(kind) = &self.kind {
            return Err(Error::NotSupported(format!("creating {kind} links")));
        }

        req.append(&IfInfoMsg::new());
        req.append_attr_str(ifla::IFNAME, &self.name);
        if let Some(mtu) = self.mtu {
            req.append_attr_u32(ifla::MTU, mtu);
        }
        if let Some(addr) = &self.address {
            req.append_attr(ifla::ADDRESS, addr);
        }
        if let Some(master) = self.master_index {
            req.append_attr_u32(ifla::MASTER, master);
        }
        let linkinfo = req.nest_start(ifla::LINKINFO);
        req.append_attr_str(ifla_info::KIND, self.kind.as_str());
        req.nest_end(linkinfo);
        Ok(())
    }
}

impl Connection {
    /// List every interface.
    pub async fn link_list(&self) -> Result<Vec<Link>> {
        let mut req = dump_request(NlMsgType::RTM_GETLINK);
        req.append(&IfInfoMsg::new());
        self.dump(req, NlMsgType::RTM_NEWLINK)
            .await?
            .iter()
            .map(|payload| Link::decode(payload))
            .collect()
    }

    /// Look up an interface by name.
    pub async fn link_by_name(&self, name: &str) -> Result<Link> {
        let mut req = Request::new(NlMsgType::RTM_GETLINK, 0);
        req.append(&IfInfoMsg::new());
        req.append_attr_str(ifla::IFNAME, name);
        self.get_link(req)
            .await
            .map_err(|e| not_found(e, name.to_string()))
    }

    /// Look up an interface by index.
    pub async fn link_by_index(&self, index: u32) -> Result<Link> {
        let mut req = Request::new(NlMsgType::RTM_GETLINK, 0);
        req.append(&IfInfoMsg::new().with_index(index as i32));
        self.get_link(req)
            .await
            .map_err(|e| not_found(e, format!("index {index}")))
    }

    async fn get_link(&self, req: Request) -> Result<Link> {
        let payloads = self.execute(req, NlMsgType::RTM_NEWLINK).await?;
        match payloads.first() {
            Some(payload) => Link::decode(payload),
            None => Err(Error::InvalidMessage("empty link reply".into())),
        }
    }

    pub async fn link_set_up(&self, index: u32) -> Result<()> {
        self.link_set_flags(index, iff::UP, iff::UP).await
    }

    pub async fn link_set_down(&self, index: u32) -> Result<()> {
        self.link_set_flags(index, 0, iff::UP).await
    }

    async fn link_set_flags(&self, index: u32, flags: u32, change: u32) -> Result<()> {
        let mut req = ack_request(NlMsgType::RTM_NEWLINK);
        req.append(&IfInfoMsg::new().with_index(index as i32).with_flags(flags, change));
        self.request_ack(req)
            .await
            .map_err(|e| e.with_context(format!("setting flags on link {index}")))
    }

    pub async fn link_set_mtu(&self, index: u32, mtu: u32) -> Result<()> {
        let mut req = ack_request(NlMsgType::RTM_SETLINK);
        req.append(&IfInfoMsg::new().with_index(index as i32));
        req.append_attr_u32(ifla::MTU, mtu);
        self.request_ack(req)
            .await
            .map_err(|e| e.with_context(format!("setting mtu on link {index}")))
    }

    /// Create an interface; fails if the name is taken.
    pub async fn link_add(&self, link: &NewLink) -> Result<()> {
        let mut req = create_request(NlMsgType::RTM_NEWLINK);
        link.write_request(&mut req)?;
        tracing::debug!(name = %link.name, kind = link.kind.as_str(), "adding link");
        self.request_ack(req)
            .await
            .map_err(|e| e.with_context(format!("adding link {}", link.name)))
    }

    pub async fn link_del(&self, index: u32) -> Result<()> {
        let mut req = ack_request(NlMsgType::RTM_DELLINK);
        req.append(&IfInfoMsg::new().with_index(index as i32));
        self.request_ack(req)
            .await
            .map_err(|e| e.with_context(format!("deleting link {index}")))
    }
}

fn not_found(err: Error, name: String) -> Error {
    if err.errno() == Some(libc::ENODEV) {
        Error::InterfaceNotFound { name }
    } else {
        err
    }
}
