//! Async netlink transport, codec and resource translators.
//!
//! The layers build on each other:
//!
//! - [`attr`] and [`message`] encode and decode the wire format.
//! - [`Request`] assembles a message; [`NetlinkSocket`] moves datagrams.
//! - [`Connection`] pairs a request with its replies.
//! - The translators ([`route`], [`link`], [`addr`], [`neigh`], [`tc`],
//!   [`xfrm`], [`genl`], [`bridge_vlan`]) add typed methods to
//!   [`Connection`].
//! - [`events`] turns multicast notifications into typed updates.
//!
//! # Quick Start
//!
//! ```ignore
//! use nlmgr::netlink::{Connection, Protocol};
//! use nlmgr::netlink::route::Route;
//!
//! let conn = Connection::new(Protocol::Route)?;
//!
//! for link in conn.link_list().await? {
//!     println!("{}: {}", link.index, link.name);
//! }
//!
//! let route = Route::new()
//!     .dst("10.1.0.0/16".parse()?)
//!     .gateway("192.168.1.1".parse()?);
//! conn.route_add(&route).await?;
//! ```

pub mod addr;
pub mod attr;
pub mod bridge_vlan;
mod builder;
mod collector;
pub mod connection;
mod error;
pub mod events;
pub mod genl;
pub mod link;
pub mod message;
pub mod namespace;
pub mod neigh;
pub mod parse;
pub mod route;
mod socket;
pub mod tc;
pub mod types;
pub mod xfrm;

pub use attr::{AttrIter, RtAttr};
pub use builder::{MessageBuilder, NestToken, Request};
pub use connection::Connection;
pub use error::{Error, Result};
pub use message::{MessageIter, NLMSG_HDRLEN, NetlinkMessage, NlMsgHdr, NlMsgType};
pub use namespace::NamespaceSpec;
pub use parse::{FromNetlink, ToNetlink};
pub use socket::{NetlinkSocket, Protocol, SocketConfig, rtnetlink_groups, xfrm_groups};
