//! Async netlink library for Linux network configuration.
//!
//! `nlmgr` talks to the kernel over netlink sockets and maps the wire
//! messages onto typed values: routes, links, addresses, neighbors,
//! traffic control objects, IPsec states and policies, and generic netlink
//! families. Multicast notifications for the same objects are exposed as
//! subscriptions.
//!
//! # Example
//!
//! ```ignore
//! use nlmgr::netlink::{Connection, Protocol};
//!
//! #[tokio::main]
//! async fn main() -> nlmgr::Result<()> {
//!     let conn = Connection::new(Protocol::Route)?;
//!
//!     for link in conn.link_list().await? {
//!         println!("{}: {} mtu {}", link.index, link.name, link.mtu);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Event Monitoring
//!
//! ```ignore
//! use nlmgr::netlink::events::{SubscribeOptions, subscribe_routes};
//!
//! let mut routes = subscribe_routes(SubscribeOptions::new().list_existing(true))?;
//! while let Some(update) = routes.recv().await {
//!     println!("{:?} {:?}", update.kind, update.value.dst);
//! }
//! ```

pub mod netlink;

pub use netlink::{Connection, Error, Protocol, Result};
