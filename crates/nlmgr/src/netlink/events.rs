//! Multicast subscriptions.
//!
//! Each subscription owns a dedicated socket joined to the relevant
//! multicast groups and a background task that decodes notifications into
//! typed events. Dropping the receiving side, calling
//! [`Subscription::close`] or firing the `done` signal all stop the task.
//!
//! With [`SubscribeOptions::list_existing`] the task first dumps the current
//! table. Dump replies are delivered as [`UpdateKind::Added`] events and
//! notifications that arrive while the dump is still running are held back
//! until it completes, so a consumer never sees a change before the object
//! it applies to.
//!
//! # Example
//!
//! ```ignore
//! use nlmgr::netlink::events::{SubscribeOptions, UpdateKind, subscribe_links};
//!
//! let mut links = subscribe_links(SubscribeOptions::new().list_existing(true))?;
//! while let Some(update) = links.recv().await {
//!     match update.kind {
//!         UpdateKind::Added => println!("link {} up={}", update.value.name, update.value.is_up()),
//!         UpdateKind::Removed => println!("link {} gone", update.value.name),
//!     }
//! }
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use super::addr::Addr;
use super::builder::Request;
use super::connection::dump_request;
use super::error::{Error, Result};
use super::link::Link;
use super::message::{NetlinkMessage, NlMsgError, NlMsgType};
use super::namespace::NamespaceSpec;
use super::neigh::Neigh;
use super::route::Route;
use super::socket::{NetlinkSocket, Protocol, SocketConfig, rtnetlink_groups, xfrm_groups};
use super::types::addr::IfAddrMsg;
use super::types::link::IfInfoMsg;
use super::types::neigh::NdMsg;
use super::types::route::RtMsg;
use super::types::xfrm::xfrm_msg;
use super::xfrm::XfrmExpire;

const DEFAULT_BUFFER: usize = 64;

/// Whether an object appeared (or changed) or went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    Added,
    Removed,
}

/// A change to a kernel object.
#[derive(Debug, Clone, PartialEq)]
pub struct Update<T> {
    pub kind: UpdateKind,
    pub value: T,
}

impl<T> Update<T> {
    fn new(msg_type: u16, added: u16, value: T) -> Self {
        let kind = if msg_type == added {
            UpdateKind::Added
        } else {
            UpdateKind::Removed
        };
        Self { kind, value }
    }
}

pub type RouteUpdate = Update<Route>;
pub type LinkUpdate = Update<Link>;
pub type AddrUpdate = Update<Addr>;
pub type NeighUpdate = Update<Neigh>;

/// A protocol and set of groups that produce typed events.
pub trait EventSource: Send + Sync + 'static {
    type Event: Send + 'static;

    fn protocol(&self) -> Protocol;

    /// Multicast groups to join.
    fn groups(&self) -> Vec<u32>;

    /// Request listing the current objects, if the table can be dumped.
    fn dump_request(&self) -> Option<Request>;

    /// Decode one message. `Ok(None)` skips messages the source does not
    /// care about.
    fn decode(&self, msg: &NetlinkMessage) -> Result<Option<Self::Event>>;
}

/// Routes in the IPv4 and IPv6 tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteEvents;

impl EventSource for RouteEvents {
    type Event = RouteUpdate;

    fn protocol(&self) -> Protocol {
        Protocol::Route
    }

    fn groups(&self) -> Vec<u32> {
        vec![
            rtnetlink_groups::RTNLGRP_IPV4_ROUTE,
            rtnetlink_groups::RTNLGRP_IPV6_ROUTE,
        ]
    }

    fn dump_request(&self) -> Option<Request> {
        let mut req = dump_request(NlMsgType::RTM_GETROUTE);
        req.append(&RtMsg::new());
        Some(req)
    }

    fn decode(&self, msg: &NetlinkMessage) -> Result<Option<RouteUpdate>> {
        match msg.msg_type() {
            t @ (NlMsgType::RTM_NEWROUTE | NlMsgType::RTM_DELROUTE) => Ok(Some(Update::new(
                t,
                NlMsgType::RTM_NEWROUTE,
                Route::decode(&msg.data)?,
            ))),
            _ => Ok(None),
        }
    }
}

/// Network interfaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkEvents;

impl EventSource for LinkEvents {
    type Event = LinkUpdate;

    fn protocol(&self) -> Protocol {
        Protocol::Route
    }

    fn groups(&self) -> Vec<u32> {
        vec![rtnetlink_groups::RTNLGRP_LINK]
    }

    fn dump_request(&self) -> Option<Request> {
        let mut req = dump_request(NlMsgType::RTM_GETLINK);
        req.append(&IfInfoMsg::new());
        Some(req)
    }

    fn decode(&self, msg: &NetlinkMessage) -> Result<Option<LinkUpdate>> {
        match msg.msg_type() {
            t @ (NlMsgType::RTM_NEWLINK | NlMsgType::RTM_DELLINK) => Ok(Some(Update::new(
                t,
                NlMsgType::RTM_NEWLINK,
                Link::decode(&msg.data)?,
            ))),
            _ => Ok(None),
        }
    }
}

/// IPv4 and IPv6 interface addresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddrEvents;

impl EventSource for AddrEvents {
    type Event = AddrUpdate;

    fn protocol(&self) -> Protocol {
        Protocol::Route
    }

    fn groups(&self) -> Vec<u32> {
        vec![
            rtnetlink_groups::RTNLGRP_IPV4_IFADDR,
            rtnetlink_groups::RTNLGRP_IPV6_IFADDR,
        ]
    }

    fn dump_request(&self) -> Option<Request> {
        let mut req = dump_request(NlMsgType::RTM_GETADDR);
        req.append(&IfAddrMsg::new());
        Some(req)
    }

    fn decode(&self, msg: &NetlinkMessage) -> Result<Option<AddrUpdate>> {
        match msg.msg_type() {
            t @ (NlMsgType::RTM_NEWADDR | NlMsgType::RTM_DELADDR) => Ok(Some(Update::new(
                t,
                NlMsgType::RTM_NEWADDR,
                Addr::decode(&msg.data)?,
            ))),
            _ => Ok(None),
        }
    }
}

/// Neighbor and FDB entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeighEvents;

impl EventSource for NeighEvents {
    type Event = NeighUpdate;

    fn protocol(&self) -> Protocol {
        Protocol::Route
    }

    fn groups(&self) -> Vec<u32> {
        vec![rtnetlink_groups::RTNLGRP_NEIGH]
    }

    fn dump_request(&self) -> Option<Request> {
        let mut req = dump_request(NlMsgType::RTM_GETNEIGH);
        req.append(&NdMsg::new());
        Some(req)
    }

    fn decode(&self, msg: &NetlinkMessage) -> Result<Option<NeighUpdate>> {
        match msg.msg_type() {
            t @ (NlMsgType::RTM_NEWNEIGH | NlMsgType::RTM_DELNEIGH) => Ok(Some(Update::new(
                t,
                NlMsgType::RTM_NEWNEIGH,
                Neigh::decode(&msg.data)?,
            ))),
            _ => Ok(None),
        }
    }
}

/// Security association expiry notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct XfrmExpireEvents;

impl EventSource for XfrmExpireEvents {
    type Event = XfrmExpire;

    fn protocol(&self) -> Protocol {
        Protocol::Xfrm
    }

    fn groups(&self) -> Vec<u32> {
        vec![xfrm_groups::XFRMNLGRP_EXPIRE]
    }

    fn dump_request(&self) -> Option<Request> {
        None
    }

    fn decode(&self, msg: &NetlinkMessage) -> Result<Option<XfrmExpire>> {
        match msg.msg_type() {
            xfrm_msg::EXPIRE => Ok(Some(XfrmExpire::decode(&msg.data)?)),
            other => Err(Error::NotSupported(format!(
                "xfrm message type {other} on the expire group"
            ))),
        }
    }
}

/// Options shared by all subscriptions.
#[derive(Debug)]
pub struct SubscribeOptions {
    namespace: Option<NamespaceSpec>,
    list_existing: bool,
    error_channel: Option<mpsc::UnboundedSender<Error>>,
    done: Option<oneshot::Receiver<()>>,
    buffer: usize,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            list_existing: false,
            error_channel: None,
            done: None,
            buffer: DEFAULT_BUFFER,
        }
    }
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe inside another network namespace.
    pub fn namespace(mut self, ns: NamespaceSpec) -> Self {
        self.namespace = Some(ns);
        self
    }

    /// Deliver the current table before live changes.
    pub fn list_existing(mut self, list_existing: bool) -> Self {
        self.list_existing = list_existing;
        self
    }

    /// Where decode and receive errors go. Without one they are logged.
    pub fn error_channel(mut self, errors: mpsc::UnboundedSender<Error>) -> Self {
        self.error_channel = Some(errors);
        self
    }

    /// Stop the subscription when this fires or its sender is dropped.
    pub fn done(mut self, done: oneshot::Receiver<()>) -> Self {
        self.done = Some(done);
        self
    }

    /// Capacity of the event channel.
    pub fn buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }
}

/// A running subscription.
///
/// Yields events until the socket is closed, the `done` signal fires or an
/// unrecoverable receive error occurs.
#[derive(Debug)]
pub struct Subscription<E> {
    events: mpsc::Receiver<E>,
    socket: Arc<NetlinkSocket>,
    worker: JoinHandle<()>,
}

impl<E> Subscription<E> {
    /// Next event, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<E> {
        self.events.recv().await
    }

    /// Close the socket. Events already queued can still be received.
    pub fn close(&self) {
        self.socket.close();
    }

    /// Stop receiving and wait for the background task to exit.
    pub async fn join(self) {
        let Self { events, worker, .. } = self;
        drop(events);
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "subscription task failed");
        }
    }

    /// Convert into a [`Stream`](tokio_stream::Stream) of events.
    ///
    /// Dropping the stream stops the background task.
    pub fn into_stream(self) -> ReceiverStream<E> {
        ReceiverStream::new(self.events)
    }
}

/// Start a subscription for any [`EventSource`].
///
/// Must be called from within a tokio runtime.
pub fn subscribe<S: EventSource>(
    source: S,
    options: SubscribeOptions,
) -> Result<Subscription<S::Event>> {
    let mut config = SocketConfig::new().groups(source.groups());
    if let Some(ns) = options.namespace {
        config = config.namespace(ns);
    }
    let socket = Arc::new(NetlinkSocket::open_with(source.protocol(), config)?);
    tracing::debug!(
        pid = socket.pid(),
        groups = ?socket.groups(),
        "started subscription"
    );

    let (tx, rx) = mpsc::channel(options.buffer);
    let worker = tokio::spawn(run(
        source,
        Arc::clone(&socket),
        tx,
        Reporter(options.error_channel),
        options.done,
        options.list_existing,
    ));
    Ok(Subscription {
        events: rx,
        socket,
        worker,
    })
}

pub fn subscribe_routes(options: SubscribeOptions) -> Result<Subscription<RouteUpdate>> {
    subscribe(RouteEvents, options)
}

pub fn subscribe_links(options: SubscribeOptions) -> Result<Subscription<LinkUpdate>> {
    subscribe(LinkEvents, options)
}

pub fn subscribe_addrs(options: SubscribeOptions) -> Result<Subscription<AddrUpdate>> {
    subscribe(AddrEvents, options)
}

pub fn subscribe_neighs(options: SubscribeOptions) -> Result<Subscription<NeighUpdate>> {
    subscribe(NeighEvents, options)
}

/// Subscribe to SA expiry. `list_existing` is ignored.
pub fn subscribe_xfrm_expire(options: SubscribeOptions) -> Result<Subscription<XfrmExpire>> {
    subscribe(XfrmExpireEvents, options)
}

struct Reporter(Option<mpsc::UnboundedSender<Error>>);

impl Reporter {
    fn report(&self, error: Error) {
        match &self.0 {
            Some(tx) => {
                if let Err(mpsc::error::SendError(error)) = tx.send(error) {
                    tracing::warn!(%error, "subscription error dropped");
                }
            }
            None => tracing::warn!(%error, "subscription error"),
        }
    }
}

enum Output<E> {
    Event(E),
    Error(Error),
}

/// Orders dump replies ahead of concurrent notifications.
struct Replay<E> {
    dump_seq: Option<u32>,
    pending: VecDeque<E>,
}

impl<E> Replay<E> {
    fn new(dump_seq: Option<u32>) -> Self {
        Self {
            dump_seq,
            pending: VecDeque::new(),
        }
    }

    fn feed<S>(&mut self, source: &S, msg: &NetlinkMessage, out: &mut Vec<Output<E>>)
    where
        S: EventSource<Event = E>,
    {
        let from_dump = self
            .dump_seq
            .is_some_and(|seq| seq != 0 && msg.header.nlmsg_seq == seq);

        match msg.msg_type() {
            NlMsgType::DONE | NlMsgType::ERROR if from_dump => {
                // A DONE may carry an errno in its first word.
                if msg.data.len() >= 4
                    && let Ok(err) = NlMsgError::from_bytes(&msg.data)
                    && !err.is_ack()
                {
                    out.push(Output::Error(
                        err.into_error(msg.header.nlmsg_flags, &msg.data)
                            .with_context("initial dump"),
                    ));
                }
                self.dump_seq = None;
                out.extend(self.pending.drain(..).map(Output::Event));
                return;
            }
            NlMsgType::NOOP | NlMsgType::DONE | NlMsgType::ERROR | NlMsgType::OVERRUN => {
                tracing::trace!(msg_type = msg.msg_type(), "ignoring control message");
                return;
            }
            _ => {}
        }

        match source.decode(msg) {
            Ok(Some(event)) if from_dump || self.dump_seq.is_none() => {
                out.push(Output::Event(event));
            }
            Ok(Some(event)) => self.pending.push_back(event),
            Ok(None) => {}
            Err(e) => out.push(Output::Error(e)),
        }
    }
}

async fn run<S: EventSource>(
    source: S,
    socket: Arc<NetlinkSocket>,
    events: mpsc::Sender<S::Event>,
    reporter: Reporter,
    done: Option<oneshot::Receiver<()>>,
    list_existing: bool,
) {
    let mut replay = Replay::new(None);
    if list_existing && let Some(req) = source.dump_request() {
        let seq = req.seq();
        let sent = match req.serialize(socket.pid()) {
            Ok(bytes) => socket.send(&bytes).await,
            Err(e) => Err(e),
        };
        match sent {
            Ok(()) => replay = Replay::new(Some(seq)),
            Err(e) if e.is_closed() => return,
            Err(e) => reporter.report(e.with_context("initial dump")),
        }
    }

    let done = async move {
        match done {
            // A dropped sender counts as done.
            Some(rx) => {
                let _ = rx.await;
            }
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(done);

    let mut out = Vec::new();
    loop {
        let received = tokio::select! {
            received = socket.receive() => received,
            () = &mut done => {
                socket.close();
                break;
            }
            () = events.closed() => break,
        };

        let msgs = match received {
            Ok(msgs) => msgs,
            Err(e) if e.is_closed() => break,
            Err(e) => {
                reporter.report(e);
                break;
            }
        };

        for msg in &msgs {
            replay.feed(&source, msg, &mut out);
        }
        for output in out.drain(..) {
            match output {
                Output::Event(event) => {
                    if events.send(event).await.is_err() {
                        tracing::debug!(pid = socket.pid(), "subscriber went away");
                        return;
                    }
                }
                Output::Error(e) => reporter.report(e),
            }
        }
    }
    tracing::debug!(pid = socket.pid(), "subscription finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::attr::RtAttr;
    use crate::netlink::parse::ToNetlink;
    use crate::netlink::types::link::ifla;
    use crate::netlink::types::xfrm::XfrmUserExpire;
    use crate::netlink::xfrm::XfrmProto;
    use zerocopy::IntoBytes;

    /// Events are the first payload word.
    struct Counter;

    impl EventSource for Counter {
        type Event = u32;

        fn protocol(&self) -> Protocol {
            Protocol::Route
        }

        fn groups(&self) -> Vec<u32> {
            Vec::new()
        }

        fn dump_request(&self) -> Option<Request> {
            None
        }

        fn decode(&self, msg: &NetlinkMessage) -> Result<Option<u32>> {
            match msg.msg_type() {
                NlMsgType::RTM_NEWLINK => {
                    let word = msg
                        .data
                        .get(..4)
                        .ok_or(Error::Truncated {
                            expected: 4,
                            actual: msg.data.len(),
                        })?;
                    Ok(Some(u32::from_ne_bytes([word[0], word[1], word[2], word[3]])))
                }
                _ => Ok(None),
            }
        }
    }

    fn event(value: u32, seq: u32) -> NetlinkMessage {
        NetlinkMessage::new(NlMsgType::RTM_NEWLINK, 0, value.to_ne_bytes().to_vec())
            .with_seq(seq, 0)
    }

    fn done(seq: u32, errno: i32) -> NetlinkMessage {
        NetlinkMessage::new(NlMsgType::DONE, 0, errno.to_ne_bytes().to_vec()).with_seq(seq, 0)
    }

    fn feed_all(replay: &mut Replay<u32>, msgs: &[NetlinkMessage]) -> (Vec<u32>, Vec<Error>) {
        let mut out = Vec::new();
        for msg in msgs {
            replay.feed(&Counter, msg, &mut out);
        }
        let mut events = Vec::new();
        let mut errors = Vec::new();
        for output in out {
            match output {
                Output::Event(e) => events.push(e),
                Output::Error(e) => errors.push(e),
            }
        }
        (events, errors)
    }

    #[test]
    fn test_live_events_held_until_dump_completes() {
        let mut replay = Replay::new(Some(7));
        let (events, errors) = feed_all(
            &mut replay,
            &[event(100, 0), event(1, 7), event(101, 0), event(2, 7)],
        );
        assert_eq!(events, vec![1, 2]);
        assert!(errors.is_empty());

        let (events, _) = feed_all(&mut replay, &[done(7, 0)]);
        assert_eq!(events, vec![100, 101]);

        let (events, _) = feed_all(&mut replay, &[event(102, 0)]);
        assert_eq!(events, vec![102]);
    }

    #[test]
    fn test_no_dump_passes_through() {
        let mut replay = Replay::new(None);
        let (events, errors) = feed_all(&mut replay, &[event(5, 0), done(0, 0), event(6, 3)]);
        assert_eq!(events, vec![5, 6]);
        assert!(errors.is_empty());
    }

    #[test]
    fn test_failed_dump_reports_and_flushes() {
        let mut replay = Replay::new(Some(9));
        let (events, errors) = feed_all(&mut replay, &[event(50, 0), done(9, -libc::EBUSY)]);
        assert_eq!(events, vec![50]);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].errno(), Some(libc::EBUSY));
    }

    #[test]
    fn test_decode_error_does_not_stop_stream() {
        let mut replay = Replay::new(None);
        let broken = NetlinkMessage::new(NlMsgType::RTM_NEWLINK, 0, vec![1]);
        let (events, errors) = feed_all(&mut replay, &[broken, event(3, 0)]);
        assert_eq!(events, vec![3]);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_link_update_kind() {
        let mut payload = IfInfoMsg::new().to_bytes().unwrap();
        let name = RtAttr::new(ifla::IFNAME, &b"eth7\0"[..]);
        payload.extend_from_slice(&name.serialize().unwrap());

        let new = NetlinkMessage::new(NlMsgType::RTM_NEWLINK, 0, payload.clone());
        let update = LinkEvents.decode(&new).unwrap().unwrap();
        assert_eq!(update.kind, UpdateKind::Added);
        assert_eq!(update.value.name, "eth7");

        let del = NetlinkMessage::new(NlMsgType::RTM_DELLINK, 0, payload);
        let update = LinkEvents.decode(&del).unwrap().unwrap();
        assert_eq!(update.kind, UpdateKind::Removed);

        let other = NetlinkMessage::new(NlMsgType::RTM_NEWADDR, 0, Vec::new());
        assert!(LinkEvents.decode(&other).unwrap().is_none());
    }

    #[test]
    fn test_xfrm_monitor_rejects_other_types() {
        let msg = NetlinkMessage::new(xfrm_msg::NEWSA, 0, Vec::new());
        let err = XfrmExpireEvents.decode(&msg).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
        assert!(XfrmExpireEvents.dump_request().is_none());
    }

    #[test]
    fn test_xfrm_expire_event() {
        let mut expire = XfrmUserExpire {
            hard: 1,
            ..Default::default()
        };
        expire.state.family = libc::AF_INET as u16;
        expire.state.id.proto = 50;
        expire.state.id.spi = 0x1234u32.to_be();

        let msg = NetlinkMessage::new(xfrm_msg::EXPIRE, 0, expire.as_bytes().to_vec());
        let decoded = XfrmExpireEvents.decode(&msg).unwrap().unwrap();
        assert!(decoded.hard);
        assert_eq!(decoded.state.spi, 0x1234);
        assert_eq!(decoded.state.proto, XfrmProto::Esp);
    }

    #[test]
    fn test_buffer_never_zero() {
        assert_eq!(SubscribeOptions::new().buffer, DEFAULT_BUFFER);
        assert_eq!(SubscribeOptions::new().buffer(0).buffer, 1);
    }

    #[tokio::test]
    async fn test_close_ends_subscription() {
        let Ok(mut links) = subscribe_links(SubscribeOptions::new()) else {
            return;
        };
        links.close();
        assert!(links.recv().await.is_none());
        links.join().await;
    }

    #[tokio::test]
    async fn test_done_signal_ends_subscription() {
        let (stop, done) = oneshot::channel();
        let Ok(mut addrs) = subscribe_addrs(SubscribeOptions::new().done(done)) else {
            return;
        };
        stop.send(()).unwrap();
        assert!(addrs.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_list_existing_reports_loopback() {
        let options = SubscribeOptions::new().list_existing(true);
        let Ok(mut links) = subscribe_links(options) else {
            return;
        };
        let first = tokio::time::timeout(std::time::Duration::from_secs(5), links.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.kind, UpdateKind::Added);
        links.close();
        links.join().await;
    }
}
