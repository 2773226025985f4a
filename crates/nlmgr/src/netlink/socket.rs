//! Low-level async netlink socket operations.
//!
//! [`NetlinkSocket`] owns one netlink socket. It sends whole frames,
//! receives whole datagrams (growing its buffer when a datagram does not
//! fit) and can be closed from another task while a receive is pending.

use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use bytes::BytesMut;
use netlink_sys::{Socket, SocketAddr, protocols};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::sync::watch;

use super::error::{Error, Result};
use super::message::{NetlinkMessage, parse_messages};
use super::namespace::NamespaceSpec;

/// Initial receive buffer size; doubled whenever a datagram is larger.
pub const DEFAULT_RECV_BUFFER: usize = 4096;

/// Netlink protocol families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Routing/device hook (links, addresses, routes, neighbours, tc).
    Route,
    /// IPsec state and policy.
    Xfrm,
    /// Generic netlink.
    Generic,
}

impl Protocol {
    fn as_isize(self) -> isize {
        match self {
            Protocol::Route => protocols::NETLINK_ROUTE,
            Protocol::Xfrm => protocols::NETLINK_XFRM,
            Protocol::Generic => protocols::NETLINK_GENERIC,
        }
    }
}

/// Options for opening a socket.
#[derive(Debug, Clone, Default)]
pub struct SocketConfig {
    /// Multicast groups to join (group numbers, not bitmasks).
    pub groups: Vec<u32>,
    /// Namespace to open the socket in.
    pub namespace: Option<NamespaceSpec>,
    /// Give up on a receive after this long.
    pub receive_timeout: Option<Duration>,
    /// `SO_RCVBUF` to request from the kernel.
    pub receive_buffer_size: Option<usize>,
    /// Accept datagrams from user-space senders, not only the kernel.
    pub listen_all: bool,
}

impl SocketConfig {
    /// Create a default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a multicast group after binding.
    pub fn group(mut self, group: u32) -> Self {
        self.groups.push(group);
        self
    }

    /// Join several multicast groups after binding.
    pub fn groups(mut self, groups: impl IntoIterator<Item = u32>) -> Self {
        self.groups.extend(groups);
        self
    }

    /// Open the socket in a namespace.
    pub fn namespace(mut self, ns: NamespaceSpec) -> Self {
        self.namespace = Some(ns);
        self
    }

    /// Set a receive timeout.
    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = Some(timeout);
        self
    }

    /// Set the kernel receive buffer size.
    pub fn receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = Some(size);
        self
    }

    /// Accept datagrams from any sender.
    pub fn listen_all(mut self, listen_all: bool) -> Self {
        self.listen_all = listen_all;
        self
    }
}

/// Async netlink socket.
pub struct NetlinkSocket {
    /// The underlying async file descriptor.
    fd: AsyncFd<Socket>,
    /// Local port ID (assigned by kernel).
    pid: u32,
    /// Protocol this socket uses.
    protocol: Protocol,
    /// Joined multicast groups.
    groups: Vec<u32>,
    receive_timeout: Option<Duration>,
    listen_all: bool,
    /// Flipped to true by `close()`; pending receives watch it.
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for NetlinkSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetlinkSocket")
            .field("fd", &self.raw_fd())
            .field("pid", &self.pid)
            .field("protocol", &self.protocol)
            .field("groups", &self.groups)
            .finish()
    }
}

impl NetlinkSocket {
    /// Open a socket for `protocol` and join `groups`.
    pub fn open(protocol: Protocol, groups: &[u32]) -> Result<Self> {
        Self::open_with(protocol, SocketConfig::new().groups(groups.iter().copied()))
    }

    /// Open a socket inside the namespace at `path`.
    pub fn open_in_namespace(
        protocol: Protocol,
        path: impl Into<std::path::PathBuf>,
        groups: &[u32],
    ) -> Result<Self> {
        Self::open_with(
            protocol,
            SocketConfig::new()
                .namespace(NamespaceSpec::Path(path.into()))
                .groups(groups.iter().copied()),
        )
    }

    /// Open a socket with full configuration.
    pub fn open_with(protocol: Protocol, config: SocketConfig) -> Result<Self> {
        let guard = match &config.namespace {
            Some(ns) => Some(ns.enter()?),
            None => None,
        };
        let result = Self::create_socket(protocol, &config);
        if let Some(guard) = guard {
            guard.restore()?;
        }
        result
    }

    fn create_socket(protocol: Protocol, config: &SocketConfig) -> Result<Self> {
        let mut socket = Socket::new(protocol.as_isize())?;
        socket.set_non_blocking(true)?;

        let mut addr = SocketAddr::new(0, 0);
        socket.bind(&addr)?;
        socket.get_address(&mut addr)?;
        let pid = addr.port_number();

        // Extended ACK is optional; older kernels reject the option.
        socket.set_ext_ack(true).ok();

        if let Some(size) = config.receive_buffer_size {
            set_rcvbuf(socket.as_raw_fd(), size)?;
        }

        for &group in &config.groups {
            socket.add_membership(group)?;
        }

        let fd = AsyncFd::new(socket)?;
        let (closed, _) = watch::channel(false);

        tracing::debug!(?protocol, pid, groups = ?config.groups, "opened netlink socket");

        Ok(Self {
            fd,
            pid,
            protocol,
            groups: config.groups.clone(),
            receive_timeout: config.receive_timeout,
            listen_all: config.listen_all,
            closed,
        })
    }

    /// Get the local port ID.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Get the protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Joined multicast groups.
    pub fn groups(&self) -> &[u32] {
        &self.groups
    }

    /// Raw descriptor, or -1 once the socket is closed.
    pub fn raw_fd(&self) -> RawFd {
        if self.is_closed() {
            -1
        } else {
            self.fd.get_ref().as_raw_fd()
        }
    }

    /// True after [`close`](Self::close).
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Subscribe to a multicast group.
    pub fn join_group(&mut self, group: u32) -> Result<()> {
        self.fd.get_mut().add_membership(group)?;
        self.groups.push(group);
        tracing::debug!(pid = self.pid, group, "joined multicast group");
        Ok(())
    }

    /// Set or clear the receive timeout.
    pub fn set_receive_timeout(&mut self, timeout: Option<Duration>) {
        self.receive_timeout = timeout;
    }

    /// Mark the socket closed and wake every pending receive.
    ///
    /// The descriptor itself is released when the socket is dropped.
    pub fn close(&self) {
        let was_open = !self.closed.send_replace(true);
        if was_open {
            tracing::debug!(pid = self.pid, "closed netlink socket");
        }
    }

    /// Send one complete frame.
    pub async fn send(&self, msg: &[u8]) -> Result<()> {
        loop {
            if self.is_closed() {
                return Err(Error::SocketClosed);
            }
            let mut guard = self.fd.ready(Interest::WRITABLE).await?;

            match guard.try_io(|inner| inner.get_ref().send(msg, 0)) {
                Ok(Ok(n)) if n == msg.len() => return Ok(()),
                Ok(Ok(n)) => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        format!("short netlink write: {} of {} bytes", n, msg.len()),
                    )));
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive one datagram and split it into messages.
    ///
    /// Returns [`Error::SocketClosed`] if the socket is closed before or
    /// while waiting, and [`Error::Timeout`] if a receive timeout is set
    /// and expires.
    pub async fn receive(&self) -> Result<Vec<NetlinkMessage>> {
        let data = self.recv_msg().await?;
        let msgs = parse_messages(&data)?;
        tracing::trace!(pid = self.pid, len = data.len(), count = msgs.len(), "received datagram");
        Ok(msgs)
    }

    /// Receive one raw datagram.
    pub async fn recv_msg(&self) -> Result<Vec<u8>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(Error::SocketClosed);
        }

        let recv = async {
            tokio::select! {
                res = self.recv_datagram() => res,
                _ = closed.wait_for(|c| *c) => Err(Error::SocketClosed),
            }
        };

        let (data, sender) = match self.receive_timeout {
            Some(timeout) => tokio::time::timeout(timeout, recv)
                .await
                .map_err(|_| Error::Timeout)??,
            None => recv.await?,
        };

        if sender != 0 && !self.listen_all {
            return Err(Error::UnexpectedSender { pid: sender });
        }
        Ok(data)
    }

    async fn recv_datagram(&self) -> Result<(Vec<u8>, u32)> {
        let mut capacity = DEFAULT_RECV_BUFFER;

        loop {
            let mut guard = self.fd.ready(Interest::READABLE).await?;

            let res = guard.try_io(|inner| {
                let socket = inner.get_ref();
                // Peek first so an oversized datagram is never truncated.
                let mut peek = BytesMut::with_capacity(capacity);
                let (size, _) = socket.recv_from(&mut peek, libc::MSG_PEEK | libc::MSG_TRUNC)?;
                while capacity < size {
                    capacity *= 2;
                }
                let mut buf = BytesMut::with_capacity(capacity);
                let (n, addr) = socket.recv_from(&mut buf, 0)?;
                buf.truncate(n);
                Ok((buf, addr.port_number()))
            });

            match res {
                Ok(Ok((buf, sender))) => return Ok((buf.to_vec(), sender)),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.raw_fd()
    }
}

fn set_rcvbuf(fd: RawFd, size: usize) -> Result<()> {
    let value = libc::c_int::try_from(size)
        .map_err(|_| Error::InvalidRequest(format!("receive buffer too large: {}", size)))?;
    // SAFETY: fd is an open socket and value outlives the call.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Multicast groups for NETLINK_ROUTE.
pub mod rtnetlink_groups {
    pub const RTNLGRP_LINK: u32 = 1;
    pub const RTNLGRP_NOTIFY: u32 = 2;
    pub const RTNLGRP_NEIGH: u32 = 3;
    pub const RTNLGRP_TC: u32 = 4;
    pub const RTNLGRP_IPV4_IFADDR: u32 = 5;
    pub const RTNLGRP_IPV4_MROUTE: u32 = 6;
    pub const RTNLGRP_IPV4_ROUTE: u32 = 7;
    pub const RTNLGRP_IPV4_RULE: u32 = 8;
    pub const RTNLGRP_IPV6_IFADDR: u32 = 9;
    pub const RTNLGRP_IPV6_MROUTE: u32 = 10;
    pub const RTNLGRP_IPV6_ROUTE: u32 = 11;
    pub const RTNLGRP_IPV6_IFINFO: u32 = 12;
    pub const RTNLGRP_IPV6_PREFIX: u32 = 18;
    pub const RTNLGRP_IPV6_RULE: u32 = 19;
}

/// Multicast groups for NETLINK_XFRM.
pub mod xfrm_groups {
    pub const XFRMNLGRP_ACQUIRE: u32 = 1;
    pub const XFRMNLGRP_EXPIRE: u32 = 2;
    pub const XFRMNLGRP_SA: u32 = 3;
    pub const XFRMNLGRP_POLICY: u32 = 4;
}
