//! High-level netlink connection with request/response handling.

use tokio::sync::Mutex;

use super::builder::Request;
use super::collector::ResponseCollector;
use super::error::Result;
use super::message::{NLM_F_ACK, NLM_F_APPEND, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_REPLACE};
use super::namespace::NamespaceSpec;
use super::socket::{NetlinkSocket, Protocol, SocketConfig};

/// High-level netlink connection.
///
/// Requests on one connection are serialized: a second request waits until
/// the first has collected its last reply.
#[derive(Debug)]
pub struct Connection {
    socket: NetlinkSocket,
    conversation: Mutex<()>,
}

impl Connection {
    /// Create a new connection for the given protocol.
    pub fn new(protocol: Protocol) -> Result<Self> {
        Self::with_config(protocol, SocketConfig::new())
    }

    /// Create a connection with a socket configuration.
    pub fn with_config(protocol: Protocol, config: SocketConfig) -> Result<Self> {
        Ok(Self::from_socket(NetlinkSocket::open_with(protocol, config)?))
    }

    /// Create a connection inside a network namespace.
    pub fn for_namespace(protocol: Protocol, ns: NamespaceSpec) -> Result<Self> {
        Self::with_config(protocol, SocketConfig::new().namespace(ns))
    }

    /// Wrap an already opened socket.
    pub fn from_socket(socket: NetlinkSocket) -> Self {
        Self {
            socket,
            conversation: Mutex::new(()),
        }
    }

    /// Get the underlying socket.
    pub fn socket(&self) -> &NetlinkSocket {
        &self.socket
    }

    /// Send `request` and collect every reply payload of type `expected`.
    pub async fn execute(&self, request: Request, expected: u16) -> Result<Vec<Vec<u8>>> {
        let _turn = self.conversation.lock().await;

        let seq = request.seq();
        let pid = self.socket.pid();
        tracing::debug!(
            msg_type = request.msg_type(),
            flags = format_args!("{:#x}", request.flags()),
            seq,
            "sending request"
        );

        self.socket.send(&request.serialize(pid)?).await?;
        ResponseCollector::new(seq, pid, expected)
            .run(&self.socket)
            .await
    }

    /// Send a request that expects only an ACK.
    pub async fn request_ack(&self, request: Request) -> Result<()> {
        self.execute(request, 0).await.map(|_| ())
    }

    /// Send a dump request and collect every page.
    pub async fn dump(&self, request: Request, expected: u16) -> Result<Vec<Vec<u8>>> {
        self.execute(request, expected).await
    }
}

/// Build a dump request.
pub fn dump_request(msg_type: u16) -> Request {
    Request::new(msg_type, NLM_F_DUMP)
}

/// Build a request expecting ACK.
pub fn ack_request(msg_type: u16) -> Request {
    Request::new(msg_type, NLM_F_ACK)
}

/// Build a create-only request (fails if the object exists).
pub fn create_request(msg_type: u16) -> Request {
    Request::new(msg_type, NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL)
}

/// Build a create-or-replace request.
pub fn replace_request(msg_type: u16) -> Request {
    Request::new(msg_type, NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE)
}

/// Build a create-or-append request.
pub fn append_request(msg_type: u16) -> Request {
    Request::new(msg_type, NLM_F_ACK | NLM_F_CREATE | NLM_F_APPEND)
}
