//! Request/reply state machine.
//!
//! A [`ResponseCollector`] is fed every message read for one request and
//! decides when the exchange is over. It is independent of the socket so
//! it can be driven from synthetic datagrams.

use super::error::{Error, Result};
use super::message::{NLM_F_DUMP_INTR, NetlinkMessage, NlMsgError, NlMsgType};
use super::socket::NetlinkSocket;

/// Outcome of feeding one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More replies are expected.
    Continue,
    /// The exchange is finished.
    Done,
}

/// Collects replies belonging to one request.
#[derive(Debug)]
pub struct ResponseCollector {
    seq: u32,
    pid: u32,
    expected: u16,
    payloads: Vec<Vec<u8>>,
    interrupted: bool,
}

impl ResponseCollector {
    /// Collect replies for `seq` sent from port `pid`.
    ///
    /// Only payloads of type `expected` are kept; 0 keeps every data message.
    pub fn new(seq: u32, pid: u32, expected: u16) -> Self {
        Self {
            seq,
            pid,
            expected,
            payloads: Vec::new(),
            interrupted: false,
        }
    }

    /// Number of payloads accumulated so far.
    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    /// True if nothing has been accumulated.
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// True if the kernel flagged the dump as interrupted.
    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    /// Process one reply message.
    ///
    /// A kernel error aborts the exchange; the partial results are dropped
    /// with the collector.
    pub fn feed(&mut self, msg: &NetlinkMessage) -> Result<Progress> {
        let header = &msg.header;

        if header.nlmsg_seq != self.seq {
            tracing::trace!(
                expected = self.seq,
                actual = header.nlmsg_seq,
                msg_type = header.nlmsg_type,
                "skipping message with foreign sequence number"
            );
            return Ok(Progress::Continue);
        }
        if self.pid != 0 && header.nlmsg_pid != self.pid {
            return Err(Error::PidMismatch {
                expected: self.pid,
                actual: header.nlmsg_pid,
            });
        }
        if header.nlmsg_flags & NLM_F_DUMP_INTR != 0 && !self.interrupted {
            tracing::debug!(seq = self.seq, "dump interrupted, results may be inconsistent");
            self.interrupted = true;
        }

        match header.nlmsg_type {
            NlMsgType::NOOP => Ok(Progress::Continue),
            NlMsgType::ERROR => {
                let err = NlMsgError::from_bytes(&msg.data)?;
                if err.is_ack() {
                    Ok(Progress::Done)
                } else {
                    Err(err.into_error(header.nlmsg_flags, &msg.data))
                }
            }
            NlMsgType::DONE => {
                // Some families append an error code to DONE.
                if let Ok(err) = NlMsgError::from_bytes(&msg.data)
                    && !err.is_ack()
                {
                    return Err(err.into_error(header.nlmsg_flags, &msg.data));
                }
                tracing::debug!(seq = self.seq, pages = self.payloads.len(), "dump complete");
                Ok(Progress::Done)
            }
            NlMsgType::OVERRUN => Err(Error::Io(std::io::Error::from_raw_os_error(libc::ENOBUFS))),
            msg_type => {
                if self.expected != 0 && msg_type != self.expected {
                    tracing::trace!(
                        expected = self.expected,
                        actual = msg_type,
                        "skipping reply of unexpected type"
                    );
                } else {
                    self.payloads.push(msg.data.clone());
                }
                if header.is_multi() {
                    Ok(Progress::Continue)
                } else {
                    Ok(Progress::Done)
                }
            }
        }
    }

    /// Feed every message of one datagram, stopping at completion.
    pub fn feed_all(&mut self, msgs: &[NetlinkMessage]) -> Result<Progress> {
        for msg in msgs {
            if self.feed(msg)? == Progress::Done {
                return Ok(Progress::Done);
            }
        }
        Ok(Progress::Continue)
    }

    /// Take the accumulated payloads.
    pub fn finish(self) -> Vec<Vec<u8>> {
        self.payloads
    }

    /// Drive the exchange on `socket` until completion.
    pub async fn run(mut self, socket: &NetlinkSocket) -> Result<Vec<Vec<u8>>> {
        loop {
            let msgs = socket.receive().await?;
            if self.feed_all(&msgs)? == Progress::Done {
                return Ok(self.finish());
            }
        }
    }
}
