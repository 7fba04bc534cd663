//! Events consumed by the broker loop.
//!
//! Everything that happens to the broker arrives here: decoded request
//! frames from connection tasks, link events and finished jobs from the
//! master-adapter worker, pulses from the upstream master, and runtime
//! commands from the HTTP server. The channel replaces the original
//! design's internal pulse pipe.

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};

use switchboard_types::Status;

use crate::master::Job;
use crate::registry::ConnContext;
use crate::ConnId;

/// What goes back to a waiting client: the frame return code and the
/// encoded response body.
#[derive(Debug)]
pub struct Response {
    pub return_code: i32,
    pub body: Bytes,
}

impl Response {
    pub fn status(status: Status) -> Self {
        Self {
            return_code: status.code(),
            body: Bytes::new(),
        }
    }

    pub fn ok(body: BytesMut) -> Self {
        Self {
            return_code: Status::Ok.code(),
            body: body.freeze(),
        }
    }

    /// List replies encode success as the negated entry count.
    pub fn list(count: usize, body: BytesMut) -> Self {
        Self {
            return_code: -(count as i32),
            body: body.freeze(),
        }
    }

    pub fn with_code(return_code: i32, body: Bytes) -> Self {
        Self { return_code, body }
    }
}

pub type ReplySender = oneshot::Sender<Response>;

/// One decoded request frame awaiting its response.
#[derive(Debug)]
pub struct Request {
    pub conn: ConnId,
    pub opcode: u32,
    pub body: Bytes,
    pub reply: ReplySender,
}

/// Status-page sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    Full,
    Servers,
    Clients,
    ConnectNotifications,
    DisconnectNotifications,
    DetachNotifications,
}

#[derive(Debug)]
pub enum BrokerEvent {
    /// A connection finished its AUTH preamble. Cancelling the token
    /// tears the connection task down (stale-slave eviction).
    Connected {
        ctx: ConnContext,
        closer: tokio_util::sync::CancellationToken,
    },
    Request(Request),
    /// The connection is gone; drain its OCB.
    Disconnected(ConnId),
    /// Pulse from the upstream master (via the slave pulse receiver).
    Pulse { code: i32, value: i32 },
    /// The worker established the master link.
    MasterConnected,
    /// The worker lost (or gave up) the master link.
    MasterDisconnected,
    /// A federation job completed, successfully or not.
    JobFinished(Box<Job>),
    /// Render a status-page section.
    Dump {
        kind: DumpKind,
        reply: oneshot::Sender<String>,
    },
    /// Runtime command: drop the master link for good.
    DisconnectMaster,
    /// Runtime command: shut the daemon down.
    Shutdown,
}

pub type EventSender = mpsc::UnboundedSender<BrokerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<BrokerEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
