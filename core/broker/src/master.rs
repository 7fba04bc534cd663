//! Master adapter: the slave side of the federation link.
//!
//! One worker task owns the TCP socket to the upstream master and executes
//! queued jobs strictly synchronously against it. The dispatcher enqueues
//! jobs through [`MasterHandle::eval`]; every completion, connect and
//! disconnect travels back to the dispatcher as a broker event.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use regex::Regex;
use switchboard_types::{
    AuthPreamble, Command, RequestHeader, ResponseHeader, Status, REQUEST_HEADER_LEN,
    RESPONSE_HEADER_LEN,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::event::{BrokerEvent, EventSender, ReplySender};
use crate::ConnId;

/// Send budget towards the master.
pub const SEND_TIMEOUT: Duration = Duration::from_millis(2000);
/// Receive budget for a master response.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(5000);
/// Idle interval after which the link is pinged warm.
pub const PING_INTERVAL: Duration = Duration::from_millis(2000);
/// Pause between reconnect attempts.
pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(200);

/// Completion state of a federation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Ok,
    /// The link failed while the job was pending or on the wire.
    Io,
    /// The master's answer did not fit the request (list overflow).
    Invalid,
    /// The dispatcher found the completion inconsistent with its state.
    Internal,
}

/// A reply sender parked while its request runs against the master.
#[derive(Debug)]
pub struct DeferredReply {
    pub conn: ConnId,
    pub reply: ReplySender,
}

/// One queued request against the upstream master.
#[derive(Debug)]
pub struct Job {
    /// Correlation value, command specific: pending-request id, pool id,
    /// local notification id or list capacity.
    pub cookie: i32,
    pub cmd: Command,
    /// Encoded request body.
    pub request: Bytes,
    /// Raw response body as received from the master.
    pub response: Bytes,
    /// Return code from the master, count-normalized to positive.
    pub ret: i32,
    pub status: JobStatus,
    /// Compiled pattern for MATCH_INTERFACELIST completions.
    pub regex: Option<Regex>,
    /// Set when a client connection waits for this job's outcome.
    pub deferred: Option<DeferredReply>,
}

impl Job {
    pub fn new(cookie: i32, cmd: Command, request: Bytes) -> Box<Self> {
        Box::new(Self {
            cookie,
            cmd,
            request,
            response: Bytes::new(),
            ret: 0,
            status: JobStatus::Ok,
            regex: None,
            deferred: None,
        })
    }

    pub fn with_deferred(mut self: Box<Self>, conn: ConnId, reply: ReplySender) -> Box<Self> {
        self.deferred = Some(DeferredReply { conn, reply });
        self
    }

    pub fn with_regex(mut self: Box<Self>, regex: Regex) -> Box<Self> {
        self.regex = Some(regex);
        self
    }
}

/// The dispatcher's grip on the worker.
#[derive(Clone)]
pub struct MasterHandle {
    address: SocketAddr,
    jobs: mpsc::UnboundedSender<Box<Job>>,
    connected: Arc<AtomicBool>,
    queue_size: Arc<AtomicUsize>,
    queue_total: Arc<AtomicU32>,
    stop: CancellationToken,
}

impl MasterHandle {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Enqueues a job; the worker picks it up on its next wakeup.
    pub fn eval(&self, job: Box<Job>) {
        self.queue_size.fetch_add(1, Ordering::Relaxed);
        self.queue_total.fetch_add(1, Ordering::Relaxed);
        let _ = self.jobs.send(job);
    }

    /// Tears the link down for good (`disconnect=m` runtime command).
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size.load(Ordering::Relaxed)
    }

    pub fn queue_total(&self) -> u32 {
        self.queue_total.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for MasterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterHandle")
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Spawns the worker task and returns the dispatcher handle.
pub fn spawn(address: SocketAddr, extended_id: u32, events: EventSender) -> MasterHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = MasterHandle {
        address,
        jobs: tx,
        connected: Arc::new(AtomicBool::new(false)),
        queue_size: Arc::new(AtomicUsize::new(0)),
        queue_total: Arc::new(AtomicU32::new(0)),
        stop: CancellationToken::new(),
    };

    let worker = Worker {
        address,
        extended_id,
        events,
        connected: handle.connected.clone(),
        queue_size: handle.queue_size.clone(),
        stop: handle.stop.clone(),
    };
    tokio::spawn(worker.run(rx));

    handle
}

struct Worker {
    address: SocketAddr,
    extended_id: u32,
    events: EventSender,
    connected: Arc<AtomicBool>,
    queue_size: Arc<AtomicUsize>,
    stop: CancellationToken,
}

impl Worker {
    async fn run(self, mut jobs: mpsc::UnboundedReceiver<Box<Job>>) {
        debug!("master worker running, upstream {}", self.address);

        'life: loop {
            // Disconnected: fail whatever queued up, then try to connect.
            let mut stream = loop {
                if self.stop.is_cancelled() {
                    break 'life;
                }
                self.drain_pending(&mut jobs);

                match self.connect().await {
                    Ok(stream) => {
                        self.connected.store(true, Ordering::Relaxed);
                        let _ = self.events.send(BrokerEvent::MasterConnected);
                        break stream;
                    }
                    Err(err) => {
                        debug!("master connect failed: {err}");
                        tokio::select! {
                            _ = self.stop.cancelled() => break 'life,
                            _ = tokio::time::sleep(RECONNECT_INTERVAL) => {}
                        }
                    }
                }
            };

            // Connected: execute jobs as they come, ping when idle.
            loop {
                let healthy = tokio::select! {
                    _ = self.stop.cancelled() => break 'life,
                    next = timeout(PING_INTERVAL, jobs.recv()) => match next {
                        Ok(Some(job)) => {
                            self.queue_size.fetch_sub(1, Ordering::Relaxed);
                            self.execute(&mut stream, job).await
                        }
                        Ok(None) => break 'life,
                        Err(_) => self.ping(&mut stream).await,
                    },
                };

                if !healthy {
                    self.connected.store(false, Ordering::Relaxed);
                    let _ = self.events.send(BrokerEvent::MasterDisconnected);
                    break;
                }
            }
        }

        if self.connected.swap(false, Ordering::Relaxed) {
            let _ = self.events.send(BrokerEvent::MasterDisconnected);
        }
        self.drain_pending(&mut jobs);
        info!("master worker stopped");
    }

    /// Fails all queued jobs; error handling happens on the dispatcher.
    fn drain_pending(&self, jobs: &mut mpsc::UnboundedReceiver<Box<Job>>) {
        while let Ok(mut job) = jobs.try_recv() {
            self.queue_size.fetch_sub(1, Ordering::Relaxed);
            job.status = JobStatus::Io;
            let _ = self.events.send(BrokerEvent::JobFinished(job));
        }
    }

    async fn connect(&self) -> std::io::Result<TcpStream> {
        let mut stream = timeout(SEND_TIMEOUT, TcpStream::connect(self.address))
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
        stream.set_nodelay(true)?;

        // Auth preamble, then identify ourselves with the id ping.
        let mut buf = BytesMut::with_capacity(32);
        AuthPreamble {
            pid: std::process::id() as i32,
        }
        .put(&mut buf);
        timeout(SEND_TIMEOUT, stream.write_all(&buf))
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;

        let mut body = BytesMut::new();
        switchboard_types::wire::MasterPingId {
            sb_version: protocol_version(),
            extended_id: self.extended_id,
        }
        .put(&mut body);
        let (_ret, _body) =
            round_trip(&mut stream, Command::MasterPingId, body.freeze()).await?;
        Ok(stream)
    }

    async fn ping(&self, stream: &mut TcpStream) -> bool {
        match round_trip(stream, Command::MasterPing, Bytes::new()).await {
            Ok(_) => true,
            Err(err) => {
                error!("master ping failed: {err}");
                false
            }
        }
    }

    /// Runs one job over the link and reports it back, whatever happened.
    async fn execute(&self, stream: &mut TcpStream, mut job: Box<Job>) -> bool {
        let result = round_trip(stream, job.cmd, job.request.clone()).await;

        let healthy = match result {
            Ok((ret, body)) => {
                // Negative return codes carry list entry counts.
                job.ret = if ret < 0 { -ret } else { ret };
                if job.cmd.is_list() && job.ret == Status::BadArgument.code() {
                    job.status = JobStatus::Invalid;
                }
                job.response = body;
                true
            }
            Err(err) => {
                error!("master communication failed: {err}");
                job.status = JobStatus::Io;
                false
            }
        };

        let _ = self.events.send(BrokerEvent::JobFinished(job));
        healthy
    }
}

fn protocol_version() -> switchboard_types::InterfaceVersion {
    switchboard_types::InterfaceVersion::new(
        switchboard_types::PROTOCOL_MAJOR,
        switchboard_types::PROTOCOL_MINOR,
    )
}

/// One synchronous request/response over the master link.
async fn round_trip(
    stream: &mut TcpStream,
    cmd: Command,
    body: Bytes,
) -> std::io::Result<(i32, Bytes)> {
    let mut frame = BytesMut::with_capacity(REQUEST_HEADER_LEN + body.len());
    RequestHeader {
        size: body.len() as u32,
        command: cmd.opcode(),
    }
    .put(&mut frame);
    frame.extend_from_slice(&body);

    timeout(SEND_TIMEOUT, stream.write_all(&frame))
        .await
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;

    let mut header = [0u8; RESPONSE_HEADER_LEN];
    timeout(RECV_TIMEOUT, stream.read_exact(&mut header))
        .await
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
    let header = ResponseHeader::get(&mut &header[..])
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidData))?;

    let mut body = vec![0u8; header.size as usize];
    timeout(RECV_TIMEOUT, stream.read_exact(&mut body))
        .await
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;

    Ok((header.return_code, Bytes::from(body)))
}
