//! Socket front-end: acceptors, the AUTH preamble, and the framed
//! request/response loop feeding the broker event channel.
//!
//! Every accepted connection runs in its own task and owns its socket; the
//! broker loop never blocks on client I/O. TCP connections (other brokers)
//! are additionally watched by an inactivity timeout, which the slave's
//! 2 s ping keeps at bay.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::{Bytes, BytesMut};
use switchboard_types::{
    AuthPreamble, Pulse, RequestHeader, ResponseHeader, AUTH_PREAMBLE_LEN, LOCAL_NODE_ADDRESS,
    PULSE_LEN, REQUEST_HEADER_LEN, UNKNOWN_GROUP_ID, UNKNOWN_USER_ID,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::access::SystemGroups;
use crate::broker::Broker;
use crate::config::{Rules, Settings};
use crate::event::{self, BrokerEvent, EventSender, Request};
use crate::federation::SignallingAddress;
use crate::logging::LogControl;
use crate::master;
use crate::http;
use crate::registry::ConnContext;

/// TCP peers must show activity within this window or get dropped.
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(4);

/// Largest request body the front-end accepts.
const MAX_REQUEST_BODY: usize = 1 << 20;

/// Everything needed to bring one broker instance up.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Path of the unix listening socket.
    pub socket_path: PathBuf,
    /// Accept slave brokers over TCP (`-t` / `-b`).
    pub enable_tcp_master: bool,
    /// Specific addresses to bind for the master acceptor; empty binds all.
    pub bind_ips: Vec<Ipv4Addr>,
    /// Upstream master, if this broker is a slave.
    pub master_address: Option<SocketAddr>,
    /// Rules file location (`-f`).
    pub config_file: Option<PathBuf>,
    /// Tree-mode extended id (`-i`).
    pub tree_id: Option<u32>,
    pub use_cache: bool,
    pub async_attach: bool,
    pub master_port: u16,
    pub slave_port: u16,
    /// HTTP status port; 0 picks an ephemeral port.
    pub http_port: u16,
    pub log: LogControl,
}

impl ServerOptions {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            enable_tcp_master: false,
            bind_ips: Vec::new(),
            master_address: None,
            config_file: None,
            tree_id: None,
            use_cache: false,
            async_attach: false,
            master_port: crate::MASTER_PORT,
            slave_port: crate::SLAVE_PORT,
            http_port: crate::HTTP_PORT,
            log: LogControl::disabled(),
        }
    }
}

/// A running broker instance.
pub struct ServerHandle {
    pub shutdown: CancellationToken,
    /// Where the HTTP status page actually listens.
    pub http_addr: SocketAddr,
    pub socket_path: PathBuf,
}

impl ServerHandle {
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

/// Binds all listeners, spawns the broker loop, the master worker and the
/// HTTP server. Returns once the instance accepts connections.
pub async fn start(options: ServerOptions) -> anyhow::Result<ServerHandle> {
    let shutdown = CancellationToken::new();
    let (events, events_rx) = event::channel();

    let mut settings = Settings::resolve(options.tree_id, options.master_address.is_some());
    if options.use_cache && !settings.tree_mode {
        error!("server caching works only in tree mode, caching will be disabled");
    } else {
        settings.use_cache = options.use_cache;
    }
    if options.async_attach && !settings.use_cache {
        error!("async mode is available only when using caching, async mode will be disabled");
    } else {
        settings.async_attach = options.async_attach;
    }

    let mut rules = Rules::load(options.config_file.as_deref());
    rules.set_tree_mode(settings.tree_mode);

    // Stale socket files from a previous run would make bind fail; the
    // lock file already guarantees exclusivity.
    let _ = std::fs::remove_file(&options.socket_path);
    let unix_listener = UnixListener::bind(&options.socket_path)
        .with_context(|| format!("cannot bind to {}", options.socket_path.display()))?;
    // All users may talk to the broker.
    let _ = std::fs::set_permissions(
        &options.socket_path,
        std::os::unix::fs::PermissionsExt::from_mode(0o777),
    );

    let mut sig_addr = SignallingAddress::unset();
    let master = match options.master_address {
        Some(address) => {
            // Pulses from the master arrive on the slave port.
            let pulse_listener =
                TcpListener::bind((Ipv4Addr::UNSPECIFIED, options.slave_port))
                    .await
                    .context("cannot bind slave pulse port")?;
            sig_addr = SignallingAddress {
                pid: switchboard_types::UNKNOWN_IP_ADDRESS,
                chid: options.slave_port as i32,
            };
            tokio::spawn(accept_pulses(pulse_listener, events.clone(), shutdown.clone()));

            Some(master::spawn(address, settings.extended_id, events.clone()))
        }
        None => None,
    };

    // TCP acceptors for slave brokers.
    if options.enable_tcp_master {
        let addrs: Vec<SocketAddr> = if options.bind_ips.is_empty() {
            vec![(Ipv4Addr::UNSPECIFIED, options.master_port).into()]
        } else {
            options
                .bind_ips
                .iter()
                .map(|&ip| (ip, options.master_port).into())
                .collect()
        };
        for addr in addrs {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("cannot bind master acceptor on {addr}"))?;
            info!("accepting slave brokers on {addr}");
            tokio::spawn(accept_tcp(listener, events.clone(), shutdown.clone()));
        }
    }

    let http_addr = http::serve(
        (Ipv4Addr::UNSPECIFIED, options.http_port).into(),
        http::HttpState {
            events: events.clone(),
            log: options.log.clone(),
        },
        shutdown.clone(),
    )
    .await?;

    let broker = Broker::new(
        settings,
        rules,
        sig_addr,
        master,
        Box::new(SystemGroups),
        shutdown.clone(),
    );
    tokio::spawn(broker.run(events_rx));
    tokio::spawn(accept_unix(unix_listener, events, shutdown.clone()));

    info!(
        "servicebroker {} started, mountpoint {}",
        if options.master_address.is_some() {
            "slave"
        } else {
            "master"
        },
        options.socket_path.display()
    );

    Ok(ServerHandle {
        shutdown,
        http_addr,
        socket_path: options.socket_path,
    })
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

async fn accept_unix(listener: UnixListener, events: EventSender, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(run_unix_connection(stream, events.clone(), shutdown.clone()));
                }
                Err(err) => {
                    error!("unix accept failed: {err}");
                    break;
                }
            }
        }
    }
}

async fn accept_tcp(listener: TcpListener, events: EventSender, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("accepted TCP client {peer}");
                    tokio::spawn(run_tcp_connection(stream, events.clone(), shutdown.clone()));
                }
                Err(err) => {
                    error!("tcp accept failed: {err}");
                    break;
                }
            }
        }
    }
}

/// Pulses from the upstream master: raw 8-byte `{code, value}` frames.
async fn accept_pulses(listener: TcpListener, events: EventSender, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(read_pulses(stream, events.clone(), shutdown.clone()));
                }
                Err(err) => {
                    error!("pulse accept failed: {err}");
                    break;
                }
            }
        }
    }
}

async fn read_pulses(mut stream: TcpStream, events: EventSender, shutdown: CancellationToken) {
    let mut buf = [0u8; PULSE_LEN];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            read = stream.read_exact(&mut buf) => {
                match read {
                    Ok(_) => {
                        let Ok(pulse) = Pulse::get(&mut &buf[..]) else { break };
                        debug!("received notification code={} value={}", pulse.code, pulse.value);
                        if events
                            .send(BrokerEvent::Pulse { code: pulse.code, value: pulse.value })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(_) => {
                        debug!("TCP notification interface closed");
                        break;
                    }
                }
            }
        }
    }
}

async fn run_unix_connection(
    stream: UnixStream,
    events: EventSender,
    shutdown: CancellationToken,
) {
    // Kernel credentials are authoritative on the unix transport.
    let cred = match stream.peer_cred() {
        Ok(cred) => cred,
        Err(err) => {
            warn!("cannot read peer credentials: {err}");
            return;
        }
    };

    let conn = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let ctx = ConnContext {
        id: conn,
        pid: cred.pid().unwrap_or(-1),
        uid: cred.uid(),
        gid: cred.gid(),
        node: LOCAL_NODE_ADDRESS,
        local_addr: LOCAL_NODE_ADDRESS,
    };

    run_connection(stream, ctx, events, shutdown, None).await;
}

async fn run_tcp_connection(stream: TcpStream, events: EventSender, shutdown: CancellationToken) {
    let peer = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(_) => return,
    };
    let local = stream.local_addr().ok();
    let node = match peer.ip() {
        std::net::IpAddr::V4(ip) => u32::from(ip),
        std::net::IpAddr::V6(_) => return,
    };
    let local_addr = match local.map(|a| a.ip()) {
        Some(std::net::IpAddr::V4(ip)) => u32::from(ip),
        _ => 0,
    };

    let conn = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let ctx = ConnContext {
        id: conn,
        pid: -1, // replaced by the declared pid from the preamble
        uid: UNKNOWN_USER_ID,
        gid: UNKNOWN_GROUP_ID,
        node,
        local_addr,
    };

    let _ = stream.set_nodelay(true);
    run_connection(stream, ctx, events, shutdown, Some(TCP_IDLE_TIMEOUT)).await;
}

/// The per-connection state machine: AUTH preamble, then framed
/// request/response until either side goes away.
async fn run_connection<S>(
    mut stream: S,
    mut ctx: ConnContext,
    events: EventSender,
    shutdown: CancellationToken,
    idle_timeout: Option<Duration>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut auth = [0u8; AUTH_PREAMBLE_LEN];
    if stream.read_exact(&mut auth).await.is_err() {
        return;
    }
    let preamble = match AuthPreamble::get(&mut &auth[..]) {
        Ok(preamble) => preamble,
        Err(_) => {
            error!("invalid auth preamble, closing connection");
            return;
        }
    };
    if ctx.node != LOCAL_NODE_ADDRESS {
        ctx.pid = preamble.pid;
    }

    let conn = ctx.id;
    let closer = CancellationToken::new();
    if events
        .send(BrokerEvent::Connected {
            ctx,
            closer: closer.clone(),
        })
        .is_err()
    {
        return;
    }

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = closer.cancelled() => break,
            frame = read_frame(&mut stream, idle_timeout) => frame,
        };
        let Some((opcode, body)) = frame else { break };

        let (reply_tx, reply_rx) = oneshot::channel();
        if events
            .send(BrokerEvent::Request(Request {
                conn,
                opcode,
                body,
                reply: reply_tx,
            }))
            .is_err()
        {
            break;
        }

        // A deferred response keeps us parked right here; request and
        // response strictly alternate per connection.
        let response = tokio::select! {
            _ = closer.cancelled() => break,
            response = reply_rx => match response {
                Ok(response) => response,
                Err(_) => break,
            }
        };

        let mut out = BytesMut::with_capacity(16 + response.body.len());
        ResponseHeader {
            size: response.body.len() as u32,
            return_code: response.return_code,
        }
        .put(&mut out);
        out.extend_from_slice(&response.body);
        if stream.write_all(&out).await.is_err() {
            break;
        }
    }

    let _ = events.send(BrokerEvent::Disconnected(conn));
}

/// Reads one request frame; `None` on EOF, protocol violation or idle
/// timeout.
async fn read_frame<S>(stream: &mut S, idle_timeout: Option<Duration>) -> Option<(u32, Bytes)>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; REQUEST_HEADER_LEN];
    let read = match idle_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, stream.read_exact(&mut header)).await
        {
            Ok(read) => read,
            Err(_) => {
                debug!("closing idle TCP connection");
                return None;
            }
        },
        None => stream.read_exact(&mut header).await,
    };
    read.ok()?;

    let header = match RequestHeader::get(&mut &header[..]) {
        Ok(header) => header,
        Err(_) => {
            error!("invalid request frame magic detected, closing connection");
            return None;
        }
    };
    if header.size as usize > MAX_REQUEST_BODY {
        error!("oversized request frame ({} bytes), closing connection", header.size);
        return None;
    }

    let mut body = vec![0u8; header.size as usize];
    stream.read_exact(&mut body).await.ok()?;
    Some((header.command, Bytes::from(body)))
}
