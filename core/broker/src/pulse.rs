//! Pulse delivery channels.
//!
//! A channel is one socket to a `(node, pid, chid)` target, shared by every
//! notification aimed at that target. Each channel is a small writer task
//! fed through an unbounded sender; the handle is refcounted, and dropping
//! the last handle ends the task and closes the socket.
//!
//! Local targets are reached over a unix socket in the abstract namespace
//! (`\0<pid>/<chid>`), remote targets over TCP (`pid` = IPv4 host order,
//! `chid` = port). Connects happen lazily on the first pulse; a failed
//! connect drops the pulse and is retried for the next one. Pulses are
//! fire-and-forget by contract.

use std::collections::HashMap;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::SocketAddr as UnixSocketAddr;
use std::sync::Arc;
use std::time::Duration;

use switchboard_types::{
    NotificationId, Pulse, LOCAL_NODE_ADDRESS, UNKNOWN_IP_ADDRESS,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Connect budget for remote pulse targets.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Target coordinates of a pulse channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PulseAddr {
    pub nid: u32,
    pub pid: i32,
    pub chid: i32,
}

impl PulseAddr {
    pub fn is_local(&self) -> bool {
        self.nid == LOCAL_NODE_ADDRESS
    }
}

struct Channel {
    tx: mpsc::UnboundedSender<(NotificationId, Pulse)>,
}

/// A refcounted grip on one pulse channel.
#[derive(Clone)]
pub struct PulseHandle {
    inner: Arc<Channel>,
}

impl PulseHandle {
    /// Queues a pulse; delivery failures are the writer task's problem.
    pub fn send(&self, id: NotificationId, pulse: Pulse) {
        let _ = self.inner.tx.send((id, pulse));
    }
}

impl std::fmt::Debug for PulseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PulseHandle").finish_non_exhaustive()
    }
}

/// The channel pool. Weak entries let a channel die with its last handle
/// without the pool having to be told.
#[derive(Debug, Default)]
pub struct PulseChannels {
    channels: HashMap<PulseAddr, std::sync::Weak<Channel>>,
}

impl PulseChannels {
    /// Returns a handle on the channel for `addr`, spawning its writer
    /// task when no live channel exists yet.
    pub fn attach(&mut self, addr: PulseAddr) -> PulseHandle {
        if let Some(existing) = self.channels.get(&addr).and_then(std::sync::Weak::upgrade) {
            return PulseHandle { inner: existing };
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Channel { tx });
        self.channels.insert(addr, Arc::downgrade(&inner));
        tokio::spawn(writer(addr, rx));

        // Opportunistic sweep of channels whose handles are all gone.
        self.channels.retain(|_, weak| weak.strong_count() > 0);

        PulseHandle { inner }
    }

    /// Live channel count, for the status page.
    pub fn len(&self) -> usize {
        self.channels
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum PulseStream {
    Unix(tokio::net::UnixStream),
    Tcp(TcpStream),
}

async fn writer(addr: PulseAddr, mut rx: mpsc::UnboundedReceiver<(NotificationId, Pulse)>) {
    let mut stream: Option<PulseStream> = None;

    while let Some((id, pulse)) = rx.recv().await {
        if stream.is_none() {
            match connect(addr).await {
                Ok(s) => stream = Some(s),
                Err(err) => {
                    warn!("cannot connect pulse channel to {addr:?}: {err}");
                    continue;
                }
            }
        }

        debug!(
            "sending notification -{id}- code:{} value:{}",
            pulse.code, pulse.value
        );
        let bytes = pulse.to_bytes();
        let result = match stream.as_mut().expect("stream was just connected") {
            PulseStream::Unix(s) => s.write_all(&bytes).await,
            PulseStream::Tcp(s) => s.write_all(&bytes).await,
        };
        if let Err(err) = result {
            warn!("error sending notification -{id}-: {err}");
            stream = None;
        }
    }
}

async fn connect(addr: PulseAddr) -> std::io::Result<PulseStream> {
    if addr.is_local() {
        let name = format!("{}/{}", addr.pid, addr.chid);
        let sock_addr = UnixSocketAddr::from_abstract_name(name.as_bytes())?;
        let std_stream = std::os::unix::net::UnixStream::connect_addr(&sock_addr)?;
        std_stream.set_nonblocking(true)?;
        Ok(PulseStream::Unix(tokio::net::UnixStream::from_std(
            std_stream,
        )?))
    } else {
        // The slave may not know its own address; fall back to the peer
        // address the carrying connection was seen under.
        let ip = if addr.pid != UNKNOWN_IP_ADDRESS {
            addr.pid as u32
        } else {
            addr.nid
        };
        let dest = (std::net::Ipv4Addr::from(ip), addr.chid as u16);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(dest))
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
        stream.set_nodelay(true)?;
        Ok(PulseStream::Tcp(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::SocketAddr as StdUnixAddr;
    use tokio::io::AsyncReadExt;

    fn local(pid: i32, chid: i32) -> PulseAddr {
        PulseAddr {
            nid: LOCAL_NODE_ADDRESS,
            pid,
            chid,
        }
    }

    #[tokio::test]
    async fn channels_are_shared_per_target() {
        let mut pool = PulseChannels::default();
        let a = pool.attach(local(1, 2));
        let b = pool.attach(local(1, 2));
        let c = pool.attach(local(1, 3));
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
        assert!(!Arc::ptr_eq(&a.inner, &c.inner));
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn channel_dies_with_its_last_handle() {
        let mut pool = PulseChannels::default();
        let a = pool.attach(local(7, 7));
        let b = a.clone();
        drop(a);
        assert_eq!(pool.len(), 1);
        drop(b);
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn pulse_arrives_at_an_abstract_socket() {
        let pid = std::process::id() as i32;
        let chid = 60_001;
        let name = format!("{pid}/{chid}");
        let listener = std::os::unix::net::UnixListener::bind_addr(
            &StdUnixAddr::from_abstract_name(name.as_bytes()).unwrap(),
        )
        .unwrap();
        listener.set_nonblocking(true).unwrap();
        let listener = tokio::net::UnixListener::from_std(listener).unwrap();

        let mut pool = PulseChannels::default();
        let handle = pool.attach(local(pid, chid));
        handle.send(1, Pulse { code: 5, value: 99 });

        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 8];
        stream.read_exact(&mut buf).await.unwrap();
        let pulse = Pulse::get(&mut &buf[..]).unwrap();
        assert_eq!(pulse, Pulse { code: 5, value: 99 });
    }
}
