//! Shared harness for the integration suites: a minimal wire client, a
//! pulse listener and broker bootstrap helpers.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::os::linux::net::SocketAddrExt;
use std::path::PathBuf;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use switchboard_broker::server::{self, ServerHandle, ServerOptions};
use switchboard_types::wire::{
    self, AttachExtendedReply, ConnectionInfo,
};
use switchboard_types::{
    AuthPreamble, Command, ImplVersion, InterfaceDescription, InterfaceVersion, NotificationId,
    PartyId, Pulse, PulseInfo, RequestHeader, ResponseHeader, Status, PROTOCOL_MAJOR,
    PROTOCOL_MINOR, PULSE_LEN, RESPONSE_HEADER_LEN,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

pub fn sb_version() -> InterfaceVersion {
    InterfaceVersion::new(PROTOCOL_MAJOR, PROTOCOL_MINOR)
}

/// Grabs a currently free TCP port.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Boots a standalone (master-role) broker on a temp mountpoint.
pub async fn start_broker(dir: &tempfile::TempDir) -> ServerHandle {
    let mut options = ServerOptions::new(dir.path().join("servicebroker"));
    options.http_port = 0;
    server::start(options).await.expect("broker starts")
}

pub async fn start_with(options: ServerOptions) -> ServerHandle {
    server::start(options).await.expect("broker starts")
}

/// A test application speaking the broker wire protocol.
pub struct TestClient {
    stream: UnixStream,
}

impl TestClient {
    pub async fn connect(handle: &ServerHandle) -> Self {
        Self::connect_path(&handle.socket_path).await
    }

    pub async fn connect_path(path: &PathBuf) -> Self {
        let mut stream = UnixStream::connect(path).await.expect("broker reachable");
        let mut buf = BytesMut::new();
        AuthPreamble {
            pid: std::process::id() as i32,
        }
        .put(&mut buf);
        stream.write_all(&buf).await.unwrap();
        Self { stream }
    }

    /// One framed request/response round trip.
    pub async fn request(&mut self, cmd: Command, body: Bytes) -> (i32, Bytes) {
        let mut frame = BytesMut::new();
        RequestHeader {
            size: body.len() as u32,
            command: cmd.opcode(),
        }
        .put(&mut frame);
        frame.extend_from_slice(&body);
        self.stream.write_all(&frame).await.unwrap();

        let mut header = [0u8; RESPONSE_HEADER_LEN];
        self.stream.read_exact(&mut header).await.unwrap();
        let header = ResponseHeader::get(&mut &header[..]).unwrap();
        let mut body = vec![0u8; header.size as usize];
        self.stream.read_exact(&mut body).await.unwrap();
        (header.return_code, Bytes::from(body))
    }

    pub async fn register(
        &mut self,
        name: &str,
        major: u16,
        minor: u16,
        pid: i32,
        chid: i32,
    ) -> Result<PartyId, i32> {
        let mut body = BytesMut::new();
        wire::RegisterInterface {
            sb_version: sb_version(),
            iface: InterfaceDescription::new(name, major, minor),
            impl_version: ImplVersion::default(),
            chid,
            pid,
        }
        .put(&mut body);
        let (ret, body) = self.request(Command::RegisterInterface, body.freeze()).await;
        if ret != 0 {
            return Err(ret);
        }
        Ok(wire::ServerIdReply::get(&mut body.clone()).unwrap().server_id)
    }

    pub async fn unregister(&mut self, server_id: PartyId) -> i32 {
        let mut body = BytesMut::new();
        wire::UnregisterInterface {
            sb_version: sb_version(),
            server_id,
        }
        .put(&mut body);
        self.request(Command::UnregisterInterface, body.freeze())
            .await
            .0
    }

    pub async fn attach(
        &mut self,
        name: &str,
        major: u16,
        minor: u16,
    ) -> Result<ConnectionInfo, i32> {
        let mut body = BytesMut::new();
        wire::AttachInterface {
            sb_version: sb_version(),
            iface: InterfaceDescription::new(name, major, minor),
        }
        .put(&mut body);
        let (ret, body) = self.request(Command::AttachInterface, body.freeze()).await;
        if ret != 0 {
            return Err(ret);
        }
        Ok(ConnectionInfo::get(&mut body.clone()).unwrap())
    }

    pub async fn attach_extended(
        &mut self,
        name: &str,
        major: u16,
        minor: u16,
        pulse: PulseInfo,
    ) -> (i32, Option<AttachExtendedReply>) {
        let mut body = BytesMut::new();
        wire::AttachInterfaceExtended {
            sb_version: sb_version(),
            pulse,
            iface: InterfaceDescription::new(name, major, minor),
        }
        .put(&mut body);
        let (ret, body) = self
            .request(Command::AttachInterfaceExtended, body.freeze())
            .await;
        let reply = AttachExtendedReply::get(&mut body.clone()).ok();
        (ret, reply)
    }

    pub async fn detach(&mut self, client_id: PartyId) -> i32 {
        let mut body = BytesMut::new();
        wire::DetachInterface {
            sb_version: sb_version(),
            client_id,
        }
        .put(&mut body);
        self.request(Command::DetachInterface, body.freeze()).await.0
    }

    pub async fn notify_server_available(
        &mut self,
        name: &str,
        major: u16,
        minor: u16,
        pulse: PulseInfo,
    ) -> Result<NotificationId, i32> {
        let mut body = BytesMut::new();
        wire::NotifyServerAvailable {
            sb_version: sb_version(),
            pulse,
            iface: InterfaceDescription::new(name, major, minor),
        }
        .put(&mut body);
        let (ret, body) = self
            .request(Command::NotifyServerAvailable, body.freeze())
            .await;
        if ret != 0 {
            return Err(ret);
        }
        Ok(wire::NotificationIdReply::get(&mut body.clone())
            .unwrap()
            .notification_id)
    }

    pub async fn notify_server_disconnect(
        &mut self,
        server_id: PartyId,
        pulse: PulseInfo,
    ) -> Result<NotificationId, i32> {
        let mut body = BytesMut::new();
        wire::NotifyServerDisconnect {
            sb_version: sb_version(),
            server_id,
            pulse,
        }
        .put(&mut body);
        let (ret, body) = self
            .request(Command::NotifyServerDisconnect, body.freeze())
            .await;
        if ret != 0 {
            return Err(ret);
        }
        Ok(wire::NotificationIdReply::get(&mut body.clone())
            .unwrap()
            .notification_id)
    }

    pub async fn clear_notification(&mut self, id: NotificationId) -> i32 {
        let mut body = BytesMut::new();
        wire::ClearNotification {
            sb_version: sb_version(),
            notification_id: id,
        }
        .put(&mut body);
        self.request(Command::ClearNotification, body.freeze())
            .await
            .0
    }

    pub async fn match_interface_list(
        &mut self,
        pattern: &str,
        in_count: u32,
    ) -> Result<Vec<InterfaceDescription>, i32> {
        let mut body = BytesMut::new();
        wire::MatchInterfaceList {
            sb_version: sb_version(),
            in_count,
            regex: pattern.to_owned(),
        }
        .put(&mut body);
        let (ret, body) = self
            .request(Command::MatchInterfaceList, body.freeze())
            .await;
        if ret > 0 {
            return Err(ret);
        }
        let count = (-ret) as usize;
        Ok(wire::get_interfaces(&mut body.clone(), count).unwrap())
    }

    pub async fn get_interface_list(
        &mut self,
        in_count: u32,
    ) -> Result<Vec<InterfaceDescription>, i32> {
        let mut body = BytesMut::new();
        wire::GetInterfaceList {
            sb_version: sb_version(),
            in_count,
        }
        .put(&mut body);
        let (ret, body) = self.request(Command::GetInterfaceList, body.freeze()).await;
        if ret > 0 {
            return Err(ret);
        }
        let count = (-ret) as usize;
        Ok(wire::get_interfaces(&mut body.clone(), count).unwrap())
    }
}

/// Receives pulses on the abstract unix socket a broker derives from
/// `(pid, chid)`.
pub struct PulseListener {
    listener: UnixListener,
    stream: Option<UnixStream>,
    pub pid: i32,
    pub chid: i32,
}

impl PulseListener {
    /// Binds with this process' pid and the given channel id.
    pub fn bind(chid: i32) -> Self {
        let pid = std::process::id() as i32;
        let name = format!("{pid}/{chid}");
        let listener = std::os::unix::net::UnixListener::bind_addr(
            &std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes()).unwrap(),
        )
        .unwrap();
        listener.set_nonblocking(true).unwrap();
        Self {
            listener: UnixListener::from_std(listener).unwrap(),
            stream: None,
            pid,
            chid,
        }
    }

    pub fn pulse_info(&self, code: i32, value: i32) -> PulseInfo {
        PulseInfo {
            code,
            value,
            chid: self.chid,
            pid: self.pid,
        }
    }

    /// Awaits the next pulse, transparently re-accepting when the broker
    /// cycles its channel connection.
    pub async fn recv(&mut self) -> Pulse {
        loop {
            if self.stream.is_none() {
                let (stream, _) = self.listener.accept().await.unwrap();
                self.stream = Some(stream);
            }
            let mut buf = [0u8; PULSE_LEN];
            match self.stream.as_mut().unwrap().read_exact(&mut buf).await {
                Ok(_) => {
                    let mut slice = &buf[..];
                    return Pulse {
                        code: slice.get_i32_le(),
                        value: slice.get_i32_le(),
                    };
                }
                Err(_) => self.stream = None,
            }
        }
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Pulse> {
        tokio::time::timeout(timeout, self.recv()).await.ok()
    }
}

/// Polls an expression until it yields `Some` or the budget runs out.
#[macro_export]
macro_rules! eventually {
    ($probe:expr) => {{
        let mut result = None;
        for _ in 0..100 {
            if let Some(value) = $probe {
                result = Some(value);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        result.expect("condition not reached in time")
    }};
}

/// Options for a tree-mode slave broker pointed at a master on
/// `master_port`. Tree mode forwards nothing by default, so the slave
/// gets a forward-all rules file unless the test overrides it.
pub fn slave_options(
    dir: &tempfile::TempDir,
    master_port: u16,
    slave_port: u16,
    tree_id: u32,
) -> ServerOptions {
    let rules_path = dir.path().join("servicebroker.cfg");
    std::fs::write(&rules_path, "[FORWARD]\n*\n").unwrap();

    let mut options = ServerOptions::new(dir.path().join("servicebroker-slave"));
    options.master_address = Some(SocketAddr::from(([127, 0, 0, 1], master_port)));
    options.slave_port = slave_port;
    options.tree_id = Some(tree_id);
    options.config_file = Some(rules_path);
    options.http_port = 0;
    options
}

/// Options for a master broker accepting slaves on `master_port`.
pub fn master_options(dir: &tempfile::TempDir, master_port: u16) -> ServerOptions {
    let mut options = ServerOptions::new(dir.path().join("servicebroker-master"));
    options.enable_tcp_master = true;
    options.bind_ips = vec![std::net::Ipv4Addr::LOCALHOST];
    options.master_port = master_port;
    options.http_port = 0;
    options
}

pub fn code_of(status: Status) -> i32 {
    status.code()
}
