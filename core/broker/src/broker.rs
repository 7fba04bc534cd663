//! The broker core: one event-loop task owning every registry table.
//!
//! All request handling and registry mutation happens here, which is the
//! sole reason the daemon needs no locking around its state. Connection
//! tasks, the master worker and the HTTP server only ever talk to this
//! loop through [`BrokerEvent`]s.

use std::collections::HashMap;

use bytes::BytesMut;
use switchboard_types::wire::{
    self, ChannelInfo, ConnectionInfo, ServerInfo,
};
use switchboard_types::{
    protocol_compatible, Command, InterfaceDescription, InterfaceVersion, NotificationId, PartyId,
    PulseInfo, Status, INVALID_NOTIFICATION_ID, LOCAL_IP_ADDRESS, PROTOCOL_MAJOR, PROTOCOL_MINOR,
    UNKNOWN_GROUP_ID,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::access::{check_access, GroupAccess};
use crate::config::{Rules, Settings};
use crate::event::{
    BrokerEvent, DumpKind, EventReceiver, ReplySender, Request, Response,
};
use crate::federation::SignallingAddress;
use crate::master::{Job, MasterHandle};
use crate::notify::{Notification, NotificationList, NotificationPool, PoolDetach};
use crate::pulse::{PulseAddr, PulseChannels, PulseHandle};
use crate::registry::{
    ClientTable, ConnContext, Ocb, RemoteServerCache, ServerEntry, ServerTable, Upstream,
};
use crate::ConnId;

/// A client parked on a pool whose probe is already in flight.
#[derive(Debug)]
pub(crate) struct PoolWaiter {
    pub conn: ConnId,
    pub reply: ReplySender,
    pub notification_id: NotificationId,
}

/// Per-connection state the loop keeps next to the OCB.
#[derive(Debug)]
pub(crate) struct Connection {
    pub ocb: Ocb,
    /// Cancelling this tears the connection task down.
    pub closer: CancellationToken,
}

pub struct Broker {
    pub(crate) settings: Settings,
    pub(crate) rules: Rules,
    pub(crate) sig_addr: SignallingAddress,
    pub(crate) master: Option<MasterHandle>,
    pub(crate) groups: Box<dyn GroupAccess>,
    shutdown: CancellationToken,

    pub(crate) servers: ServerTable,
    pub(crate) clients: ClientTable,
    pub(crate) cache: RemoteServerCache,
    pub(crate) connect_notifications: NotificationList,
    pub(crate) disconnect_notifications: NotificationList,
    pub(crate) detach_notifications: NotificationList,
    pub(crate) list_change_notifications: NotificationList,
    pub(crate) pools: NotificationPool,
    pub(crate) connections: HashMap<ConnId, Connection>,
    pub(crate) pulses: PulseChannels,

    /// Deferred attach / server-information requests, keyed by job cookie.
    pub(crate) pending_remote: HashMap<u32, InterfaceDescription>,
    /// Deferred attach-extended jobs: cookie → main notification id.
    pub(crate) pending_attach_extended: HashMap<u32, NotificationId>,
    /// Clients waiting on a PRECACHING pool's in-flight probe.
    pub(crate) pool_waiters: HashMap<u32, Vec<PoolWaiter>>,

    next_client_id: u32,
    next_server_id: u32,
    next_notification_id: NotificationId,
    pub(crate) next_pending_id: u32,
}

impl Broker {
    pub fn new(
        settings: Settings,
        rules: Rules,
        sig_addr: SignallingAddress,
        master: Option<MasterHandle>,
        groups: Box<dyn GroupAccess>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            settings,
            rules,
            sig_addr,
            master,
            groups,
            shutdown,
            servers: ServerTable::default(),
            clients: ClientTable::default(),
            cache: RemoteServerCache::default(),
            connect_notifications: NotificationList::default(),
            disconnect_notifications: NotificationList::default(),
            detach_notifications: NotificationList::default(),
            list_change_notifications: NotificationList::default(),
            pools: NotificationPool::default(),
            connections: HashMap::new(),
            pulses: PulseChannels::default(),
            pending_remote: HashMap::new(),
            pending_attach_extended: HashMap::new(),
            pool_waiters: HashMap::new(),
            next_client_id: 100_001,
            next_server_id: 500_001,
            next_notification_id: 1,
            next_pending_id: 1,
        }
    }

    /// Consumes events until shutdown.
    pub async fn run(mut self, mut events: EventReceiver) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                }
            }
        }
        info!("broker loop stopped");
    }

    fn handle_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected { ctx, closer } => self.register_connection(ctx, closer),
            BrokerEvent::Request(request) => self.dispatch(request),
            BrokerEvent::Disconnected(conn) => self.handle_disconnected(conn),
            BrokerEvent::Pulse { code, value } => self.dispatch_pulse(code, value),
            BrokerEvent::MasterConnected => self.handle_master_connected(),
            BrokerEvent::MasterDisconnected => self.handle_master_disconnected(),
            BrokerEvent::JobFinished(job) => self.handle_job_finished(job),
            BrokerEvent::Dump { kind, reply } => {
                let _ = reply.send(self.dump(kind));
            }
            BrokerEvent::DisconnectMaster => {
                if let Some(master) = &self.master {
                    info!("disconnecting master by request");
                    master.stop();
                }
            }
            BrokerEvent::Shutdown => {
                info!("received shutdown command");
                self.shutdown.cancel();
            }
        }
    }

    pub(crate) fn register_connection(&mut self, ctx: ConnContext, closer: CancellationToken) {
        self.connections.insert(
            ctx.id,
            Connection {
                ocb: Ocb::new(ctx),
                closer,
            },
        );
    }

    // -----------------------------------------------------------------
    // Request dispatch
    // -----------------------------------------------------------------

    fn dispatch(&mut self, request: Request) {
        let Request {
            conn,
            opcode,
            body,
            reply,
        } = request;

        if !self.connections.contains_key(&conn) {
            return; // connection raced its own teardown
        }

        let Some(cmd) = Command::from_opcode(opcode) else {
            warn!("unknown opcode {opcode}");
            let _ = reply.send(Response::status(Status::UnknownCommand));
            return;
        };

        if cmd == Command::MasterPing {
            self.ocb_mut(conn).slave = true;
            let _ = reply.send(Response::status(Status::Ok));
            return;
        }

        // Every other request starts with the protocol version.
        match InterfaceVersion::get(&mut body.clone()) {
            Ok(version) if protocol_compatible(version) => {}
            Ok(version) => {
                error!(
                    "bad protocol version {version} (expected {PROTOCOL_MAJOR}.{PROTOCOL_MINOR})"
                );
                let _ = reply.send(Response::status(Status::BadFoundationVersion));
                return;
            }
            Err(_) => {
                let _ = reply.send(Response::status(Status::BadFoundationVersion));
                return;
            }
        }

        let mut reply = Some(reply);
        let buf = &mut body.clone();
        let response = match cmd {
            Command::RegisterInterface => match wire::RegisterInterface::get(buf) {
                Ok(arg) => Some(self.handle_register_interface(conn, arg)),
                Err(_) => Some(Response::status(Status::BadArgument)),
            },
            Command::RegisterInterfaceEx => match wire::RegisterInterfaceEx::get(buf) {
                Ok(arg) => Some(self.handle_register_interface_ex(conn, arg)),
                Err(_) => Some(Response::status(Status::BadArgument)),
            },
            Command::RegisterInterfaceGroupId => match wire::RegisterInterfaceGroupId::get(buf) {
                Ok(arg) => Some(self.handle_register_interface_group_id(conn, arg)),
                Err(_) => Some(Response::status(Status::BadArgument)),
            },
            Command::RegisterMasterInterfaceEx => match wire::RegisterMasterInterfaceEx::get(buf) {
                Ok(arg) => Some(self.handle_register_master_interface(conn, arg)),
                Err(_) => Some(Response::status(Status::BadArgument)),
            },
            Command::UnregisterInterface => match wire::UnregisterInterface::get(buf) {
                Ok(arg) => Some(self.handle_unregister_interface(conn, arg)),
                Err(_) => Some(Response::status(Status::BadArgument)),
            },
            Command::AttachInterface => match wire::AttachInterface::get(buf) {
                Ok(arg) => self.handle_attach_interface(conn, arg, &mut reply),
                Err(_) => Some(Response::status(Status::BadArgument)),
            },
            Command::AttachInterfaceExtended => match wire::AttachInterfaceExtended::get(buf) {
                Ok(arg) => self.handle_attach_interface_extended(conn, arg, &mut reply),
                Err(_) => Some(Response::status(Status::BadArgument)),
            },
            Command::GetServerInformation => match wire::AttachInterface::get(buf) {
                Ok(arg) => self.handle_get_server_information(conn, arg, &mut reply),
                Err(_) => Some(Response::status(Status::BadArgument)),
            },
            Command::DetachInterface => match wire::DetachInterface::get(buf) {
                Ok(arg) => self.handle_detach_interface(conn, arg, &mut reply),
                Err(_) => Some(Response::status(Status::BadArgument)),
            },
            Command::NotifyServerDisconnect => match wire::NotifyServerDisconnect::get(buf) {
                Ok(arg) => Some(self.handle_notify_server_disconnect(conn, arg)),
                Err(_) => Some(Response::status(Status::BadArgument)),
            },
            Command::NotifyServerAvailable => match wire::NotifyServerAvailable::get(buf) {
                Ok(arg) => Some(self.handle_notify_server_available(conn, arg)),
                Err(_) => Some(Response::status(Status::BadArgument)),
            },
            Command::NotifyServerAvailableEx => match wire::NotifyServerAvailableEx::get(buf) {
                Ok(arg) => Some(self.handle_notify_server_available_ex(conn, arg)),
                Err(_) => Some(Response::status(Status::BadArgument)),
            },
            Command::NotifyClientDetach => match wire::NotifyClientDetach::get(buf) {
                Ok(arg) => Some(self.handle_notify_client_detach(conn, arg)),
                Err(_) => Some(Response::status(Status::BadArgument)),
            },
            Command::ClearNotification => match wire::ClearNotification::get(buf) {
                Ok(arg) => Some(self.handle_clear_notification(conn, arg)),
                Err(_) => Some(Response::status(Status::BadArgument)),
            },
            Command::GetInterfaceList => match wire::GetInterfaceList::get(buf) {
                Ok(arg) => self.handle_get_interface_list(conn, arg, &mut reply),
                Err(_) => Some(Response::status(Status::BadArgument)),
            },
            Command::MatchInterfaceList => match wire::MatchInterfaceList::get(buf) {
                Ok(arg) => self.handle_match_interface_list(conn, arg, &mut reply),
                Err(_) => Some(Response::status(Status::BadArgument)),
            },
            Command::NotifyInterfaceListChange => {
                match wire::NotifyInterfaceListChange::get(buf) {
                    Ok(arg) => Some(self.handle_notify_interface_list_change(conn, arg)),
                    Err(_) => Some(Response::status(Status::BadArgument)),
                }
            }
            Command::NotifyInterfaceListMatch => match wire::NotifyInterfaceListMatch::get(buf) {
                Ok(arg) => Some(self.handle_notify_interface_list_match(conn, arg)),
                Err(_) => Some(Response::status(Status::BadArgument)),
            },
            Command::MasterPingId => match wire::MasterPingId::get(buf) {
                Ok(arg) => Some(self.handle_master_ping_id(conn, arg)),
                Err(_) => Some(Response::status(Status::BadArgument)),
            },
            Command::MasterPing => unreachable!("handled above"),
        };

        match response {
            Some(response) => {
                if let Some(reply) = reply.take() {
                    let _ = reply.send(response);
                }
            }
            None => debug_assert!(reply.is_none(), "deferred handler must take the reply"),
        }
    }

    // -----------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------

    fn handle_register_interface(
        &mut self,
        conn: ConnId,
        arg: wire::RegisterInterface,
    ) -> Response {
        let is_local = self.rules.is_local_service(&arg.iface.name);
        debug!(
            "*[{conn}] REGISTER_INTERFACE {}{}",
            arg.iface,
            if is_local { " [LOCAL]" } else { "" }
        );

        if !arg.iface.is_valid() {
            return Response::status(Status::BadArgument);
        }
        if !self.ctx(conn).is_local() {
            error!("REGISTER_INTERFACE not called from local node");
            return Response::status(Status::BadArgument);
        }

        let added = self.add_interface(
            conn,
            arg.iface.clone(),
            arg.pid,
            arg.chid,
            arg.impl_version,
            is_local,
            UNKNOWN_GROUP_ID,
        );
        self.register_interfaces_master();

        match added {
            Some(server_id) => {
                debug!(" SERVER_ID {server_id}");
                self.notify_list_changed(&[arg.iface.name.as_str()]);
                let mut body = BytesMut::new();
                wire::ServerIdReply { server_id }.put(&mut body);
                Response::ok(body)
            }
            None => Response::status(Status::InterfaceAlreadyRegistered),
        }
    }

    fn handle_register_interface_ex(
        &mut self,
        conn: ConnId,
        arg: wire::RegisterInterfaceEx,
    ) -> Response {
        debug!("*[{conn}] REGISTER_INTERFACE_EX ({} interfaces)", arg.interfaces.len());

        if !self.ctx(conn).is_local() {
            error!("REGISTER_INTERFACE_EX not called from local node");
            return Response::status(Status::BadArgument);
        }

        let mut body = BytesMut::new();
        let mut changed = Vec::new();
        for iface in arg.interfaces {
            let is_local = self.rules.is_local_service(&iface.name);
            let server_id = if iface.is_valid() {
                self.add_interface(
                    conn,
                    iface.clone(),
                    arg.pid,
                    arg.chid,
                    arg.impl_version,
                    is_local,
                    UNKNOWN_GROUP_ID,
                )
            } else {
                None
            };

            match server_id {
                Some(id) => {
                    debug!(" ADDING INTERFACE {iface}: {id}");
                    id.put(&mut body);
                    changed.push(iface.name);
                }
                None => PartyId::invalid_for(u32::MAX).put(&mut body),
            }
        }

        self.register_interfaces_master();
        let names: Vec<&str> = changed.iter().map(String::as_str).collect();
        self.notify_list_changed(&names);
        Response::ok(body)
    }

    fn handle_register_interface_group_id(
        &mut self,
        conn: ConnId,
        arg: wire::RegisterInterfaceGroupId,
    ) -> Response {
        let register = arg.register;
        let is_local = self.rules.is_local_service(&register.iface.name);
        debug!(
            "*[{conn}] REGISTER_INTERFACE_GROUPID {} - group {}",
            register.iface, arg.gid
        );

        if !register.iface.is_valid() {
            return Response::status(Status::BadArgument);
        }
        if !self.ctx(conn).is_local() {
            error!("REGISTER_INTERFACE_GROUPID not called from local node");
            return Response::status(Status::BadArgument);
        }

        let added = self.add_interface(
            conn,
            register.iface.clone(),
            register.pid,
            register.chid,
            register.impl_version,
            is_local,
            arg.gid as u32,
        );
        self.register_interfaces_master();

        match added {
            Some(server_id) => {
                self.notify_list_changed(&[register.iface.name.as_str()]);
                let mut body = BytesMut::new();
                wire::ServerIdReply { server_id }.put(&mut body);
                Response::ok(body)
            }
            None => Response::status(Status::InterfaceAlreadyRegistered),
        }
    }

    /// Batched registration arriving from a slave broker: each entry
    /// becomes a remote server keyed to the slave's connection. Failed
    /// entries answer with an all-ones extended id so the slave can
    /// correlate by local id.
    fn handle_register_master_interface(
        &mut self,
        conn: ConnId,
        arg: wire::RegisterMasterInterfaceEx,
    ) -> Response {
        let (ctx, conn_is_slave) = {
            let connection = &self.connections[&conn];
            (connection.ocb.ctx, connection.ocb.slave)
        };

        let mut body = BytesMut::new();
        let mut changed: Vec<String> = Vec::new();
        for entry in arg.entries {
            debug!(
                "*[{conn}] REGISTER_MASTER_INTERFACE_EX {} {}, pid:{}, chid:{}",
                entry.iface, entry.server_id, entry.pid, entry.chid
            );

            let refused = if entry.server_id.extended == self.settings.extended_id {
                error!(" ID conflict: {}", entry.server_id.extended);
                true
            } else if !entry.iface.is_valid() || entry.chid <= 0 {
                error!(" interface check failed for {}", entry.iface.name);
                true
            } else if self.servers.contains_name(&entry.iface.name) {
                error!(" interface {} already registered", entry.iface.name);
                true
            } else if entry.server_id.extended == 0
                && self.settings.extended_id != switchboard_types::CLASSIC_SLAVE_EXTENDED_ID
            {
                error!(" standard slave cannot connect to tree mode servicebroker");
                true
            } else {
                false
            };
            if refused {
                PartyId::invalid_for(entry.server_id.local).put(&mut body);
                continue;
            }

            let pid = translate_remote(conn_is_slave, ctx.node, &entry.iface.name, entry.pid);
            let mut party_id = entry.server_id;
            if party_id.extended == 0 {
                // Classic slaves carry no id of their own; derive one that
                // stays unique per connection.
                party_id.extended =
                    switchboard_types::CLASSIC_SLAVE_EXTENDED_ID + conn as u32;
            }

            self.servers.add(ServerEntry {
                party_id,
                upstream: Upstream::None,
                nid: ctx.node,
                pid,
                chid: entry.chid,
                iface: entry.iface.clone(),
                impl_version: entry.impl_version,
                gid: UNKNOWN_GROUP_ID,
                local: false,
            });
            self.ocb_mut(conn).servers.insert(party_id);
            debug!(" SERVER_ID {party_id}");
            party_id.put(&mut body);

            self.trigger_connect_notifications(&entry.iface, UNKNOWN_GROUP_ID);
            changed.push(entry.iface.name);
        }

        let names: Vec<&str> = changed.iter().map(String::as_str).collect();
        self.notify_list_changed(&names);

        // Pass the interfaces on when this broker is itself a slave.
        self.register_interfaces_master();
        Response::ok(body)
    }

    /// Inserts a fresh server entry and fires connect notifications.
    /// Returns `None` on a name collision.
    #[allow(clippy::too_many_arguments)]
    fn add_interface(
        &mut self,
        conn: ConnId,
        iface: InterfaceDescription,
        pid: i32,
        chid: i32,
        impl_version: switchboard_types::ImplVersion,
        is_local: bool,
        gid: u32,
    ) -> Option<PartyId> {
        if self.servers.contains_name(&iface.name) {
            error!("interface {} already exists", iface.name);
            return None;
        }

        let party_id = PartyId::new(self.settings.extended_id, self.next_server_id);
        self.next_server_id += 1;

        let ctx = self.ctx(conn);
        self.servers.add(ServerEntry {
            party_id,
            upstream: Upstream::None,
            nid: ctx.node,
            pid,
            chid,
            iface: iface.clone(),
            impl_version,
            gid,
            local: is_local,
        });
        self.ocb_mut(conn).servers.insert(party_id);

        self.trigger_connect_notifications(&iface, gid);
        Some(party_id)
    }

    pub(crate) fn trigger_connect_notifications(&mut self, iface: &InterfaceDescription, gid: u32) {
        let Broker {
            connect_notifications,
            groups,
            ..
        } = self;
        let fired = connect_notifications.trigger_interface(iface, gid, groups.as_ref());
        self.finalize_all(fired);
    }

    fn handle_unregister_interface(
        &mut self,
        conn: ConnId,
        arg: wire::UnregisterInterface,
    ) -> Response {
        debug!("*[{conn}] UNREGISTER_INTERFACE {}", arg.server_id);

        if !self.ocb(conn).servers.contains(&arg.server_id) {
            return Response::status(Status::BadArgument);
        }
        self.ocb_mut(conn).servers.remove(&arg.server_id);

        let Some(entry) = self.servers.find_party(arg.server_id) else {
            return Response::status(Status::BadArgument);
        };
        debug!(
            " INTERFACE: {}{}",
            entry.iface,
            if entry.local { " [LOCAL]" } else { "" }
        );
        let upstream = entry.upstream;

        let fired = self.disconnect_notifications.trigger_party(arg.server_id);
        self.finalize_all(fired);
        self.unregister_interface_master(upstream);
        self.servers.remove(arg.server_id);
        self.clients.remove_server(arg.server_id);
        self.notify_list_changed(&[]);

        Response::status(Status::Ok)
    }

    // -----------------------------------------------------------------
    // Attach / detach
    // -----------------------------------------------------------------

    fn handle_attach_interface(
        &mut self,
        conn: ConnId,
        arg: wire::AttachInterface,
        reply: &mut Option<ReplySender>,
    ) -> Option<Response> {
        let is_local = self.rules.is_local_service(&arg.iface.name);
        debug!(
            "*[{conn}] ATTACH_INTERFACE {}{}",
            arg.iface,
            if is_local { " [LOCAL]" } else { "" }
        );

        if !arg.iface.is_valid() {
            return Some(Response::status(Status::BadArgument));
        }

        if self.servers.find_compatible(&arg.iface).is_some() {
            return Some(match self.attach_local_interface(conn, &arg.iface) {
                Ok(info) => {
                    let mut body = BytesMut::new();
                    info.put(&mut body);
                    Response::ok(body)
                }
                Err(status) => Response::status(status),
            });
        }

        if self.servers.contains_name(&arg.iface.name) {
            return Some(Response::status(Status::VersionMismatch));
        }

        if self.settings.use_cache {
            if let Some(info) = self.cache.get(&arg.iface).copied() {
                let client_id = self.add_client(conn, info.server_id);
                let conn_info = ConnectionInfo {
                    if_version: arg.iface.version,
                    channel: info.channel,
                    server_id: info.server_id,
                    client_id,
                };
                let mut body = BytesMut::new();
                conn_info.put(&mut body);
                return Some(Response::ok(body));
            }
        }

        if !is_local && self.rules.forward_service(&arg.iface.name) && self.master_connected() {
            let cookie = self.next_pending_id();
            if self.settings.use_cache {
                self.pending_remote.insert(cookie, arg.iface.clone());
            }
            debug!(" forwarding ATTACH_INTERFACE to master, job {cookie}");

            let mut body = BytesMut::new();
            arg.put(&mut body);
            let job = Job::new(cookie as i32, Command::AttachInterface, body.freeze())
                .with_deferred(conn, reply.take().expect("reply available"));
            self.forward_job(job);
            return None;
        }

        Some(Response::status(Status::UnknownInterface))
    }

    /// Resolves a locally registered, version-compatible interface for one
    /// attaching client.
    pub(crate) fn attach_local_interface(
        &mut self,
        conn: ConnId,
        requested: &InterfaceDescription,
    ) -> Result<ConnectionInfo, Status> {
        let Some(entry) = self.servers.find_compatible(requested) else {
            return Err(Status::InternalError);
        };
        let (party_id, version, name, pid, chid, gid) = (
            entry.party_id,
            entry.iface.version,
            entry.iface.name.clone(),
            entry.pid,
            entry.chid,
            entry.gid,
        );

        let (ctx, slave) = {
            let connection = &self.connections[&conn];
            (connection.ocb.ctx, connection.ocb.slave)
        };

        if gid != UNKNOWN_GROUP_ID {
            if !ctx.is_local() {
                error!(" access restricted interfaces can only be attached locally");
                return Err(Status::AccessDenied);
            }
            if !check_access(self.groups.as_ref(), ctx.uid, gid) {
                error!(" attaching to interface {name} denied for uid {}", ctx.uid);
                return Err(Status::AccessDenied);
            }
        }

        let client_id = self.add_client(conn, party_id);
        let info = ConnectionInfo {
            if_version: version,
            channel: ChannelInfo {
                nid: 0,
                pid: translate_local(slave, ctx.local_addr, &name, pid),
                chid,
            },
            server_id: party_id,
            client_id,
        };
        debug!(
            " SUCCESS - PID: {}, CHID: {}, CLIENT_ID: {client_id}, SERVER_ID: {party_id}",
            info.channel.pid, info.channel.chid
        );
        Ok(info)
    }

    /// Attach fused with a notification: either a disconnect watch on the
    /// resolved server, or a connect watch while the server is absent.
    fn handle_attach_interface_extended(
        &mut self,
        conn: ConnId,
        arg: wire::AttachInterfaceExtended,
        reply: &mut Option<ReplySender>,
    ) -> Option<Response> {
        let is_local = self.rules.is_local_service(&arg.iface.name);
        debug!(
            "*[{conn}] ATTACH_INTERFACE_EXTENDED {}{}",
            arg.iface,
            if is_local { " [LOCAL]" } else { "" }
        );

        if !arg.iface.is_valid() {
            return Some(Response::status(Status::BadArgument));
        }

        if let Some(entry) = self.servers.find_compatible(&arg.iface) {
            let server_id = entry.party_id;
            return Some(match self.attach_local_interface(conn, &arg.iface) {
                Ok(info) => {
                    let id = self.arm_server_disconnect(conn, server_id, arg.pulse);
                    let mut body = BytesMut::new();
                    wire::AttachExtendedReply {
                        conn: info,
                        notification_id: id,
                    }
                    .put(&mut body);
                    Response::ok(body)
                }
                Err(status) => Response::status(status),
            });
        }

        if self.servers.contains_name(&arg.iface.name) {
            return Some(Response::status(Status::VersionMismatch));
        }

        if self.settings.use_cache {
            if let Some(info) = self.cache.get(&arg.iface).copied() {
                debug!(
                    "cached server info for {} found: {}",
                    arg.iface, info.server_id
                );
                let id = self.arm_server_disconnect(conn, info.server_id, arg.pulse);
                let client_id = self.add_client(conn, info.server_id);
                let mut body = BytesMut::new();
                wire::AttachExtendedReply {
                    conn: ConnectionInfo {
                        if_version: arg.iface.version,
                        channel: info.channel,
                        server_id: info.server_id,
                        client_id,
                    },
                    notification_id: id,
                }
                .put(&mut body);
                return Some(Response::ok(body));
            }
        }

        if is_local || !self.rules.forward_service(&arg.iface.name) || !self.master_connected() {
            // No upstream to ask: leave a connect watch behind.
            return Some(
                match self.arm_server_available(conn, arg.pulse, arg.iface.clone()) {
                    Ok(id) => {
                        let mut body = BytesMut::new();
                        wire::AttachExtendedReply {
                            conn: ConnectionInfo::default(),
                            notification_id: id,
                        }
                        .put(&mut body);
                        Response::with_code(Status::UnknownInterface.code(), body.freeze())
                    }
                    Err(status) => Response::status(status),
                },
            );
        }

        self.forward_attach_extended_to_master(conn, arg, reply)
    }

    fn handle_get_server_information(
        &mut self,
        conn: ConnId,
        arg: wire::AttachInterface,
        reply: &mut Option<ReplySender>,
    ) -> Option<Response> {
        let is_local = self.rules.is_local_service(&arg.iface.name);
        debug!("*[{conn}] GET_SERVER_INFORMATION {}", arg.iface);

        if !arg.iface.is_valid() {
            return Some(Response::status(Status::BadArgument));
        }

        if let Some(entry) = self.servers.find_compatible(&arg.iface) {
            let slave = self.connections[&conn].ocb.slave;
            let ctx = self.connections[&conn].ocb.ctx;
            let info = ServerInfo {
                channel: ChannelInfo {
                    nid: entry.nid,
                    pid: translate_local(slave, ctx.local_addr, &entry.iface.name, entry.pid),
                    chid: entry.chid,
                },
                server_id: entry.party_id,
            };
            let mut body = BytesMut::new();
            info.put(&mut body);
            return Some(Response::ok(body));
        }

        if self.servers.contains_name(&arg.iface.name) {
            return Some(Response::status(Status::VersionMismatch));
        }

        if let Some(info) = self.cache.get(&arg.iface).copied() {
            let mut body = BytesMut::new();
            info.put(&mut body);
            return Some(Response::ok(body));
        }

        if !is_local && self.master_connected() {
            let cookie = self.next_pending_id();
            self.pending_remote.insert(cookie, arg.iface.clone());
            debug!(" forwarding GET_SERVER_INFORMATION to master, job {cookie}");

            let mut body = BytesMut::new();
            arg.put(&mut body);
            let job = Job::new(cookie as i32, Command::GetServerInformation, body.freeze())
                .with_deferred(conn, reply.take().expect("reply available"));
            self.forward_job(job);
            return None;
        }

        Some(Response::status(Status::UnknownInterface))
    }

    fn handle_detach_interface(
        &mut self,
        conn: ConnId,
        arg: wire::DetachInterface,
        reply: &mut Option<ReplySender>,
    ) -> Option<Response> {
        debug!("*[{conn}] DETACH_INTERFACE {}", arg.client_id);

        let mut result = Status::InvalidClientId;
        let known_here =
            self.ocb(conn).clients.contains(&arg.client_id) && self.clients.contains(arg.client_id);

        if known_here || self.settings.use_cache {
            result = Status::Ok;
            let fired = self.detach_notifications.trigger_party(arg.client_id);
            self.finalize_all(fired);
            self.clients.remove(arg.client_id);
            self.ocb_mut(conn).clients.remove(&arg.client_id);
        }

        // A client id this broker does not manage belongs to the master.
        if self.master_connected() && (self.settings.use_cache || result != Status::Ok) {
            self.ocb_mut(conn).clients.remove(&arg.client_id);
            let mut body = BytesMut::new();
            arg.put(&mut body);
            let job = Job::new(0, Command::DetachInterface, body.freeze())
                .with_deferred(conn, reply.take().expect("reply available"));
            self.forward_job(job);
            return None;
        }

        Some(Response::status(result))
    }

    // -----------------------------------------------------------------
    // Notifications
    // -----------------------------------------------------------------

    /// Mints a notification aimed at the caller's pulse endpoint.
    pub(crate) fn arm_notification(&mut self, conn: ConnId, pulse: PulseInfo) -> Notification {
        let ctx = self.ctx(conn);
        let handle = self.attach_pulse_channel(ctx.node, pulse.pid, pulse.chid);
        let id = self.next_notification_id;
        self.next_notification_id += 1;

        let mut notification = Notification::new(id, pulse, handle);
        notification.owner = Some(conn);
        notification
    }

    pub(crate) fn attach_pulse_channel(&mut self, nid: u32, pid: i32, chid: i32) -> PulseHandle {
        self.pulses.attach(PulseAddr { nid, pid, chid })
    }

    fn handle_notify_server_disconnect(
        &mut self,
        conn: ConnId,
        arg: wire::NotifyServerDisconnect,
    ) -> Response {
        debug!("*[{conn}] NOTIFY_SERVER_DISCONNECT {}", arg.server_id);

        let id = self.arm_server_disconnect(conn, arg.server_id, arg.pulse);
        let mut body = BytesMut::new();
        wire::NotificationIdReply {
            notification_id: id,
        }
        .put(&mut body);
        Response::ok(body)
    }

    /// Arms a disconnect watch on a party. Remote parties fold into an
    /// upstream proxy pool; already-gone parties fire immediately.
    pub(crate) fn arm_server_disconnect(
        &mut self,
        conn: ConnId,
        server_id: PartyId,
        pulse: PulseInfo,
    ) -> NotificationId {
        let mut notification = self.arm_notification(conn, pulse);
        notification.party = server_id;
        let id = notification.id;
        self.disconnect_notifications.add(notification);
        self.ocb_mut(conn).add_notification(id);

        let server_here = self.servers.find_party(server_id).is_some();
        if !server_here
            && server_id.extended != self.settings.extended_id
            && self.master_connected()
        {
            let pool_id = match self.pools.find_server(server_id) {
                Some(pool) => pool.pool_id(),
                None => {
                    let pool_id = self.pools.add_server(server_id);
                    self.forward_server_disconnect(server_id, pool_id);
                    pool_id
                }
            };
            let Broker {
                pools,
                disconnect_notifications,
                ..
            } = self;
            if let (Some(pool), Some(n)) =
                (pools.find(pool_id), disconnect_notifications.find(id))
            {
                pool.attach(n);
            }
        } else if !server_here {
            let fired = self.disconnect_notifications.trigger_party(server_id);
            self.finalize_all(fired);
        }

        debug!(
            "*[{conn}] notification disconnect set on {server_id} for PID: {}, CHID: {}",
            pulse.pid, pulse.chid
        );
        id
    }

    fn handle_notify_server_available(
        &mut self,
        conn: ConnId,
        arg: wire::NotifyServerAvailable,
    ) -> Response {
        debug!("*[{conn}] NOTIFY_SERVER_AVAILABLE {}", arg.iface);

        match self.arm_server_available(conn, arg.pulse, arg.iface) {
            Ok(id) => {
                let mut body = BytesMut::new();
                wire::NotificationIdReply {
                    notification_id: id,
                }
                .put(&mut body);
                Response::ok(body)
            }
            Err(status) => Response::status(status),
        }
    }

    /// Arms a connect watch on an interface, firing immediately when a
    /// compatible server is already visible, folding upstream otherwise.
    pub(crate) fn arm_server_available(
        &mut self,
        conn: ConnId,
        pulse: PulseInfo,
        iface: InterfaceDescription,
    ) -> Result<NotificationId, Status> {
        if !iface.is_valid() {
            return Err(Status::BadArgument);
        }

        let is_local = self.rules.is_local_service(&iface.name);
        let ctx = self.ctx(conn);
        let registered = self
            .servers
            .find_compatible(&iface)
            .map(|e| (e.iface.clone(), e.gid));

        if let Some((_, gid)) = &registered {
            if !check_access(self.groups.as_ref(), ctx.uid, *gid) {
                return Err(Status::AccessDenied);
            }
        }

        let mut notification = self.arm_notification(conn, pulse);
        notification.iface = Some(iface.clone());
        notification.local = is_local;
        notification.uid = ctx.uid;
        let id = notification.id;
        self.connect_notifications.add(notification);
        self.ocb_mut(conn).add_notification(id);

        let cache_hit = self.settings.use_cache && self.cache.get(&iface).is_some();
        if let Some((registered_iface, gid)) = registered {
            self.trigger_connect_notifications(&registered_iface, gid);
        } else if cache_hit {
            self.trigger_connect_notifications(&iface, UNKNOWN_GROUP_ID);
        } else if !is_local && self.master_connected() {
            self.forward_server_available_notifications();
        } else if let Some(near) = self.servers.find_name(&iface.name) {
            info!(
                "notification set on {iface}, version available: {}",
                near.iface.version
            );
        }

        Ok(id)
    }

    fn handle_notify_server_available_ex(
        &mut self,
        conn: ConnId,
        arg: wire::NotifyServerAvailableEx,
    ) -> Response {
        let mut body = BytesMut::new();
        for entry in arg.entries {
            debug!("*[{conn}] NOTIFY_SERVER_AVAILABLE_EX {}", entry.iface);
            let notification_id = self
                .arm_server_available(conn, entry.pulse, entry.iface)
                .unwrap_or(INVALID_NOTIFICATION_ID);
            wire::CookieNotificationId {
                cookie: entry.cookie,
                notification_id,
            }
            .put(&mut body);
        }
        Response::ok(body)
    }

    fn handle_notify_client_detach(
        &mut self,
        conn: ConnId,
        arg: wire::NotifyClientDetach,
    ) -> Response {
        debug!("*[{conn}] NOTIFY_CLIENT_DETACH {}", arg.client_id);

        let mut notification = self.arm_notification(conn, arg.pulse);
        notification.party = arg.client_id;
        let id = notification.id;
        self.detach_notifications.add(notification);
        self.ocb_mut(conn).add_notification(id);

        if self.master_connected() && arg.client_id.extended != self.settings.extended_id {
            self.forward_client_detach(arg.client_id, id);
        } else if (!self.settings.use_cache
            || arg.client_id.extended == self.settings.extended_id)
            && !self.clients.contains(arg.client_id)
        {
            // Client already gone: the watch fires right away.
            let fired = self.detach_notifications.trigger_party(arg.client_id);
            self.finalize_all(fired);
        }

        let mut body = BytesMut::new();
        wire::NotificationIdReply {
            notification_id: id,
        }
        .put(&mut body);
        Response::ok(body)
    }

    fn handle_clear_notification(
        &mut self,
        conn: ConnId,
        arg: wire::ClearNotification,
    ) -> Response {
        debug!("*[{conn}] CLEAR_NOTIFICATION -{}-", arg.notification_id);

        if !self.ocb(conn).has_notification(arg.notification_id) {
            return Response::status(Status::InvalidNotificationId);
        }
        self.ocb_mut(conn)
            .remove_notification(arg.notification_id);
        self.drop_notification(arg.notification_id);
        Response::status(Status::Ok)
    }

    /// Removes a notification from whichever list holds it and finalizes
    /// its pool/upstream references.
    pub(crate) fn drop_notification(&mut self, id: NotificationId) {
        let removed = self
            .detach_notifications
            .remove(id)
            .or_else(|| self.disconnect_notifications.remove(id))
            .or_else(|| self.connect_notifications.remove(id))
            .or_else(|| self.list_change_notifications.remove(id));
        if let Some(notification) = removed {
            self.finalize_notification(notification);
        }
    }

    // -----------------------------------------------------------------
    // Interface lists
    // -----------------------------------------------------------------

    fn handle_get_interface_list(
        &mut self,
        conn: ConnId,
        arg: wire::GetInterfaceList,
        reply: &mut Option<ReplySender>,
    ) -> Option<Response> {
        debug!("*[{conn}] GET_INTERFACELIST");

        if self.master_connected() {
            let mut body = BytesMut::new();
            arg.put(&mut body);
            let job = Job::new(arg.in_count as i32, Command::GetInterfaceList, body.freeze())
                .with_deferred(conn, reply.take().expect("reply available"));
            self.forward_job(job);
            return None;
        }

        if self.servers.len() > arg.in_count as usize {
            return Some(Response::status(Status::BadArgument));
        }

        let slave = self.connections[&conn].ocb.slave;
        let mut body = BytesMut::new();
        let mut count = 0usize;
        for entry in self.servers.iter() {
            // Local services stay invisible to remote brokers.
            if !slave || !entry.local {
                entry.iface.put(&mut body);
                count += 1;
            }
        }
        Some(Response::list(count, body))
    }

    fn handle_match_interface_list(
        &mut self,
        conn: ConnId,
        arg: wire::MatchInterfaceList,
        reply: &mut Option<ReplySender>,
    ) -> Option<Response> {
        debug!("*[{conn}] MATCH_INTERFACELIST /{}/", arg.regex);

        let regex = match regex::Regex::new(&arg.regex) {
            Ok(re) => re,
            Err(err) => {
                error!("regex error: {err} /{}/", arg.regex);
                return Some(Response::status(Status::RegularExpression));
            }
        };

        if self.master_connected() {
            let mut body = BytesMut::new();
            arg.put(&mut body);
            let job = Job::new(arg.in_count as i32, Command::MatchInterfaceList, body.freeze())
                .with_regex(regex)
                .with_deferred(conn, reply.take().expect("reply available"));
            self.forward_job(job);
            return None;
        }

        let slave = self.connections[&conn].ocb.slave;
        let mut body = BytesMut::new();
        let mut count = 0usize;
        for entry in self.servers.iter() {
            if !regex.is_match(&entry.iface.name) {
                continue;
            }
            if count >= arg.in_count as usize {
                return Some(Response::status(Status::BadArgument));
            }
            if !slave || !entry.local {
                entry.iface.put(&mut body);
                count += 1;
            }
        }
        Some(Response::list(count, body))
    }

    fn handle_notify_interface_list_change(
        &mut self,
        conn: ConnId,
        arg: wire::NotifyInterfaceListChange,
    ) -> Response {
        debug!("*[{conn}] NOTIFY_INTERFACELIST_CHANGE");

        let notification = self.arm_notification(conn, arg.pulse);
        let id = notification.id;
        self.list_change_notifications.add(notification);
        self.ocb_mut(conn).add_notification(id);

        if self.master_connected() {
            self.forward_list_change(id, None);
        }

        let mut body = BytesMut::new();
        wire::NotificationIdReply {
            notification_id: id,
        }
        .put(&mut body);
        Response::ok(body)
    }

    fn handle_notify_interface_list_match(
        &mut self,
        conn: ConnId,
        arg: wire::NotifyInterfaceListMatch,
    ) -> Response {
        debug!("*[{conn}] NOTIFY_INTERFACELIST_MATCH /{}/", arg.regex);

        let regex = match regex::Regex::new(&arg.regex) {
            Ok(re) => re,
            Err(err) => {
                error!("regex error: {err} /{}/", arg.regex);
                return Response::status(Status::RegularExpression);
            }
        };

        let notification = self.arm_notification(conn, arg.pulse).with_regex(regex);
        let id = notification.id;
        self.list_change_notifications.add(notification);
        self.ocb_mut(conn).add_notification(id);

        if self.master_connected() {
            self.forward_list_change(id, Some(arg.regex.clone()));
        }

        let mut body = BytesMut::new();
        wire::NotificationIdReply {
            notification_id: id,
        }
        .put(&mut body);

        // Fire once right away if anything visible already matches.
        let ctx_local = self.ctx(conn).is_local();
        let Broker {
            servers,
            list_change_notifications,
            ..
        } = self;
        if let Some(n) = list_change_notifications.find(id) {
            let matched = servers
                .iter()
                .any(|e| (ctx_local || !e.local) && n.matches(&e.iface.name));
            if matched {
                n.send();
            }
        }

        Response::ok(body)
    }

    fn handle_master_ping_id(&mut self, conn: ConnId, arg: wire::MasterPingId) -> Response {
        debug!("*[{conn}] MASTER_PING_ID extendedID={}", arg.extended_id);

        // A reconnecting slave replaces its stale predecessor.
        if arg.extended_id != 0 {
            let stale: Vec<ConnId> = self
                .connections
                .iter()
                .filter(|(&id, c)| id != conn && c.ocb.extended_id == arg.extended_id)
                .map(|(&id, _)| id)
                .collect();
            for id in stale {
                info!("dropping stale slave connection [{id}] for extended id {}", arg.extended_id);
                self.connections[&id].closer.cancel();
            }
        }

        let ocb = self.ocb_mut(conn);
        ocb.extended_id = arg.extended_id;
        ocb.slave = true;
        Response::status(Status::Ok)
    }

    // -----------------------------------------------------------------
    // Registry mutation fan-out
    // -----------------------------------------------------------------

    /// Fires list-change notifications once per request-induced batch.
    pub(crate) fn notify_list_changed(&mut self, changed_names: &[&str]) {
        self.list_change_notifications
            .trigger_list_changed(changed_names);
    }

    /// Allocates a client id and records the attachment.
    ///
    /// Outside tree mode the extended part inherits the server's extended
    /// id, collisions and all. In cache mode, attachments arriving through
    /// another broker are managed on that broker instead.
    pub(crate) fn add_client(&mut self, conn: ConnId, server_id: PartyId) -> PartyId {
        // The connection may have died while its job was in flight.
        let Some(connection) = self.connections.get(&conn) else {
            return PartyId::NULL;
        };
        let slave = connection.ocb.slave;
        let mut client_id = PartyId::NULL;

        if !self.settings.use_cache || !slave {
            let extended = if self.rules.is_tree_mode() {
                self.settings.extended_id
            } else {
                server_id.extended
            };
            client_id = PartyId::new(extended, self.next_client_id);
            self.next_client_id += 1;
            self.clients.add(client_id, server_id, conn);
        }
        if !client_id.is_null() {
            self.ocb_mut(conn).clients.insert(client_id);
        }
        client_id
    }

    /// Unwinds everything a dead connection owned.
    fn handle_disconnected(&mut self, conn: ConnId) {
        let Some(connection) = self.connections.remove(&conn) else {
            return;
        };
        let ocb = connection.ocb;
        debug!("connection [{conn}] closed");

        // Registered servers disappear with their process.
        for &server_id in &ocb.servers {
            debug!("+CLOSE SERVER_ID: {server_id}");
            if let Some(entry) = self.servers.find_party(server_id) {
                let upstream = entry.upstream;
                self.unregister_interface_master(upstream);
                self.servers.remove(server_id);
                self.clients.remove_server(server_id);
            }
        }

        // Attachments detach; remote ones are forwarded upstream.
        for &client_id in &ocb.clients {
            debug!("+CLOSE CLIENT_ID: {client_id}");
            self.clients.remove(client_id);
            if self.master_connected() {
                self.forward_detach(client_id);
            }
        }

        let fired = self.disconnect_notifications.trigger_parties(&ocb.servers);
        self.finalize_all(fired);

        let fired = if self.settings.use_cache && ocb.slave {
            // A dying slave takes every detach watch it armed with it.
            self.detach_notifications.trigger_local(ocb.extended_id)
        } else {
            self.detach_notifications.trigger_parties(&ocb.clients)
        };
        self.finalize_all(fired);

        // Watches armed by this connection are void now.
        let removed = self.disconnect_notifications.remove_owned(&ocb.notifications);
        self.finalize_all(removed);
        let removed = self.detach_notifications.remove_owned(&ocb.notifications);
        self.finalize_all(removed);
        let removed = self.connect_notifications.remove_owned(&ocb.notifications);
        self.finalize_all(removed);
        let removed = self
            .list_change_notifications
            .remove_owned(&ocb.notifications);
        self.finalize_all(removed);

        if !ocb.servers.is_empty() {
            self.notify_list_changed(&[]);
        }
    }

    // -----------------------------------------------------------------
    // Notification finalization
    // -----------------------------------------------------------------

    pub(crate) fn finalize_all(&mut self, notifications: Vec<Notification>) {
        for notification in notifications {
            self.finalize_notification(notification);
        }
    }

    /// Clears every reference a consumed or removed notification held:
    /// its owner's id list, its pool membership, its upstream counterpart.
    pub(crate) fn finalize_notification(&mut self, notification: Notification) {
        if let Some(owner) = notification.owner {
            if let Some(connection) = self.connections.get_mut(&owner) {
                connection.ocb.remove_notification(notification.id);
            }
        }

        if notification.pool_id != 0 {
            if let PoolDetach::Removed { master_id } = self.pools.detach(notification.pool_id) {
                if let Some(waiters) = self.pool_waiters.remove(&notification.pool_id) {
                    for waiter in waiters {
                        let _ = waiter.reply.send(Response::status(Status::InternalError));
                    }
                }
                if let Some(master_id) = master_id {
                    self.clear_notification_upstream(master_id);
                }
            }
        } else if notification.master_id != INVALID_NOTIFICATION_ID {
            self.clear_notification_upstream(notification.master_id);
        }
    }

    // -----------------------------------------------------------------
    // Shared access helpers
    // -----------------------------------------------------------------

    pub(crate) fn ctx(&self, conn: ConnId) -> ConnContext {
        self.connections[&conn].ocb.ctx
    }

    pub(crate) fn ocb(&self, conn: ConnId) -> &Ocb {
        &self.connections[&conn].ocb
    }

    pub(crate) fn ocb_mut(&mut self, conn: ConnId) -> &mut Ocb {
        &mut self
            .connections
            .get_mut(&conn)
            .expect("connection is registered")
            .ocb
    }

    pub(crate) fn master_connected(&self) -> bool {
        self.master.as_ref().is_some_and(MasterHandle::is_connected)
    }

    pub(crate) fn forward_job(&self, job: Box<Job>) {
        self.master
            .as_ref()
            .expect("forwarding requires a master")
            .eval(job);
    }

    pub(crate) fn next_pending_id(&mut self) -> u32 {
        let id = self.next_pending_id;
        self.next_pending_id += 1;
        id
    }

    pub(crate) fn protocol_version() -> InterfaceVersion {
        InterfaceVersion::new(PROTOCOL_MAJOR, PROTOCOL_MINOR)
    }

    // -----------------------------------------------------------------
    // Status page
    // -----------------------------------------------------------------

    fn dump(&self, kind: DumpKind) -> String {
        match kind {
            DumpKind::Full => self.dump_full(),
            DumpKind::Servers => self.dump_servers(),
            DumpKind::Clients => self.dump_clients(),
            DumpKind::ConnectNotifications => dump_notifications(&self.connect_notifications),
            DumpKind::DisconnectNotifications => {
                dump_notifications(&self.disconnect_notifications)
            }
            DumpKind::DetachNotifications => dump_notifications(&self.detach_notifications),
        }
    }

    fn dump_full(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(
            out,
            "servicebroker {}",
            if self.settings.is_master {
                "master"
            } else {
                "slave"
            }
        );
        if let Some(master) = &self.master {
            let _ = writeln!(
                out,
                "master: {} ({}CONNECTED)",
                master.address(),
                if master.is_connected() { "" } else { "NOT " }
            );
        }
        let _ = writeln!(out, "version: {PROTOCOL_MAJOR}.{PROTOCOL_MINOR}");

        let _ = writeln!(out, "\nStatistics:");
        let _ = writeln!(
            out,
            "   Servers: {}|{}{}",
            self.servers.len(),
            self.servers.total(),
            if self.settings.use_cache {
                format!(" , cached : {}", self.cache.len())
            } else {
                String::new()
            }
        );
        let _ = writeln!(out, "   Clients: {}|{}", self.clients.len(), self.clients.total());
        let current = self.connect_notifications.len()
            + self.disconnect_notifications.len()
            + self.detach_notifications.len()
            + self.list_change_notifications.len();
        let total = self.connect_notifications.total()
            + self.disconnect_notifications.total()
            + self.detach_notifications.total()
            + self.list_change_notifications.total();
        let _ = writeln!(
            out,
            "   Notifications : {current}|{total} , proxies: {}|{}",
            self.pools.len(),
            self.pools.total()
        );
        let _ = writeln!(
            out,
            "      Server Connect: {}|{}",
            self.connect_notifications.len(),
            self.connect_notifications.total()
        );
        let _ = writeln!(
            out,
            "      Server Disconnect: {}|{}",
            self.disconnect_notifications.len(),
            self.disconnect_notifications.total()
        );
        let _ = writeln!(
            out,
            "      Client Detach: {}|{}",
            self.detach_notifications.len(),
            self.detach_notifications.total()
        );
        match &self.master {
            Some(master) => {
                let _ = writeln!(out, "   Jobs: {}|{}", master.queue_size(), master.queue_total());
            }
            None => {
                let _ = writeln!(out, "   Jobs: 0|0");
            }
        }

        if !self.servers.is_empty() {
            let _ = writeln!(out, "\nConnected Servers:");
            out.push_str(&self.dump_servers());
        }
        if !self.clients.is_empty() {
            let _ = writeln!(out, "\nConnected Clients:");
            out.push_str(&self.dump_clients());
        }
        if !self.connect_notifications.is_empty() {
            let _ = writeln!(out, "\nServer Connect Notifications:");
            out.push_str(&dump_notifications(&self.connect_notifications));
        }
        if !self.disconnect_notifications.is_empty() {
            let _ = writeln!(out, "\nServer Disconnect Notifications:");
            out.push_str(&dump_notifications(&self.disconnect_notifications));
        }
        if !self.detach_notifications.is_empty() {
            let _ = writeln!(out, "\nClient Detach Notifications:");
            out.push_str(&dump_notifications(&self.detach_notifications));
        }
        out
    }

    fn dump_servers(&self) -> String {
        use std::fmt::Write;

        let mut out = String::from("          pid/ip:port  ServerId        Interface\n");
        for entry in self.servers.iter() {
            let endpoint = if InterfaceDescription::is_tcp_name(&entry.iface.name) {
                let ip = std::net::Ipv4Addr::from(entry.pid as u32);
                format!("{ip}:{}", entry.chid)
            } else {
                entry.pid.to_string()
            };
            let _ = writeln!(
                out,
                "{endpoint:>21}  {:<15} {} {}{}",
                entry.party_id.to_string(),
                entry.iface.name,
                entry.iface.version,
                if entry.local { " [LOCAL]" } else { "" }
            );
        }
        out
    }

    fn dump_clients(&self) -> String {
        use std::fmt::Write;

        let mut out = String::from("   ClientId        ServerId\n");
        for entry in self.clients.iter() {
            let _ = writeln!(
                out,
                "   {:<15} {}",
                entry.client_id.to_string(),
                entry.server_id
            );
        }
        out
    }
}

fn dump_notifications(list: &NotificationList) -> String {
    use std::fmt::Write;

    let mut out = String::from("     Notification\n");
    for n in list.iter() {
        let subject = match &n.iface {
            Some(iface) => iface.to_string(),
            None => n.party.to_string(),
        };
        let _ = writeln!(
            out,
            "   -{}- {subject}{}{}",
            n.id,
            if n.local { " [LOCAL]" } else { "" },
            if n.active { "" } else { " [INACTIVE]" }
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::testing::StaticGroups;
    use crate::event::Request;
    use bytes::{Bytes, BytesMut};
    use switchboard_types::wire as w;
    use switchboard_types::{ImplVersion, LOCAL_NODE_ADDRESS};
    use tokio::sync::oneshot;

    fn version() -> InterfaceVersion {
        Broker::protocol_version()
    }

    fn broker_with(groups: StaticGroups) -> Broker {
        Broker::new(
            Settings::resolve(None, false),
            Rules::default(),
            SignallingAddress::unset(),
            None,
            Box::new(groups),
            CancellationToken::new(),
        )
    }

    fn broker() -> Broker {
        broker_with(StaticGroups::default())
    }

    fn connect(broker: &mut Broker, id: ConnId, uid: u32, node: u32) {
        broker.register_connection(
            ConnContext {
                id,
                pid: 100 + id as i32,
                uid,
                gid: uid,
                node,
                local_addr: node,
            },
            CancellationToken::new(),
        );
    }

    fn call(broker: &mut Broker, conn: ConnId, cmd: Command, body: BytesMut) -> Response {
        let (tx, mut rx) = oneshot::channel();
        broker.dispatch(Request {
            conn,
            opcode: cmd.opcode(),
            body: body.freeze(),
            reply: tx,
        });
        rx.try_recv().expect("handler answered synchronously")
    }

    fn register(broker: &mut Broker, conn: ConnId, name: &str, gid: Option<i32>) -> Response {
        let register = w::RegisterInterface {
            sb_version: version(),
            iface: InterfaceDescription::new(name, 1, 0),
            impl_version: ImplVersion::default(),
            chid: 1,
            pid: 100,
        };
        let mut body = BytesMut::new();
        match gid {
            Some(gid) => {
                w::RegisterInterfaceGroupId { register, gid }.put(&mut body);
                call(broker, conn, Command::RegisterInterfaceGroupId, body)
            }
            None => {
                register.put(&mut body);
                call(broker, conn, Command::RegisterInterface, body)
            }
        }
    }

    fn attach(broker: &mut Broker, conn: ConnId, name: &str) -> Response {
        let mut body = BytesMut::new();
        w::AttachInterface {
            sb_version: version(),
            iface: InterfaceDescription::new(name, 1, 0),
        }
        .put(&mut body);
        call(broker, conn, Command::AttachInterface, body)
    }

    #[tokio::test]
    async fn ocb_mirrors_the_server_table() {
        let mut broker = broker();
        connect(&mut broker, 1, 1000, LOCAL_NODE_ADDRESS);

        register(&mut broker, 1, "a.Svc", None);
        register(&mut broker, 1, "b.Svc", None);

        let table: std::collections::BTreeSet<PartyId> =
            broker.servers.iter().map(|e| e.party_id).collect();
        assert_eq!(table.len(), 2);
        assert_eq!(broker.connections[&1].ocb.servers, table);

        let party = *table.iter().next().unwrap();
        let mut body = BytesMut::new();
        w::UnregisterInterface {
            sb_version: version(),
            server_id: party,
        }
        .put(&mut body);
        let response = call(&mut broker, 1, Command::UnregisterInterface, body);
        assert_eq!(response.return_code, 0);

        let table: std::collections::BTreeSet<PartyId> =
            broker.servers.iter().map(|e| e.party_id).collect();
        assert_eq!(table.len(), 1);
        assert_eq!(broker.connections[&1].ocb.servers, table);
    }

    #[tokio::test]
    async fn party_ids_are_unique_and_monotonic() {
        let mut broker = broker();
        connect(&mut broker, 1, 1000, LOCAL_NODE_ADDRESS);
        connect(&mut broker, 2, 1000, LOCAL_NODE_ADDRESS);

        let a = register(&mut broker, 1, "one", None);
        let b = register(&mut broker, 2, "two", None);
        let id_a = w::ServerIdReply::get(&mut a.body.clone()).unwrap().server_id;
        let id_b = w::ServerIdReply::get(&mut b.body.clone()).unwrap().server_id;
        assert_ne!(id_a, id_b);
        assert!(id_b.local > id_a.local);
        assert_eq!(id_a.extended, 1000);
    }

    #[tokio::test]
    async fn remote_connections_may_not_register() {
        let mut broker = broker();
        connect(&mut broker, 1, 1000, 0x0a00_0001);

        let response = register(&mut broker, 1, "remote.Svc", None);
        assert_eq!(response.return_code, Status::BadArgument.code());
    }

    #[tokio::test]
    async fn group_restriction_gates_attach() {
        let mut broker = broker_with(StaticGroups::with(&[(500, 42)]));
        connect(&mut broker, 1, 500, LOCAL_NODE_ADDRESS);
        connect(&mut broker, 2, 501, LOCAL_NODE_ADDRESS);
        connect(&mut broker, 3, 0, LOCAL_NODE_ADDRESS);

        register(&mut broker, 1, "guarded.Svc", Some(42));

        assert_eq!(attach(&mut broker, 1, "guarded.Svc").return_code, 0);
        assert_eq!(
            attach(&mut broker, 2, "guarded.Svc").return_code,
            Status::AccessDenied.code()
        );
        // Root passes regardless of membership.
        assert_eq!(attach(&mut broker, 3, "guarded.Svc").return_code, 0);
    }

    #[tokio::test]
    async fn bad_protocol_version_is_refused_up_front() {
        let mut broker = broker();
        connect(&mut broker, 1, 1000, LOCAL_NODE_ADDRESS);

        let mut body = BytesMut::new();
        w::AttachInterface {
            sb_version: InterfaceVersion::new(99, 0),
            iface: InterfaceDescription::new("x", 1, 0),
        }
        .put(&mut body);
        let response = call(&mut broker, 1, Command::AttachInterface, body);
        assert_eq!(response.return_code, Status::BadFoundationVersion.code());
    }

    #[tokio::test]
    async fn unknown_opcode_is_reported() {
        let mut broker = broker();
        connect(&mut broker, 1, 1000, LOCAL_NODE_ADDRESS);

        let (tx, mut rx) = oneshot::channel();
        broker.dispatch(Request {
            conn: 1,
            opcode: 14,
            body: Bytes::new(),
            reply: tx,
        });
        assert_eq!(
            rx.try_recv().unwrap().return_code,
            Status::UnknownCommand.code()
        );
    }

    #[tokio::test]
    async fn dead_connection_unwinds_servers_and_watches() {
        let mut broker = broker();
        connect(&mut broker, 1, 1000, LOCAL_NODE_ADDRESS);
        connect(&mut broker, 2, 1000, LOCAL_NODE_ADDRESS);

        let response = register(&mut broker, 1, "gone.Svc", None);
        let server_id = w::ServerIdReply::get(&mut response.body.clone())
            .unwrap()
            .server_id;

        // Conn 2 watches the server and the interface list.
        let mut body = BytesMut::new();
        w::NotifyServerDisconnect {
            sb_version: version(),
            server_id,
            pulse: PulseInfo {
                code: 1,
                value: 2,
                chid: 9,
                pid: 999_999,
            },
        }
        .put(&mut body);
        assert_eq!(
            call(&mut broker, 2, Command::NotifyServerDisconnect, body).return_code,
            0
        );
        let mut body = BytesMut::new();
        w::NotifyInterfaceListChange {
            sb_version: version(),
            pulse: PulseInfo {
                code: 3,
                value: 4,
                chid: 9,
                pid: 999_999,
            },
        }
        .put(&mut body);
        call(&mut broker, 2, Command::NotifyInterfaceListChange, body);

        broker.handle_disconnected(1);

        // The server is gone, the disconnect watch was consumed, the
        // persistent list-change watch survives on its own connection.
        assert!(broker.servers.is_empty());
        assert!(broker.disconnect_notifications.is_empty());
        assert_eq!(broker.list_change_notifications.len(), 1);
        assert_eq!(broker.connections[&2].ocb.notifications.len(), 1);
    }

    #[test]
    fn loopback_pid_rewrites_only_for_tcp_names_on_slave_links() {
        let loopback = LOCAL_IP_ADDRESS as i32;
        assert_eq!(
            translate_remote(true, 0x0a00_0001, "media_tcp", loopback),
            0x0a00_0001
        );
        assert_eq!(translate_remote(false, 0x0a00_0001, "media_tcp", loopback), loopback);
        assert_eq!(translate_remote(true, 0x0a00_0001, "media", loopback), loopback);
        assert_eq!(translate_remote(true, 0x0a00_0001, "media_tcp", 4711), 4711);

        assert_eq!(
            translate_local(true, 0x0a00_0002, "media_tcp", loopback),
            0x0a00_0002
        );
        assert_eq!(translate_local(false, 0x0a00_0002, "media_tcp", loopback), loopback);
    }
}

/// Rewrites a loopback pid to our address on the carrying socket when a
/// `_tcp` interface is handed to another broker.
pub(crate) fn translate_local(conn_is_slave: bool, local_addr: u32, name: &str, pid: i32) -> i32 {
    if conn_is_slave && pid as u32 == LOCAL_IP_ADDRESS && InterfaceDescription::is_tcp_name(name) {
        local_addr as i32
    } else {
        pid
    }
}

/// Rewrites a loopback pid to the slave's peer address when a `_tcp`
/// interface arrives from another broker.
pub(crate) fn translate_remote(conn_is_slave: bool, node: u32, name: &str, pid: i32) -> i32 {
    if conn_is_slave && pid as u32 == LOCAL_IP_ADDRESS && InterfaceDescription::is_tcp_name(name) {
        node as i32
    } else {
        pid
    }
}

