//! Slave→master federation: batch forwarding of registrations and
//! notification folds, completion handling for upstream jobs, and the
//! pulse protocol the master uses to reach back into this broker.

use bytes::{Bytes, BytesMut};
use switchboard_types::wire::{
    self, AttachExtendedReply, ConnectionInfo, MasterInterfaceEntry, NotificationDescription,
    ServerInfo,
};
use switchboard_types::{
    Command, NotificationId, PartyId, PulseInfo, Status, INVALID_NOTIFICATION_ID,
};
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, PoolWaiter};
use crate::event::Response;
use crate::master::{Job, JobStatus};
use crate::notify::PoolState;
use crate::registry::Upstream;

/// Pulse codes the master sends to a slave's pulse receiver.
pub const PULSE_MASTER_SERVER_AVAILABLE: i32 = 20;
pub const PULSE_MASTER_SERVER_DISCONNECT: i32 = 21;
pub const PULSE_MASTER_CLIENT_DETACH: i32 = 22;
pub const PULSE_MASTER_SERVERLIST_CHANGE: i32 = 23;
pub const PULSE_MASTER_ATTACH_EXTENDED: i32 = 24;

/// Upper bound of entries per forwarded batch.
pub const MAX_BATCH: usize = 32;

/// Where the master should pulse this broker: our address as seen on the
/// master link plus the slave pulse port.
#[derive(Debug, Clone, Copy)]
pub struct SignallingAddress {
    /// Our IPv4 address towards the master, host order; -1 lets the
    /// master fall back to the peer address it sees.
    pub pid: i32,
    /// The slave pulse port.
    pub chid: i32,
}

impl SignallingAddress {
    pub fn unset() -> Self {
        Self { pid: -1, chid: 0 }
    }

    pub fn pulse(&self, code: i32, value: i32) -> PulseInfo {
        PulseInfo {
            code,
            value,
            chid: self.chid,
            pid: self.pid,
        }
    }
}

impl Broker {
    // -----------------------------------------------------------------
    // Outgoing federation jobs
    // -----------------------------------------------------------------

    /// Forwards every not-yet-forwarded, forwardable server upstream, in
    /// batches of at most [`MAX_BATCH`].
    pub(crate) fn register_interfaces_master(&mut self) {
        if !self.master_connected() {
            return;
        }

        let mut batches: Vec<Vec<MasterInterfaceEntry>> = Vec::new();
        let mut batch: Vec<MasterInterfaceEntry> = Vec::new();
        {
            let Broker { servers, rules, .. } = self;
            for entry in servers.iter_mut() {
                if entry.upstream != Upstream::None
                    || entry.local
                    || !rules.forward_service(&entry.iface.name)
                {
                    continue;
                }
                entry.upstream = Upstream::Pending;
                batch.push(MasterInterfaceEntry {
                    impl_version: entry.impl_version,
                    chid: entry.chid,
                    pid: entry.pid,
                    nd: entry.nid as i32,
                    server_id: entry.party_id,
                    iface: entry.iface.clone(),
                });
                if batch.len() == MAX_BATCH {
                    batches.push(std::mem::take(&mut batch));
                }
            }
        }
        if !batch.is_empty() {
            batches.push(batch);
        }

        for entries in batches {
            let count = entries.len();
            let mut body = BytesMut::new();
            wire::RegisterMasterInterfaceEx {
                sb_version: Broker::protocol_version(),
                entries,
            }
            .put(&mut body);
            self.forward_job(Job::new(
                count as i32,
                Command::RegisterMasterInterfaceEx,
                body.freeze(),
            ));
        }
    }

    /// Clears one upstream registration, if there is one to clear.
    pub(crate) fn unregister_interface_master(&mut self, upstream: Upstream) {
        let Upstream::Registered(master_id) = upstream else {
            return;
        };
        if !self.master_connected() {
            return;
        }
        let mut body = BytesMut::new();
        wire::UnregisterInterface {
            sb_version: Broker::protocol_version(),
            server_id: master_id,
        }
        .put(&mut body);
        self.forward_job(Job::new(0, Command::UnregisterInterface, body.freeze()));
    }

    /// Folds all unpooled, forwardable connect notifications into pools
    /// and announces new pools upstream, batched.
    pub(crate) fn forward_server_available_notifications(&mut self) {
        if !self.master_connected() {
            return;
        }

        let mut batches: Vec<Vec<NotificationDescription>> = Vec::new();
        let mut batch: Vec<NotificationDescription> = Vec::new();
        {
            let Broker {
                connect_notifications,
                pools,
                rules,
                sig_addr,
                ..
            } = self;
            for n in connect_notifications.iter_mut() {
                if n.pool_id != 0 || n.local {
                    continue;
                }
                let Some(iface) = n.iface.clone() else {
                    continue;
                };
                if !rules.forward_service(&iface.name) {
                    continue;
                }

                let pool_id = match pools.find_interface(&iface, false) {
                    Some(pool) => pool.pool_id(),
                    None => {
                        let pool_id = pools.add_interface(iface.clone(), false);
                        batch.push(NotificationDescription {
                            cookie: pool_id,
                            pulse: sig_addr
                                .pulse(PULSE_MASTER_SERVER_AVAILABLE, pool_id as i32),
                            iface,
                        });
                        if batch.len() == MAX_BATCH {
                            batches.push(std::mem::take(&mut batch));
                        }
                        pool_id
                    }
                };
                if let Some(pool) = pools.find(pool_id) {
                    pool.attach(n);
                }
            }
        }
        if !batch.is_empty() {
            batches.push(batch);
        }

        for entries in batches {
            let count = entries.len();
            let mut body = BytesMut::new();
            wire::NotifyServerAvailableEx {
                sb_version: Broker::protocol_version(),
                entries,
            }
            .put(&mut body);
            self.forward_job(Job::new(
                count as i32,
                Command::NotifyServerAvailableEx,
                body.freeze(),
            ));
        }
    }

    /// Creates the upstream half of a disconnect-monitor pool.
    pub(crate) fn forward_server_disconnect(&mut self, server_id: PartyId, pool_id: u32) {
        let mut body = BytesMut::new();
        wire::NotifyServerDisconnect {
            sb_version: Broker::protocol_version(),
            server_id,
            pulse: self
                .sig_addr
                .pulse(PULSE_MASTER_SERVER_DISCONNECT, pool_id as i32),
        }
        .put(&mut body);
        self.forward_job(Job::new(
            pool_id as i32,
            Command::NotifyServerDisconnect,
            body.freeze(),
        ));
    }

    /// Arms the upstream half of a client-detach watch.
    pub(crate) fn forward_client_detach(&mut self, client_id: PartyId, id: NotificationId) {
        let mut body = BytesMut::new();
        wire::NotifyClientDetach {
            sb_version: Broker::protocol_version(),
            client_id,
            pulse: self.sig_addr.pulse(PULSE_MASTER_CLIENT_DETACH, id as i32),
        }
        .put(&mut body);
        self.forward_job(Job::new(
            id as i32,
            Command::NotifyClientDetach,
            body.freeze(),
        ));
    }

    /// Forwards a detach of an upstream-managed client, fire-and-forget.
    pub(crate) fn forward_detach(&mut self, client_id: PartyId) {
        let mut body = BytesMut::new();
        wire::DetachInterface {
            sb_version: Broker::protocol_version(),
            client_id,
        }
        .put(&mut body);
        self.forward_job(Job::new(0, Command::DetachInterface, body.freeze()));
    }

    /// Mirrors a list-change watch on the master.
    pub(crate) fn forward_list_change(&mut self, id: NotificationId, regex: Option<String>) {
        let pulse = self
            .sig_addr
            .pulse(PULSE_MASTER_SERVERLIST_CHANGE, id as i32);
        let mut body = BytesMut::new();
        let cmd = match regex {
            Some(regex) => {
                wire::NotifyInterfaceListMatch {
                    sb_version: Broker::protocol_version(),
                    pulse,
                    regex,
                }
                .put(&mut body);
                Command::NotifyInterfaceListMatch
            }
            None => {
                wire::NotifyInterfaceListChange {
                    sb_version: Broker::protocol_version(),
                    pulse,
                }
                .put(&mut body);
                Command::NotifyInterfaceListChange
            }
        };
        self.forward_job(Job::new(id as i32, cmd, body.freeze()));
    }

    /// Clears a notification the master still holds for us.
    pub(crate) fn clear_notification_upstream(&mut self, master_id: NotificationId) {
        if !self.master_connected() {
            return;
        }
        let mut body = BytesMut::new();
        wire::ClearNotification {
            sb_version: Broker::protocol_version(),
            notification_id: master_id,
        }
        .put(&mut body);
        self.forward_job(Job::new(0, Command::ClearNotification, body.freeze()));
    }

    // -----------------------------------------------------------------
    // Attach-extended forwarding
    // -----------------------------------------------------------------

    /// The attach-extended slow path: fold the caller's watch into a
    /// deferred pool and ask the master whether the server exists.
    pub(crate) fn forward_attach_extended_to_master(
        &mut self,
        conn: crate::ConnId,
        arg: wire::AttachInterfaceExtended,
        reply: &mut Option<crate::event::ReplySender>,
    ) -> Option<Response> {
        let is_local = self.rules.is_local_service(&arg.iface.name);

        let (pool_id, pool_found) = match self.pools.find_interface(&arg.iface, true) {
            Some(pool) => (pool.pool_id(), true),
            None => (self.pools.add_interface(arg.iface.clone(), true), false),
        };

        let mut notification = self.arm_notification(conn, arg.pulse);
        notification.iface = Some(arg.iface.clone());
        notification.local = is_local;
        notification.uid = self.ctx(conn).uid;
        let notification_id = notification.id;
        self.connect_notifications.add(notification);
        self.ocb_mut(conn).add_notification(notification_id);
        {
            let Broker {
                pools,
                connect_notifications,
                ..
            } = self;
            if let (Some(pool), Some(n)) = (
                pools.find(pool_id),
                connect_notifications.find(notification_id),
            ) {
                pool.attach(n);
            }
        }

        let state = self
            .pools
            .find(pool_id)
            .map(|p| p.state())
            .unwrap_or(PoolState::Deferred);
        let send_job = !pool_found || state == PoolState::Connected;

        if send_job {
            debug!(" forwarding ATTACH_INTERFACE_EXTENDED to master for notification {notification_id}");
            let job_id = self.next_pending_id();
            self.pending_attach_extended.insert(job_id, notification_id);

            let mut forwarded = arg.clone();
            forwarded.pulse = self
                .sig_addr
                .pulse(PULSE_MASTER_ATTACH_EXTENDED, pool_id as i32);
            let mut body = BytesMut::new();
            forwarded.put(&mut body);

            let mut job = Job::new(job_id as i32, Command::AttachInterfaceExtended, body.freeze());
            if !self.settings.async_attach {
                job = job.with_deferred(conn, reply.take().expect("reply available"));
            }

            if state == PoolState::Connected {
                if let Some(pool) = self.pools.find(pool_id) {
                    pool.set_state(PoolState::Precaching);
                }
            }
            self.forward_job(job);

            if self.settings.async_attach {
                return Some(unknown_interface_reply(notification_id));
            }
            return None;
        }

        if state == PoolState::Precaching {
            // A probe is already on the wire; park this client on its answer.
            self.pool_waiters
                .entry(pool_id)
                .or_default()
                .push(PoolWaiter {
                    conn,
                    reply: reply.take().expect("reply available"),
                    notification_id,
                });
            return None;
        }

        Some(unknown_interface_reply(notification_id))
    }

    /// Completion of a forwarded attach-extended: the master's answer
    /// decides whether the folded watches become disconnect monitors.
    fn job_finished_attach_extended(&mut self, job: &mut Job) {
        let job_id = job.cookie as u32;

        let Some(main_id) = self.pending_attach_extended.remove(&job_id) else {
            error!("pending attach extended job {job_id} not found");
            job.status = JobStatus::Internal;
            return;
        };
        let Some(pool_id) = self
            .connect_notifications
            .find(main_id)
            .map(|n| n.pool_id)
            .filter(|&id| id != 0)
        else {
            error!("no pooled notification {main_id} for attach extended job");
            job.status = JobStatus::Internal;
            return;
        };
        let Some(state) = self.pools.find(pool_id).map(|p| p.state()) else {
            error!("no pool {pool_id} for attach extended job");
            job.status = JobStatus::Internal;
            return;
        };
        if state != PoolState::Deferred && state != PoolState::Precaching {
            error!("inconsistent state {} for pool {pool_id}", state.as_str());
            job.status = JobStatus::Internal;
            return;
        }

        let Ok(reply) = AttachExtendedReply::get(&mut job.response.clone()) else {
            job.status = JobStatus::Internal;
            return;
        };
        let master_notification_id = reply.notification_id;

        if let Some(pool) = self.pools.find(pool_id) {
            pool.master_id = master_notification_id;
        }
        let count = self
            .connect_notifications
            .set_master_id(pool_id, master_notification_id);
        if state == PoolState::Deferred && count == 0 {
            error!("no attach notification found for pool {pool_id}");
            job.status = JobStatus::Internal;
            return;
        }

        // The master fills in channel coordinates iff the server exists.
        let is_disconnect = reply.conn.channel.chid != 0;
        let waiters = self.pool_waiters.remove(&pool_id).unwrap_or_default();

        if is_disconnect {
            if self.settings.use_cache {
                let iface = self.pools.find(pool_id).and_then(|p| p.interface().cloned());
                match iface {
                    Some(iface) => self.cache.insert(
                        iface,
                        ServerInfo {
                            channel: reply.conn.channel,
                            server_id: reply.conn.server_id,
                        },
                    ),
                    None => warn!("cannot update cache on the basis of pool {pool_id}"),
                }
            }

            if self.settings.async_attach {
                // Clients learn about availability through their watches.
                self.master_server_available(pool_id);
            } else if let Some(deferred) = job.deferred.take() {
                let client_id = self.add_client(deferred.conn, reply.conn.server_id);
                let _ = deferred.reply.send(attach_reply(
                    Status::Ok,
                    reply.conn,
                    client_id,
                    main_id,
                ));
            }

            let moved = self
                .disconnect_notifications
                .adopt_pool(&mut self.connect_notifications, pool_id);
            self.disconnect_notifications
                .retag_pool(pool_id, reply.conn.server_id);
            if let Some(pool) = self.pools.find(pool_id) {
                pool.monitor_disconnect(reply.conn.server_id);
            }
            if moved > 0 {
                debug!("moved {moved} deferred -> disconnect notifications");
            }

            for waiter in waiters {
                let client_id = self.add_client(waiter.conn, reply.conn.server_id);
                let _ = waiter.reply.send(attach_reply(
                    Status::Ok,
                    reply.conn,
                    client_id,
                    waiter.notification_id,
                ));
            }
        } else {
            if state == PoolState::Deferred {
                if let Some(pool) = self.pools.find(pool_id) {
                    pool.set_state(PoolState::Connecting);
                }
            }
            if let Some(deferred) = job.deferred.take() {
                let _ = deferred.reply.send(unknown_interface_reply(main_id));
            }
            for waiter in waiters {
                let _ = waiter
                    .reply
                    .send(unknown_interface_reply(waiter.notification_id));
            }
        }
    }

    // -----------------------------------------------------------------
    // Job completion
    // -----------------------------------------------------------------

    pub(crate) fn handle_job_finished(&mut self, mut job: Box<Job>) {
        if job.status != JobStatus::Ok {
            error!("job {} returned error {:?}", job.cmd, job.status);
        } else {
            if job.ret != Status::Ok.code() {
                warn!("job {} answered {}", job.cmd, job.ret);
            }
            self.job_finished_ok(&mut job);
        }

        // Whoever is still waiting gets the outcome now.
        if let Some(deferred) = job.deferred.take() {
            let response = if job.status != JobStatus::Ok {
                Response::status(Status::InternalError)
            } else if job.ret <= 0 {
                Response::with_code(job.ret, job.response.clone())
            } else {
                Response::with_code(job.ret, Bytes::new())
            };
            let _ = deferred.reply.send(response);
        }
    }

    fn job_finished_ok(&mut self, job: &mut Job) {
        match job.cmd {
            Command::AttachInterface => {
                if job.ret != Status::Ok.code() {
                    self.pending_remote.remove(&(job.cookie as u32));
                    return;
                }
                let Ok(info) = ConnectionInfo::get(&mut job.response.clone()) else {
                    job.status = JobStatus::Internal;
                    return;
                };
                debug!(
                    " ATTACH_INTERFACE job {} - CLIENT_ID: {}, SERVER_ID: {}",
                    job.cookie, info.client_id, info.server_id
                );
                if let Some(deferred) = &job.deferred {
                    if let Some(connection) = self.connections.get_mut(&deferred.conn) {
                        connection.ocb.clients.insert(info.client_id);
                    }
                }
                if let Some(iface) = self.pending_remote.remove(&(job.cookie as u32)) {
                    if self.settings.use_cache {
                        self.cache.insert(
                            iface,
                            ServerInfo {
                                channel: info.channel,
                                server_id: info.server_id,
                            },
                        );
                    }
                }
            }

            Command::GetServerInformation => {
                match self.pending_remote.remove(&(job.cookie as u32)) {
                    Some(iface) => {
                        if job.ret == Status::Ok.code() && self.settings.use_cache {
                            if let Ok(info) = ServerInfo::get(&mut job.response.clone()) {
                                self.cache.insert(iface, info);
                            }
                        }
                    }
                    None => {
                        error!("no pending remote server request for job {}", job.cookie);
                        job.status = JobStatus::Internal;
                    }
                }
            }

            Command::AttachInterfaceExtended => self.job_finished_attach_extended(job),

            Command::GetInterfaceList | Command::MatchInterfaceList => {
                self.job_finished_interface_list(job)
            }

            Command::RegisterMasterInterfaceEx => {
                let mut buf = job.response.clone();
                let Ok(ids) = wire::get_party_ids(&mut buf, job.cookie as usize) else {
                    job.status = JobStatus::Internal;
                    return;
                };
                for id in ids {
                    match self.servers.find_pending_by_local(id.local) {
                        Some(entry) => {
                            if id.extended == u32::MAX {
                                error!(
                                    "error forwarding interface {} to master (see master log)",
                                    entry.iface.name
                                );
                            } else {
                                entry.upstream = Upstream::Registered(id);
                            }
                        }
                        None => {
                            // The interface is already gone again.
                            if (id.extended as i32) > 0 {
                                self.unregister_interface_master(Upstream::Registered(id));
                            }
                        }
                    }
                }
            }

            Command::NotifyServerAvailableEx => {
                let mut buf = job.response.clone();
                let Ok(pairs) =
                    wire::get_cookie_notification_ids(&mut buf, job.cookie as usize)
                else {
                    job.status = JobStatus::Internal;
                    return;
                };
                for pair in pairs {
                    if pair.notification_id == INVALID_NOTIFICATION_ID {
                        continue;
                    }
                    match self.pools.find(pair.cookie) {
                        Some(pool) => pool.master_id = pair.notification_id,
                        None => self.clear_notification_upstream(pair.notification_id),
                    }
                }
            }

            Command::NotifyServerDisconnect => {
                let Ok(reply) = wire::NotificationIdReply::get(&mut job.response.clone()) else {
                    job.status = JobStatus::Internal;
                    return;
                };
                match self.pools.find(job.cookie as u32) {
                    Some(pool) => pool.master_id = reply.notification_id,
                    None => self.clear_notification_upstream(reply.notification_id),
                }
            }

            Command::NotifyClientDetach => {
                let Ok(reply) = wire::NotificationIdReply::get(&mut job.response.clone()) else {
                    job.status = JobStatus::Internal;
                    return;
                };
                match self.detach_notifications.find(job.cookie as u32) {
                    Some(n) => n.master_id = reply.notification_id,
                    None => self.clear_notification_upstream(reply.notification_id),
                }
            }

            Command::NotifyInterfaceListChange | Command::NotifyInterfaceListMatch => {
                let Ok(reply) = wire::NotificationIdReply::get(&mut job.response.clone()) else {
                    job.status = JobStatus::Internal;
                    return;
                };
                match self.list_change_notifications.find(job.cookie as u32) {
                    Some(n) => n.master_id = reply.notification_id,
                    None => self.clear_notification_upstream(reply.notification_id),
                }
            }

            Command::DetachInterface
            | Command::UnregisterInterface
            | Command::ClearNotification => {
                debug!(" {} completed with {}", job.cmd, job.ret);
            }

            cmd => debug!("{cmd} completion not handled"),
        }
    }

    /// Appends our local and non-forwarded interfaces behind the master's
    /// list answer, capacity permitting.
    fn job_finished_interface_list(&mut self, job: &mut Job) {
        let capacity = job.cookie as usize;
        let mut count = job.ret as usize;
        let mut body = BytesMut::from(&job.response[..]);

        for entry in self.servers.iter() {
            if !entry.local && self.rules.forward_service(&entry.iface.name) {
                continue; // already in the master's answer
            }
            if let Some(regex) = &job.regex {
                if !regex.is_match(&entry.iface.name) {
                    continue;
                }
            }
            if count >= capacity {
                job.status = JobStatus::Invalid;
                job.response = Bytes::new();
                return;
            }
            entry.iface.put(&mut body);
            count += 1;
        }

        debug!("interface list job finished with {count} entries");
        job.response = body.freeze();
        job.ret = -(count as i32);
    }

    // -----------------------------------------------------------------
    // Master link events
    // -----------------------------------------------------------------

    pub(crate) fn handle_master_connected(&mut self) {
        let address = self
            .master
            .as_ref()
            .map(|m| m.address().to_string())
            .unwrap_or_default();
        info!("opened master: {address}");

        self.register_interfaces_master();
        self.forward_server_available_notifications();
    }

    pub(crate) fn handle_master_disconnected(&mut self) {
        let address = self
            .master
            .as_ref()
            .map(|m| m.address().to_string())
            .unwrap_or_default();
        info!("connection to master lost: {address}");

        self.servers.clear_upstream();
        self.pools.clear();
        self.pending_remote.clear();
        self.pending_attach_extended.clear();
        for (_, waiters) in self.pool_waiters.drain() {
            for waiter in waiters {
                let _ = waiter.reply.send(Response::status(Status::InternalError));
            }
        }

        // The cache must be gone before any watches derived from it fire.
        if self.settings.use_cache {
            self.clients.remove_not_local(self.settings.extended_id);
            self.cache.clear();
        }

        // Watches on servers that only existed beyond the master fire a
        // synthetic disconnect; servers visible here live on our own
        // slaves and are unaffected.
        let ours = self.settings.extended_id;
        let fired = {
            let Broker {
                disconnect_notifications,
                servers,
                ..
            } = self;
            disconnect_notifications.send_and_take(|n| {
                n.active && n.party.extended != ours && servers.find_party(n.party).is_none()
            })
        };
        self.finalize_all(fired);

        let fired = self.detach_notifications.trigger_not_local(ours);
        self.finalize_all(fired);

        self.connect_notifications.clear_master_refs();
    }

    // -----------------------------------------------------------------
    // Pulses from the master
    // -----------------------------------------------------------------

    pub(crate) fn dispatch_pulse(&mut self, code: i32, value: i32) {
        match code {
            PULSE_MASTER_SERVER_AVAILABLE => self.master_server_available(value as u32),
            PULSE_MASTER_SERVER_DISCONNECT => self.master_server_disconnect(value as u32),
            PULSE_MASTER_CLIENT_DETACH => self.master_client_detach(value as u32),
            PULSE_MASTER_SERVERLIST_CHANGE => self.master_serverlist_change(value as u32),
            PULSE_MASTER_ATTACH_EXTENDED => self.master_attach_extended(value as u32),
            _ => {}
        }
    }

    pub(crate) fn master_server_available(&mut self, pool_id: u32) {
        debug!("*PULSE_MASTER_SERVER_AVAILABLE -{pool_id}-");
        let fired = self.connect_notifications.trigger_pool(pool_id);
        self.finalize_all(fired);
    }

    fn master_server_disconnect(&mut self, pool_id: u32) {
        debug!("*PULSE_MASTER_SERVER_DISCONNECT -{pool_id}-");
        if self.settings.use_cache {
            if let Some(server_id) = self.pools.find(pool_id).and_then(|p| p.server_id()) {
                self.cache.remove_server(server_id);
                self.clients.remove_server(server_id);
            }
        }
        let fired = self.disconnect_notifications.trigger_pool(pool_id);
        self.finalize_all(fired);
    }

    fn master_client_detach(&mut self, value: u32) {
        debug!("*PULSE_MASTER_CLIENT_DETACH -{value}-");
        let party = self.detach_notifications.find(value).map(|n| n.party);
        let fired = match party {
            Some(party) => self.detach_notifications.trigger_party(party),
            None => self
                .detach_notifications
                .trigger_id(value, true)
                .into_iter()
                .collect(),
        };
        self.finalize_all(fired);
    }

    fn master_serverlist_change(&mut self, value: u32) {
        debug!("*PULSE_MASTER_SERVERLIST_CHANGE -{value}-");
        self.list_change_notifications.trigger_id(value, false);
    }

    fn master_attach_extended(&mut self, pool_id: u32) {
        debug!("*PULSE_MASTER_ATTACH_EXTENDED -{pool_id}-");
        let Some(state) = self.pools.find(pool_id).map(|p| p.state()) else {
            error!("*PULSE_MASTER_ATTACH_EXTENDED -{pool_id}- no pool");
            return;
        };

        match state {
            PoolState::MonitorDisconnect => self.master_server_disconnect(pool_id),
            PoolState::Connecting => {
                if let Some(pool) = self.pools.find(pool_id) {
                    pool.set_state(PoolState::Connected);
                }
                if self.settings.async_attach {
                    self.send_async_conversion_probe(pool_id);
                } else {
                    // The pool migrates to PRECACHING with the next
                    // attach-extended a client sends.
                    self.master_server_available(pool_id);
                }
            }
            other => error!(
                "*PULSE_MASTER_ATTACH_EXTENDED pool state {} is not valid",
                other.as_str()
            ),
        }
    }

    /// Async attach mode: the server became available; issue the second
    /// attach internally so the folded watches convert to disconnect
    /// monitors and the cache learns the coordinates.
    fn send_async_conversion_probe(&mut self, pool_id: u32) {
        let Some(iface) = self.pools.find(pool_id).and_then(|p| p.interface().cloned()) else {
            return;
        };
        let Some(main_id) = self
            .connect_notifications
            .iter()
            .find(|n| n.pool_id == pool_id)
            .map(|n| n.id)
        else {
            // Nothing left to convert; deliver availability directly.
            self.master_server_available(pool_id);
            return;
        };

        let job_id = self.next_pending_id();
        self.pending_attach_extended.insert(job_id, main_id);

        let mut body = BytesMut::new();
        wire::AttachInterfaceExtended {
            sb_version: Broker::protocol_version(),
            pulse: self
                .sig_addr
                .pulse(PULSE_MASTER_ATTACH_EXTENDED, pool_id as i32),
            iface,
        }
        .put(&mut body);
        self.forward_job(Job::new(
            job_id as i32,
            Command::AttachInterfaceExtended,
            body.freeze(),
        ));
    }
}

fn unknown_interface_reply(notification_id: NotificationId) -> Response {
    let mut body = BytesMut::new();
    AttachExtendedReply {
        conn: ConnectionInfo::default(),
        notification_id,
    }
    .put(&mut body);
    Response::with_code(Status::UnknownInterface.code(), body.freeze())
}

fn attach_reply(
    status: Status,
    mut conn: ConnectionInfo,
    client_id: PartyId,
    notification_id: NotificationId,
) -> Response {
    conn.client_id = client_id;
    let mut body = BytesMut::new();
    AttachExtendedReply {
        conn,
        notification_id,
    }
    .put(&mut body);
    Response::with_code(status.code(), body.freeze())
}
