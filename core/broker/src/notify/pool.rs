//! Proxy pools: one upstream notification standing in for many local ones.
//!
//! For each distinct predicate — an interface description or a remote
//! server id — the broker keeps one pool entry. All local notifications
//! with that predicate carry the pool id; only the pool talks to the
//! master. When the last member detaches the pool removes itself and
//! reports which upstream notification must be cleared.

use switchboard_types::{
    InterfaceDescription, NotificationId, PartyId, INVALID_NOTIFICATION_ID,
};
use tracing::{debug, error};

use super::Notification;

/// What a pool aggregates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolKey {
    Interface(InterfaceDescription),
    Server(PartyId),
}

/// Pool life cycle; see the attach-extended flow for the transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Members are still undecided between connect and disconnect.
    Deferred,
    /// Members are connect notifications.
    Connecting,
    /// The server exists upstream; no probe in flight.
    Connected,
    /// The server exists upstream and a probe for its coordinates is
    /// already on the wire; later clients wait for that answer.
    Precaching,
    /// Members are disconnect notifications.
    MonitorDisconnect,
}

impl PoolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolState::Deferred => "DEFERRED",
            PoolState::Connecting => "CONNECTING",
            PoolState::Connected => "CONNECTED",
            PoolState::Precaching => "PRECACHING",
            PoolState::MonitorDisconnect => "MONITOR_DISCONNECT",
        }
    }
}

/// One proxy pool.
#[derive(Debug)]
pub struct PoolEntry {
    pool_id: u32,
    pub key: PoolKey,
    state: PoolState,
    /// The single upstream notification id owned by this pool.
    pub master_id: NotificationId,
    ref_count: u32,
}

impl PoolEntry {
    pub fn pool_id(&self) -> u32 {
        self.pool_id
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn interface(&self) -> Option<&InterfaceDescription> {
        match &self.key {
            PoolKey::Interface(iface) => Some(iface),
            PoolKey::Server(_) => None,
        }
    }

    pub fn server_id(&self) -> Option<PartyId> {
        match &self.key {
            PoolKey::Server(id) => Some(*id),
            PoolKey::Interface(_) => None,
        }
    }

    /// Folds a notification into this pool.
    pub fn attach(&mut self, notification: &mut Notification) {
        notification.pool_id = self.pool_id;
        self.ref_count += 1;
    }

    /// Forward transition along DEFERRED → CONNECTING → CONNECTED →
    /// PRECACHING; anything else is a consistency error and is refused.
    pub fn set_state(&mut self, new: PoolState) -> bool {
        let legal = matches!(
            (self.state, new),
            (PoolState::Deferred, PoolState::Connecting)
                | (PoolState::Connecting, PoolState::Connected)
                | (PoolState::Connected, PoolState::Precaching)
        );
        if legal {
            self.state = new;
        } else {
            error!(
                "cannot change pool state from {} to {}",
                self.state.as_str(),
                new.as_str()
            );
        }
        legal
    }

    /// Converts a deferred (or precaching) pool into a disconnect monitor
    /// on the given server.
    pub fn monitor_disconnect(&mut self, server_id: PartyId) -> bool {
        if !matches!(self.state, PoolState::Deferred | PoolState::Precaching) {
            error!(
                "cannot change pool state from {} to MONITOR_DISCONNECT",
                self.state.as_str()
            );
            return false;
        }
        self.state = PoolState::MonitorDisconnect;
        self.key = PoolKey::Server(server_id);
        true
    }
}

/// Outcome of detaching one notification from its pool.
#[derive(Debug, PartialEq, Eq)]
pub enum PoolDetach {
    /// Other members remain.
    Remaining,
    /// The pool vanished; clear this upstream notification if set.
    Removed { master_id: Option<NotificationId> },
    /// No such pool.
    NotFound,
}

/// All pools of one broker.
#[derive(Debug)]
pub struct NotificationPool {
    entries: Vec<PoolEntry>,
    next_pool_id: u32,
    total: u32,
}

impl Default for NotificationPool {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_pool_id: 100_000,
            total: 0,
        }
    }
}

impl NotificationPool {
    fn push(&mut self, key: PoolKey, state: PoolState) -> u32 {
        let pool_id = self.next_pool_id;
        self.next_pool_id += 1;
        self.total += 1;
        self.entries.push(PoolEntry {
            pool_id,
            key,
            state,
            master_id: INVALID_NOTIFICATION_ID,
            ref_count: 0,
        });
        pool_id
    }

    /// Creates an interface pool; deferred pools belong to the
    /// attach-extended flow.
    pub fn add_interface(&mut self, iface: InterfaceDescription, deferred: bool) -> u32 {
        let state = if deferred {
            PoolState::Deferred
        } else {
            PoolState::Connecting
        };
        self.push(PoolKey::Interface(iface), state)
    }

    /// Creates a disconnect-monitor pool on a remote server.
    pub fn add_server(&mut self, server_id: PartyId) -> u32 {
        self.push(PoolKey::Server(server_id), PoolState::MonitorDisconnect)
    }

    /// Finds a connect pool on this interface. With `extended_search`,
    /// deferred and precaching pools qualify too.
    pub fn find_interface(
        &mut self,
        iface: &InterfaceDescription,
        extended_search: bool,
    ) -> Option<&mut PoolEntry> {
        self.entries.iter_mut().rev().find(|e| {
            (e.state == PoolState::Connecting
                || (extended_search && e.state != PoolState::MonitorDisconnect))
                && e.interface() == Some(iface)
        })
    }

    /// Finds the disconnect-monitor pool on a server.
    pub fn find_server(&mut self, server_id: PartyId) -> Option<&mut PoolEntry> {
        self.entries
            .iter_mut()
            .rev()
            .find(|e| e.state == PoolState::MonitorDisconnect && e.server_id() == Some(server_id))
    }

    pub fn find(&mut self, pool_id: u32) -> Option<&mut PoolEntry> {
        self.entries.iter_mut().find(|e| e.pool_id == pool_id)
    }

    /// Unfolds one notification; an emptied pool removes itself.
    pub fn detach(&mut self, pool_id: u32) -> PoolDetach {
        let Some(pos) = self.entries.iter().position(|e| e.pool_id == pool_id) else {
            return PoolDetach::NotFound;
        };
        let entry = &mut self.entries[pos];
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count > 0 {
            return PoolDetach::Remaining;
        }

        debug!("removing pool {pool_id}");
        let entry = self.entries.remove(pos);
        PoolDetach::Removed {
            master_id: (entry.master_id != INVALID_NOTIFICATION_ID).then_some(entry.master_id),
        }
    }

    /// Drops every pool without upstream interaction (master link died).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &PoolEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total(&self) -> u32 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pulse::{PulseAddr, PulseChannels};
    use switchboard_types::{PulseInfo, LOCAL_NODE_ADDRESS};

    fn iface() -> InterfaceDescription {
        InterfaceDescription::new("X", 1, 0)
    }

    #[tokio::test]
    async fn refcount_tracks_members_and_reports_cleanup() {
        let mut channels = PulseChannels::default();
        let handle = channels.attach(PulseAddr {
            nid: LOCAL_NODE_ADDRESS,
            pid: 1,
            chid: 1,
        });
        let mut pools = NotificationPool::default();
        let pool_id = pools.add_interface(iface(), false);

        let mut a = Notification::new(1, PulseInfo::default(), handle.clone());
        let mut b = Notification::new(2, PulseInfo::default(), handle);
        let entry = pools.find(pool_id).unwrap();
        entry.attach(&mut a);
        entry.attach(&mut b);
        entry.master_id = 55;
        assert_eq!(entry.ref_count(), 2);
        assert_eq!(a.pool_id, pool_id);

        assert_eq!(pools.detach(pool_id), PoolDetach::Remaining);
        assert_eq!(
            pools.detach(pool_id),
            PoolDetach::Removed { master_id: Some(55) }
        );
        assert!(pools.is_empty());
        assert_eq!(pools.detach(pool_id), PoolDetach::NotFound);
    }

    #[test]
    fn find_interface_skips_deferred_without_extended_search() {
        let mut pools = NotificationPool::default();
        pools.add_interface(iface(), true);

        assert!(pools.find_interface(&iface(), false).is_none());
        assert!(pools.find_interface(&iface(), true).is_some());
    }

    #[test]
    fn state_machine_rejects_illegal_transitions() {
        let mut pools = NotificationPool::default();
        let id = pools.add_interface(iface(), true);
        let entry = pools.find(id).unwrap();

        assert!(!entry.set_state(PoolState::Connected));
        assert!(entry.set_state(PoolState::Connecting));
        assert!(entry.set_state(PoolState::Connected));
        assert!(entry.set_state(PoolState::Precaching));
        assert!(!entry.set_state(PoolState::Connecting));
    }

    #[test]
    fn deferred_pool_can_become_disconnect_monitor() {
        let mut pools = NotificationPool::default();
        let id = pools.add_interface(iface(), true);
        let server = PartyId::new(1, 500001);

        let entry = pools.find(id).unwrap();
        assert!(entry.monitor_disconnect(server));
        assert_eq!(entry.state(), PoolState::MonitorDisconnect);
        assert_eq!(entry.server_id(), Some(server));
        assert!(pools.find_server(server).is_some());
        assert!(pools.find_interface(&iface(), true).is_none());
    }
}
