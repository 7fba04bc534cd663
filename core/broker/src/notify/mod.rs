//! Armed notifications and the lists that hold them.
//!
//! A notification is a commitment to deliver one `{code, value}` pulse to a
//! target endpoint when its trigger condition occurs. Most kinds are
//! consumed by delivery; interface-list-change notifications persist.
//!
//! Lists only mutate themselves and send pulses. Consumed entries are
//! returned to the caller, which finalizes them (OCB unlink, pool detach,
//! upstream clear) — the cross-table walk the original middleware hid in
//! destructors happens explicitly on the dispatcher.

mod pool;

pub use pool::{NotificationPool, PoolDetach, PoolEntry, PoolKey, PoolState};

use regex::Regex;
use switchboard_types::{
    InterfaceDescription, NotificationId, PartyId, PulseInfo, INVALID_NOTIFICATION_ID,
    UNKNOWN_GROUP_ID, UNKNOWN_USER_ID,
};
use tracing::{debug, warn};

use crate::access::{check_access, GroupAccess};
use crate::pulse::PulseHandle;
use crate::ConnId;

/// A single armed notification.
#[derive(Debug)]
pub struct Notification {
    pub id: NotificationId,
    /// Counterpart id on the master broker, if one was armed there.
    pub master_id: NotificationId,
    /// Proxy pool this notification is folded into; 0 = none.
    pub pool_id: u32,
    /// Connection whose OCB owns the id.
    pub owner: Option<ConnId>,
    /// Target party for disconnect/detach notifications.
    pub party: PartyId,
    /// Armed interface for connect notifications.
    pub iface: Option<InterfaceDescription>,
    /// Armed against a `[LOCAL]` service; never folded upstream.
    pub local: bool,
    /// Uid of the arming process, for group-restricted delivery.
    pub uid: u32,
    /// Inactive entries are retained but never fire.
    pub active: bool,
    regex: Option<Regex>,
    pulse: PulseInfo,
    handle: PulseHandle,
}

impl Notification {
    pub fn new(id: NotificationId, pulse: PulseInfo, handle: PulseHandle) -> Self {
        debug!("NOTIFICATION_ID {id}");
        Self {
            id,
            master_id: INVALID_NOTIFICATION_ID,
            pool_id: 0,
            owner: None,
            party: PartyId::NULL,
            iface: None,
            local: false,
            uid: UNKNOWN_USER_ID,
            active: true,
            regex: None,
            pulse,
            handle,
        }
    }

    pub fn with_regex(mut self, regex: Regex) -> Self {
        self.regex = Some(regex);
        self
    }

    pub fn has_regex(&self) -> bool {
        self.regex.is_some()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.as_ref().is_some_and(|re| re.is_match(name))
    }

    /// Delivers the armed pulse. Failures are handled (and swallowed) by
    /// the channel writer.
    pub fn send(&self) {
        self.handle.send(self.id, self.pulse.pulse());
    }

    /// A converted notification watches a concrete party from now on
    /// (deferred attach-extended entries become disconnect watches).
    pub fn retag(&mut self, party: PartyId) {
        self.party = party;
    }

    pub fn pulse_info(&self) -> PulseInfo {
        self.pulse
    }
}

/// An ordered collection of notifications of one kind.
#[derive(Debug, Default)]
pub struct NotificationList {
    entries: Vec<Notification>,
    total: u32,
}

impl NotificationList {
    pub fn add(&mut self, notification: Notification) {
        self.entries.push(notification);
        self.total += 1;
    }

    pub fn find(&mut self, id: NotificationId) -> Option<&mut Notification> {
        self.entries.iter_mut().find(|n| n.id == id)
    }

    pub fn remove(&mut self, id: NotificationId) -> Option<Notification> {
        let pos = self.entries.iter().position(|n| n.id == id)?;
        Some(self.entries.remove(pos))
    }

    /// Removes every entry owned by the given ids (OCB teardown).
    pub fn remove_owned(&mut self, ids: &[NotificationId]) -> Vec<Notification> {
        self.take_where(|n| ids.contains(&n.id))
    }

    /// Fires and consumes all active entries armed on this party.
    pub fn trigger_party(&mut self, party: PartyId) -> Vec<Notification> {
        self.send_and_take(|n| n.active && n.party == party)
    }

    /// Fires and consumes all active entries armed on any of the parties.
    pub fn trigger_parties(
        &mut self,
        parties: &std::collections::BTreeSet<PartyId>,
    ) -> Vec<Notification> {
        self.send_and_take(|n| n.active && parties.contains(&n.party))
    }

    /// Fires entries armed on a now-available interface.
    ///
    /// Version compatibility applies (same major, armed minor covered by
    /// the registered minor). For group-restricted interfaces, entries of
    /// uids outside the group are retained inactive instead of firing.
    pub fn trigger_interface(
        &mut self,
        available: &InterfaceDescription,
        gid: u32,
        groups: &dyn GroupAccess,
    ) -> Vec<Notification> {
        let mut fired = Vec::new();
        let mut idx = 0;
        while idx < self.entries.len() {
            let n = &mut self.entries[idx];
            let armed = match &n.iface {
                Some(iface) if iface.name == available.name => iface.clone(),
                _ => {
                    idx += 1;
                    continue;
                }
            };

            if !n.active
                || armed.version.major != available.version.major
                || armed.version.minor > available.version.minor
            {
                debug!(
                    "interface {available} available, notification -{}- armed on {armed}",
                    n.id
                );
                idx += 1;
                continue;
            }

            if gid != UNKNOWN_GROUP_ID && !check_access(groups, n.uid, gid) {
                warn!(
                    "notification on interface {} retained because of access restrictions",
                    available.name
                );
                n.active = false;
                idx += 1;
                continue;
            }

            let n = self.entries.remove(idx);
            n.send();
            fired.push(n);
        }
        fired
    }

    /// Fires one entry by id; persistent triggers keep it armed.
    pub fn trigger_id(&mut self, id: NotificationId, remove: bool) -> Option<Notification> {
        let pos = self
            .entries
            .iter()
            .position(|n| n.active && n.id == id)?;
        if remove {
            let n = self.entries.remove(pos);
            n.send();
            Some(n)
        } else {
            self.entries[pos].send();
            None
        }
    }

    /// Fires and consumes every entry folded into a pool.
    pub fn trigger_pool(&mut self, pool_id: u32) -> Vec<Notification> {
        self.send_and_take(|n| n.active && n.pool_id == pool_id)
    }

    /// Fires entries whose party lives on another broker.
    pub fn trigger_not_local(&mut self, extended_id: u32) -> Vec<Notification> {
        self.send_and_take(|n| n.active && n.party.extended != extended_id)
    }

    /// Fires entries whose party was minted by the given broker.
    pub fn trigger_local(&mut self, extended_id: u32) -> Vec<Notification> {
        self.send_and_take(|n| n.active && n.party.extended == extended_id)
    }

    /// Fires list-change notifications for one batch of registry changes.
    ///
    /// Plain entries always fire; regex entries fire when any changed name
    /// matches (and therefore not on pure removals). Entries stay armed.
    pub fn trigger_list_changed(&mut self, changed_names: &[&str]) {
        for n in &self.entries {
            if !n.active {
                continue;
            }
            if n.has_regex() {
                if changed_names.iter().any(|name| n.matches(name)) {
                    n.send();
                }
            } else {
                n.send();
            }
        }
    }

    /// Fires and consumes active entries matching an arbitrary predicate.
    pub fn send_and_take(
        &mut self,
        mut predicate: impl FnMut(&Notification) -> bool,
    ) -> Vec<Notification> {
        let taken = self.take_where(|n| predicate(n));
        for n in &taken {
            n.send();
        }
        taken
    }

    fn take_where(&mut self, mut predicate: impl FnMut(&Notification) -> bool) -> Vec<Notification> {
        let mut taken = Vec::new();
        let mut idx = 0;
        while idx < self.entries.len() {
            if predicate(&self.entries[idx]) {
                taken.push(self.entries.remove(idx));
            } else {
                idx += 1;
            }
        }
        taken
    }

    /// Forgets every master-side reference (upstream link died).
    pub fn clear_master_refs(&mut self) {
        for n in &mut self.entries {
            n.master_id = INVALID_NOTIFICATION_ID;
            n.pool_id = 0;
        }
    }

    /// Moves all members of a pool over from another list.
    pub fn adopt_pool(&mut self, source: &mut NotificationList, pool_id: u32) -> usize {
        let moved = source.take_where(|n| n.pool_id == pool_id);
        source.total = source.total.saturating_sub(moved.len() as u32);
        let count = moved.len();
        for n in moved {
            self.add(n);
        }
        count
    }

    /// Records the master-side id on every member of a pool.
    pub fn set_master_id(&mut self, pool_id: u32, master_id: NotificationId) -> usize {
        let mut count = 0;
        for n in &mut self.entries {
            if n.pool_id == pool_id {
                n.master_id = master_id;
                count += 1;
            }
        }
        count
    }

    /// Converts every member of a pool into a watch on a concrete party.
    pub fn retag_pool(&mut self, pool_id: u32, party: PartyId) -> usize {
        let mut count = 0;
        for n in &mut self.entries {
            if n.pool_id == pool_id {
                n.retag(party);
                count += 1;
            }
        }
        count
    }

    pub fn count_party(&self, party: PartyId) -> usize {
        self.entries.iter().filter(|n| n.party == party).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Notification> {
        self.entries.iter_mut()
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
