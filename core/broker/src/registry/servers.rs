use std::collections::BTreeMap;

use switchboard_types::{
    ImplVersion, InterfaceDescription, PartyId, UNKNOWN_GROUP_ID,
};

/// Forwarding state of a server entry towards the upstream master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Upstream {
    /// Not forwarded (or forwarding cleared after a master loss).
    #[default]
    None,
    /// A registration batch naming this entry is in flight.
    Pending,
    /// The master has acknowledged the entry under this id.
    Registered(PartyId),
}

/// One registered server interface.
#[derive(Debug, Clone)]
pub struct ServerEntry {
    pub party_id: PartyId,
    pub upstream: Upstream,
    /// Node the server lives on; 0 for this broker's own node.
    pub nid: u32,
    /// Process id, or an IPv4 address for `_tcp` interfaces.
    pub pid: i32,
    pub chid: i32,
    pub iface: InterfaceDescription,
    pub impl_version: ImplVersion,
    /// Group restriction; `UNKNOWN_GROUP_ID` admits everyone.
    pub gid: u32,
    /// Local services never leak upstream and stay hidden from slaves.
    pub local: bool,
}

impl ServerEntry {
    pub fn is_restricted(&self) -> bool {
        self.gid != UNKNOWN_GROUP_ID
    }
}

/// The server table: unique per interface name, iterated in name order.
#[derive(Debug, Default)]
pub struct ServerTable {
    entries: BTreeMap<String, ServerEntry>,
    total: u32,
}

impl ServerTable {
    pub fn contains_name(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Inserts a new entry; the caller must have checked name uniqueness.
    pub fn add(&mut self, entry: ServerEntry) {
        debug_assert!(!self.entries.contains_key(&entry.iface.name));
        self.entries.insert(entry.iface.name.clone(), entry);
        self.total += 1;
    }

    pub fn find_name(&self, name: &str) -> Option<&ServerEntry> {
        self.entries.get(name)
    }

    /// Exact resolution for attach: name hit plus version compatibility.
    pub fn find_compatible(&self, requested: &InterfaceDescription) -> Option<&ServerEntry> {
        self.entries
            .get(&requested.name)
            .filter(|e| e.iface.satisfies(requested))
    }

    pub fn find_party(&self, party: PartyId) -> Option<&ServerEntry> {
        self.entries.values().find(|e| e.party_id == party)
    }

    pub fn find_party_mut(&mut self, party: PartyId) -> Option<&mut ServerEntry> {
        self.entries.values_mut().find(|e| e.party_id == party)
    }

    /// Correlates a master registration reply: the master echoes our local
    /// id, and only entries still waiting for their reply qualify.
    pub fn find_pending_by_local(&mut self, local_id: u32) -> Option<&mut ServerEntry> {
        self.entries
            .values_mut()
            .find(|e| e.party_id.local == local_id && e.upstream == Upstream::Pending)
    }

    pub fn remove(&mut self, party: PartyId) -> Option<ServerEntry> {
        let name = self
            .entries
            .values()
            .find(|e| e.party_id == party)?
            .iface
            .name
            .clone();
        self.entries.remove(&name)
    }

    /// Forgets all master ids, e.g. after the upstream link died.
    pub fn clear_upstream(&mut self) {
        for entry in self.entries.values_mut() {
            entry.upstream = Upstream::None;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerEntry> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ServerEntry> {
        self.entries.values_mut()
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
