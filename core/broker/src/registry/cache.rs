use std::collections::HashMap;

use switchboard_types::wire::ServerInfo;
use switchboard_types::{InterfaceDescription, PartyId};

/// Remote-server cache (tree mode only): short-circuits upstream lookups
/// by exact interface description.
#[derive(Debug, Default)]
pub struct RemoteServerCache {
    entries: HashMap<InterfaceDescription, ServerInfo>,
}

impl RemoteServerCache {
    pub fn get(&self, iface: &InterfaceDescription) -> Option<&ServerInfo> {
        self.entries.get(iface)
    }

    pub fn insert(&mut self, iface: InterfaceDescription, info: ServerInfo) {
        self.entries.insert(iface, info);
    }

    /// Drops the entry belonging to a disconnected server, if any.
    pub fn remove_server(&mut self, server_id: PartyId) -> Option<InterfaceDescription> {
        let key = self
            .entries
            .iter()
            .find(|(_, info)| info.server_id == server_id)
            .map(|(iface, _)| iface.clone())?;
        self.entries.remove(&key);
        Some(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
