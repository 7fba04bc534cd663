use std::collections::BTreeSet;

use switchboard_types::{NotificationId, PartyId, LOCAL_NODE_ADDRESS};

use crate::ConnId;

/// Immutable facts about one accepted connection, established during the
/// AUTH preamble.
#[derive(Debug, Clone, Copy)]
pub struct ConnContext {
    pub id: ConnId,
    /// Declared (TCP) or kernel-attested (unix) process id of the peer.
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
    /// Peer node address in host order; 0 for unix-socket peers.
    pub node: u32,
    /// Our own address on the carrying socket, for the `_tcp` rewrite.
    pub local_addr: u32,
}

impl ConnContext {
    pub fn is_local(&self) -> bool {
        self.node == LOCAL_NODE_ADDRESS
    }
}

/// Per-connection bookkeeping: everything that must be unwound when the
/// connection goes away.
#[derive(Debug)]
pub struct Ocb {
    pub ctx: ConnContext,
    /// Marked once the peer identified itself as another broker.
    pub slave: bool,
    /// Extended id a slave announced in its id-ping; 0 otherwise.
    pub extended_id: u32,
    pub servers: BTreeSet<PartyId>,
    pub clients: BTreeSet<PartyId>,
    pub notifications: Vec<NotificationId>,
}

impl Ocb {
    pub fn new(ctx: ConnContext) -> Self {
        Self {
            ctx,
            slave: false,
            extended_id: 0,
            servers: BTreeSet::new(),
            clients: BTreeSet::new(),
            notifications: Vec::new(),
        }
    }

    pub fn add_notification(&mut self, id: NotificationId) {
        self.notifications.push(id);
    }

    pub fn remove_notification(&mut self, id: NotificationId) {
        self.notifications.retain(|&n| n != id);
    }

    pub fn has_notification(&self, id: NotificationId) -> bool {
        self.notifications.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ConnContext {
        ConnContext {
            id: 1,
            pid: 4711,
            uid: 1000,
            gid: 1000,
            node: LOCAL_NODE_ADDRESS,
            local_addr: 0,
        }
    }

    #[test]
    fn notification_bookkeeping() {
        let mut ocb = Ocb::new(ctx());
        ocb.add_notification(7);
        ocb.add_notification(8);
        assert!(ocb.has_notification(7));
        ocb.remove_notification(7);
        assert!(!ocb.has_notification(7));
        assert!(ocb.has_notification(8));
    }
}
