//! The switchboard daemon: a service registry and notification broker for a
//! distributed service-invocation middleware.
//!
//! Applications register named, versioned service interfaces; other
//! applications discover and attach to them; the broker coordinates
//! interface lifecycle, access control and asynchronous pulse delivery
//! across a federation of brokers arranged in a tree.
//!
//! The core is a single event-loop task owning all registry state (see
//! [`broker::Broker`]); socket front-ends and the master-adapter worker
//! communicate with it exclusively through the event channel.

pub mod access;
pub mod broker;
pub mod config;
pub mod event;
pub mod federation;
pub mod http;
pub mod lock;
pub mod logging;
pub mod master;
pub mod notify;
pub mod pulse;
pub mod registry;
pub mod server;

/// Identifies one accepted connection for the lifetime of the process.
pub type ConnId = u64;

/// Default TCP port a master listens on for slave brokers.
pub const MASTER_PORT: u16 = 3746;
/// Default TCP port a slave listens on for pulses from its master.
pub const SLAVE_PORT: u16 = 3747;
/// Default port of the HTTP status page.
pub const HTTP_PORT: u16 = 3744;

/// Root directory for the unix socket, lock file and HTTP port file.
pub const DEFAULT_ROOT: &str = "/var/run/servicebroker/";
/// Default mountpoint below the root.
pub const DEFAULT_MOUNTPOINT: &str = "/servicebroker";

/// Resolves a default port against its environment override
/// (`SB_MASTER_PORT`, `SB_SLAVE_PORT`, `SB_HTTP_PORT`).
pub fn real_port(default: u16) -> u16 {
    let var = match default {
        MASTER_PORT => "SB_MASTER_PORT",
        SLAVE_PORT => "SB_SLAVE_PORT",
        HTTP_PORT => "SB_HTTP_PORT",
        _ => return default,
    };
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
