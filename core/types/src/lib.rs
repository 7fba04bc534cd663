//! Shared wire-level and domain types for the switchboard service registry.
//!
//! Everything a peer needs to speak the broker protocol lives here: party
//! identities, interface descriptions with their compatibility rules, the
//! command set, result codes, pulses and the framed request/response codec.
//! The daemon and its integration tests are both built on this crate.

mod command;
mod frames;
mod interface;
mod party;
mod pulse;
mod status;
pub mod wire;

pub use command::Command;
pub use frames::{
    AuthPreamble, RequestHeader, ResponseHeader, AUTH_MAGIC, AUTH_PREAMBLE_LEN, FRAME_MAGIC,
    REQUEST_HEADER_LEN, RESPONSE_HEADER_LEN,
};
pub use interface::{ImplVersion, InterfaceDescription, InterfaceVersion, MAX_NAME_LEN};
pub use party::PartyId;
pub use pulse::{Pulse, PulseInfo, PULSE_LEN};
pub use status::Status;
pub use wire::WireError;

/// Protocol version sent in the first four bytes of every request body.
pub const PROTOCOL_MAJOR: u16 = 4;
/// See [`PROTOCOL_MAJOR`].
pub const PROTOCOL_MINOR: u16 = 0;

/// Node address denoting the local machine (unix-socket peers).
pub const LOCAL_NODE_ADDRESS: u32 = 0;
/// The IPv4 loopback address, relevant for the `_tcp` pid rewrite rule.
pub const LOCAL_IP_ADDRESS: u32 = 0x7f00_0001;
/// Marker for an unknown uid (TCP peers carry no credentials).
pub const UNKNOWN_USER_ID: u32 = u32::MAX;
/// Marker for an unrestricted interface.
pub const UNKNOWN_GROUP_ID: u32 = u32::MAX;
/// Marker for an unknown peer IP in pulse targets.
pub const UNKNOWN_IP_ADDRESS: i32 = -1;

/// Extended id taken by a classic (non tree mode) slave broker.
pub const CLASSIC_SLAVE_EXTENDED_ID: u32 = 1000;

/// Identifier of an armed notification.
pub type NotificationId = u32;
/// Sentinel for "no notification".
pub const INVALID_NOTIFICATION_ID: NotificationId = u32::MAX;

/// Returns whether the protocol version declared by a peer is compatible
/// with ours: equal major, minor not newer than what we implement.
pub fn protocol_compatible(version: InterfaceVersion) -> bool {
    version.major == PROTOCOL_MAJOR && version.minor <= PROTOCOL_MINOR
}
