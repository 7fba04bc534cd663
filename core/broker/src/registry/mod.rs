//! Registry tables owned by the broker event loop.
//!
//! None of these structures is shared across tasks; the dispatcher holds
//! them mutably and every mutation happens on the loop.

mod cache;
mod clients;
mod ocb;
mod servers;

pub use cache::RemoteServerCache;
pub use clients::{ClientEntry, ClientTable};
pub use ocb::{ConnContext, Ocb};
pub use servers::{ServerEntry, ServerTable, Upstream};
