use std::sync::{Arc, atomic::AtomicUsize};

mod addressing;
pub mod config;
mod entrypoint;
mod error;
mod http;
mod routing;
mod sessions;
mod ssh;
mod tunnel;
mod users;

pub use config::ApplicationConfig;
pub use entrypoint::entrypoint;

use crate::{
    routing::RoutingTable, sessions::SessionRegistry, tunnel::Tunnel, users::UserStore,
};

// Shared state for the whole gateway: the two process-wide tables plus
// everything each SSH connection needs a reference to.
pub(crate) struct GatewayServer {
    // Counter handing out session ids to new connections.
    pub(crate) session_id: AtomicUsize,
    // Domain-to-tunnel routing table consulted by the HTTP front door.
    pub(crate) routing: Arc<RoutingTable<Arc<Tunnel>>>,
    // Per-session bookkeeping, keyed by session id.
    pub(crate) sessions: SessionRegistry<Arc<Tunnel>>,
    // Authorized users; None disables authentication entirely.
    pub(crate) users: Option<UserStore>,
}
