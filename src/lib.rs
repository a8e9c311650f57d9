//! Connection-lifecycle engine for asynchronous network servers.
//!
//! hawser supervises the life of every inbound connection: an accept
//! loop spawns one isolated task per connection, a shared
//! [`deadline::DeadlineRegistry`] reclaims idle connections without
//! per-connection timers, and shutdown cancels the whole tree top-down
//! and waits until the last socket is closed.
//!
//! The timeout mechanism is deliberately weak: deadlines are only
//! checked when the registry is touched (a new connection, an explicit
//! sweep, a stop), never by a watchdog thread. A connection is never
//! reclaimed before its deadline, but may be reclaimed late. That is the right
//! trade-off for idle-connection cleanup, where staleness is harmless
//! and per-connection timers are not.

pub mod config;
pub mod deadline;
pub mod error;
pub mod server;
pub mod utils;

pub mod prelude {
    pub use crate::config::ServerConfig;
    pub use crate::deadline::{DeadlineRegistry, Registration};
    pub use crate::error::{Cancelled, RegistryStopped, ServerError};
    pub use crate::server::{
        start_server, serve, Bind, ConnId, Handler, Listener, ServerConnection, ServerHandle,
        TcpBinder,
    };
    pub use crate::utils::{CancelToken, HealthFlag};
}
