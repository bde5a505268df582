//! RelayPlay Network Library
//!
//! Session engine for a legacy identity-addressed multiplayer API running
//! over a relayed peer-to-peer transport.
//!
//! # Architecture
//!
//! - **Server**: run by the host, owns the authoritative player directory and
//!   relays every message
//! - **Client**: one connection to a server, mirrors the directory and queues
//!   inbound data and system messages
//! - **Lobby**: resolves which server to connect to through a rendezvous
//!   directory
//! - **Provider**: the legacy API surface, one call per legacy operation
//!
//! # Usage
//!
//! ```ignore
//! let mut registry = ProviderRegistry::new();
//! registry.register(RELAY_PROVIDER, Box::new(RelayProviderFactory::new(backends, config)));
//!
//! let mut session = ProviderSession::new(Arc::new(registry));
//! session.initialize_connection(&address).await?;
//! session.open(&mut desc, OpenFlags::CREATE).await?;
//! let pid = session.create_player("P1", "Player One", PlayerFlags::empty(), &[]).await?;
//! ```

pub mod auth;
pub mod client;
pub mod directory;
pub mod error;
pub mod flags;
mod frame;
pub mod lobby;
pub mod memory;
pub mod prompt;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod server;
pub mod sessions;
pub mod system;
pub mod transport;

pub use client::{Client, ClientState, ReceiveFilter, Received};
pub use error::{Error, Result};
pub use protocol::Message;
pub use provider::{PlayProvider, RelayBackends, RelayProvider, SessionDesc};
pub use registry::{ProviderRegistry, ProviderSession, RelayProviderFactory, RELAY_PROVIDER};
pub use server::{Server, ServerSettings, ServerState};
pub use system::SystemMessage;
pub use transport::{DisconnectReason, SendFlags, Transport};
