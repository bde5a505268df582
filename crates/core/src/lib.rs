//! RelayPlay Core Library
//!
//! Identifier, address and configuration primitives shared by the session
//! engine.

pub mod address;
pub mod config;
pub mod error;
pub mod identity;
pub mod pid;

pub use address::{AddressBuilder, AddressElement, CompoundAddress};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use identity::{Identity, IdentityKind};
pub use pid::{Pid, PidAllocator};
