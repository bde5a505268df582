//! Provider registry
//!
//! Maps a service provider tag to the factory that builds its sessions. The
//! registry is filled by explicit [`ProviderRegistry::register`] calls at
//! startup and handed to whatever resolves connection requests.

use std::collections::HashMap;
use std::sync::Arc;

use relayplay_core::{CompoundAddress, EngineConfig, Identity, Pid};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::Received;
use crate::error::{Error, Result};
use crate::flags::{OpenFlags, PlayerFlags, ReceiveFlags, SendOptions};
use crate::provider::{EnumSessionsCallback, PlayProvider, RelayBackends, RelayProvider, SessionDesc};

/// Tag of the relayed provider
pub const RELAY_PROVIDER: Uuid = Uuid::from_u128(0xf7ef59fb_fa02_45ce_bc36_7bf1d0f6bce5);

pub trait ProviderFactory: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self) -> Box<dyn PlayProvider>;

    /// Whether an address string is one this provider can connect to
    fn is_service_address(&self, _address: &str) -> bool {
        false
    }
}

/// Builds [`RelayProvider`]s over a fixed set of backends
pub struct RelayProviderFactory {
    backends: RelayBackends,
    config: EngineConfig,
}

impl RelayProviderFactory {
    pub fn new(backends: RelayBackends, config: EngineConfig) -> Self {
        Self { backends, config }
    }
}

impl ProviderFactory for RelayProviderFactory {
    fn name(&self) -> &str {
        "Relay Connection"
    }

    fn create(&self) -> Box<dyn PlayProvider> {
        Box::new(RelayProvider::new(self.backends.clone(), self.config.clone()))
    }

    fn is_service_address(&self, address: &str) -> bool {
        let id = Identity::parse_lossy(address);
        id.is_lobby() || id.is_game_server()
    }
}

#[derive(Default)]
pub struct ProviderRegistry {
    factories: HashMap<Uuid, Box<dyn ProviderFactory>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. The first registration of a tag wins.
    pub fn register(&mut self, tag: Uuid, factory: Box<dyn ProviderFactory>) -> bool {
        if self.factories.contains_key(&tag) {
            warn!(tag = %tag, "Provider already registered");
            return false;
        }
        info!(tag = %tag, name = factory.name(), "Registered provider");
        self.factories.insert(tag, factory);
        true
    }

    pub fn find(&self, tag: Uuid) -> Option<&dyn ProviderFactory> {
        self.factories.get(&tag).map(|f| f.as_ref())
    }

    /// Pick the factory for a connection request: an explicitly selected
    /// registered provider first, then any provider that recognizes the
    /// address string.
    pub fn resolve(&self, address: &CompoundAddress<'_>) -> Option<&dyn ProviderFactory> {
        if let Some(factory) = address.service_provider().and_then(|tag| self.find(tag)) {
            return Some(factory);
        }

        let inet = address.inet_address()?;
        let mut candidates: Vec<(&Uuid, &Box<dyn ProviderFactory>)> = self.factories.iter().collect();
        candidates.sort_by_key(|(tag, _)| **tag);
        candidates
            .into_iter()
            .map(|(_, f)| f.as_ref())
            .find(|f| f.is_service_address(inet))
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

/// Entry point for one legacy session object.
///
/// Holds no provider until [`ProviderSession::initialize_connection`]
/// succeeds; every other call fails with [`Error::Uninitialized`] until then.
pub struct ProviderSession {
    registry: Arc<ProviderRegistry>,
    provider: Option<Box<dyn PlayProvider>>,
}

impl ProviderSession {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            provider: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.provider.is_some()
    }

    fn provider(&mut self) -> Result<&mut (dyn PlayProvider + 'static)> {
        self.provider.as_deref_mut().ok_or(Error::Uninitialized)
    }

    pub async fn initialize_connection(&mut self, address: &[u8]) -> Result<()> {
        if self.provider.is_some() {
            info!("Session is already initialized");
            return Err(Error::AlreadyInitialized);
        }

        let decoded = CompoundAddress::decode(address);
        decoded.log();
        let factory = self
            .registry
            .resolve(&decoded)
            .ok_or(Error::NoServiceProvider)?;
        debug!(provider = factory.name(), "Using provider");

        let mut provider = factory.create();
        provider.initialize_connection(address).await?;
        self.provider = Some(provider);
        Ok(())
    }

    pub async fn open(&mut self, desc: &mut SessionDesc, flags: OpenFlags) -> Result<()> {
        self.provider()?.open(desc, flags).await
    }

    pub async fn create_player(
        &mut self,
        short_name: &str,
        long_name: &str,
        flags: PlayerFlags,
        data: &[u8],
    ) -> Result<Pid> {
        self.provider()?
            .create_player(short_name, long_name, flags, data)
            .await
    }

    pub fn destroy_player(&mut self, pid: Pid) -> Result<()> {
        self.provider()?.destroy_player(pid)
    }

    pub fn send(&mut self, from: Pid, to: Pid, flags: SendOptions, data: &[u8]) -> Result<()> {
        self.provider()?.send(from, to, flags, data)
    }

    pub fn receive(&mut self, from: Pid, to: Pid, flags: ReceiveFlags, buf: &mut [u8]) -> Result<Received> {
        self.provider()?.receive(from, to, flags, buf)
    }

    pub async fn enum_sessions(
        &mut self,
        filter: &SessionDesc,
        timeout: std::time::Duration,
        callback: &mut EnumSessionsCallback<'_>,
    ) -> Result<()> {
        self.provider()?.enum_sessions(filter, timeout, callback).await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.provider()?.close().await
    }
}
