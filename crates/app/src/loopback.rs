//! Loopback session
//!
//! Hosts a session and joins it from a second user, both over the
//! in-process backends, then exchanges one message between them.

use std::sync::Arc;
use std::time::Duration;

use relayplay_core::{AddressBuilder, EngineConfig, Identity, Pid};
use relayplay_net::auth::MemoryIdentityService;
use relayplay_net::directory::MemoryDirectory;
use relayplay_net::flags::{OpenFlags, PlayerFlags, ReceiveFlags, SendOptions};
use relayplay_net::memory::MemoryNetwork;
use relayplay_net::{
    Error, ProviderRegistry, ProviderSession, RelayBackends, RelayProviderFactory, Result, SessionDesc,
    SystemMessage, RELAY_PROVIDER,
};
use tracing::{debug, info};

const HOST: u64 = 1;
const GUEST: u64 = 2;

struct Backends {
    network: MemoryNetwork,
    service: MemoryIdentityService,
    directory: MemoryDirectory,
}

impl Backends {
    /// A session object as one user's process would hold it
    fn session(&self, account: u64, config: &EngineConfig) -> ProviderSession {
        let backends = RelayBackends::in_memory(
            &self.network,
            &self.service,
            &self.directory,
            Identity::individual(account),
            Identity::game_server(account),
        );
        let mut registry = ProviderRegistry::new();
        registry.register(
            RELAY_PROVIDER,
            Box::new(RelayProviderFactory::new(backends, config.clone())),
        );
        ProviderSession::new(Arc::new(registry))
    }
}

pub async fn run(config: EngineConfig) -> Result<()> {
    let backends = Backends {
        network: MemoryNetwork::new(),
        service: MemoryIdentityService::new(),
        directory: MemoryDirectory::new(),
    };
    backends
        .directory
        .add_friends(Identity::individual(HOST), Identity::individual(GUEST));

    let address = AddressBuilder::new().service_provider(RELAY_PROVIDER).build();

    let mut host = backends.session(HOST, &config);
    host.initialize_connection(&address).await?;
    let mut desc = SessionDesc {
        name: "Loopback".into(),
        max_players: 2,
        ..Default::default()
    };
    host.open(&mut desc, OpenFlags::CREATE).await?;
    let host_pid = host
        .create_player("Host", "Loopback Host", PlayerFlags::empty(), &[])
        .await?;
    info!(pid = %host_pid, "Host player created");

    let mut guest = backends.session(GUEST, &config);
    guest.initialize_connection(&address).await?;
    let mut found = Vec::new();
    guest
        .enum_sessions(&SessionDesc::default(), Duration::ZERO, &mut |d: &SessionDesc| {
            found.push(d.clone());
            true
        })
        .await?;
    let mut session = found
        .into_iter()
        .next()
        .ok_or_else(|| Error::Generic("no session found".into()))?;
    info!(name = %session.name, players = session.current_players, "Found session");

    guest.open(&mut session, OpenFlags::JOIN).await?;
    let guest_pid = guest
        .create_player("Guest", "Loopback Guest", PlayerFlags::empty(), &[])
        .await?;
    info!(pid = %guest_pid, "Guest player created");

    guest.send(
        guest_pid,
        Pid::ALL_PLAYERS,
        SendOptions::GUARANTEED | SendOptions::NO_SEND_COMPLETE_MSG,
        b"hello from the guest",
    )?;

    let deadline = tokio::time::Instant::now() + config.connect_timeout();
    let mut buf = vec![0u8; 1024];
    loop {
        match host.receive(Pid::UNKNOWN, Pid::UNKNOWN, ReceiveFlags::ALL, &mut buf) {
            Ok(got) if got.from == Pid::SYSTEM_MESSAGE => {
                debug!(message = ?SystemMessage::parse(&buf[..got.len]), "System message");
            }
            Ok(got) => {
                info!(
                    from = %got.from,
                    to = %got.to,
                    text = %String::from_utf8_lossy(&buf[..got.len]),
                    "Host received"
                );
                break;
            }
            Err(Error::NoMessages) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(config.poll_interval()).await;
            }
            Err(e) => return Err(e),
        }
    }

    guest.close().await?;
    host.close().await?;
    info!("Loopback session finished");
    Ok(())
}
