//! Session provider facade
//!
//! [`PlayProvider`] is the surface the legacy API shim calls into, one
//! method per legacy operation. [`RelayProvider`] implements it on top of
//! the client, server, lobby and session listing components.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relayplay_core::{CompoundAddress, EngineConfig, Identity, Pid};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{IdentityBackend, LocalUser, MemoryIdentityService};
use crate::client::{Client, ClientState, CreatePlayerRequest, ReceiveFilter, Received};
use crate::directory::{MemoryDirectory, RendezvousDirectory};
use crate::error::{Error, Result};
use crate::flags::{OpenFlags, PlayerFlags, ReceiveFlags, SendOptions, SessionFlags};
use crate::lobby::{Lobby, LobbyState};
use crate::memory::MemoryNetwork;
use crate::prompt::{Headless, Prompt};
use crate::server::{Server, ServerSettings, ServerState};
use crate::sessions::{SessionEntry, SessionListRequest};
use crate::transport::{DisconnectReason, SendFlags, Transport};

/// Marker put in front of sessions found through a friend
const FRIEND_MARKER: &str = "[Friend]";

/// Legacy session descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDesc {
    pub flags: SessionFlags,
    /// Encodes the identity to join, see [`Identity::to_instance`]
    pub instance: Uuid,
    pub application: Uuid,
    pub max_players: u32,
    pub current_players: u32,
    pub name: String,
    pub password: String,
}

/// Callback of [`PlayProvider::enum_sessions`]; return `false` to stop
pub type EnumSessionsCallback<'a> = dyn FnMut(&SessionDesc) -> bool + Send + 'a;

/// One legacy session object
#[async_trait]
pub trait PlayProvider: Send {
    /// Set up from a compound address. Joins right away if the address
    /// names a session.
    async fn initialize_connection(&mut self, address: &[u8]) -> Result<()>;

    async fn open(&mut self, desc: &mut SessionDesc, flags: OpenFlags) -> Result<()>;

    async fn create_player(
        &mut self,
        short_name: &str,
        long_name: &str,
        flags: PlayerFlags,
        data: &[u8],
    ) -> Result<Pid>;

    fn destroy_player(&mut self, pid: Pid) -> Result<()>;

    fn send(&mut self, from: Pid, to: Pid, flags: SendOptions, data: &[u8]) -> Result<()>;

    /// Priority and timeout are accepted and ignored
    fn send_ex(
        &mut self,
        from: Pid,
        to: Pid,
        flags: SendOptions,
        data: &[u8],
        _priority: u32,
        _timeout: Duration,
    ) -> Result<()> {
        self.send(from, to, flags, data)
    }

    /// `from`/`to` are only compared when the matching flag is set
    fn receive(&mut self, from: Pid, to: Pid, flags: ReceiveFlags, buf: &mut [u8]) -> Result<Received>;

    /// Report every discovered session. A zero timeout uses the configured default.
    async fn enum_sessions(
        &mut self,
        filter: &SessionDesc,
        timeout: Duration,
        callback: &mut EnumSessionsCallback<'_>,
    ) -> Result<()>;

    fn set_session_desc(&mut self, _desc: &SessionDesc) -> Result<()> {
        Ok(())
    }

    fn cancel_message(&mut self, _message_id: u32) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()>;
}

/// Backends a [`RelayProvider`] runs on.
///
/// `user_transport` must be reachable under `user.identity()`; the server
/// endpoint gets its own transport and identity account.
#[derive(Clone)]
pub struct RelayBackends {
    pub user_transport: Arc<dyn Transport>,
    pub server_transport: Arc<dyn Transport>,
    pub user: Arc<dyn LocalUser>,
    pub server_account: Arc<dyn IdentityBackend>,
    pub directory: Arc<dyn RendezvousDirectory>,
    pub prompt: Arc<dyn Prompt>,
}

impl RelayBackends {
    /// Wire one user and its hosting account to in-process backends
    pub fn in_memory(
        network: &MemoryNetwork,
        service: &MemoryIdentityService,
        directory: &MemoryDirectory,
        user: Identity,
        server: Identity,
    ) -> Self {
        Self {
            user_transport: Arc::new(network.endpoint(user)),
            server_transport: Arc::new(network.endpoint(server)),
            user: Arc::new(service.user(user)),
            server_account: Arc::new(service.server(server)),
            directory: Arc::new(directory.member(user)),
            prompt: Arc::new(Headless),
        }
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn Prompt>) -> Self {
        self.prompt = prompt;
        self
    }
}

pub struct RelayProvider {
    config: EngineConfig,
    directory: Arc<dyn RendezvousDirectory>,
    prompt: Arc<dyn Prompt>,
    client: Client,
    server: Server,
    lobby: Lobby,
    sessions: SessionListRequest,
    cancel: CancellationToken,
}

impl RelayProvider {
    pub fn new(backends: RelayBackends, config: EngineConfig) -> Self {
        let client = Client::new(
            backends.user_transport,
            Arc::clone(&backends.user),
            Arc::clone(&backends.prompt),
            &config,
        );
        let server = Server::new(backends.server_transport, backends.server_account, config.clone());
        let lobby = Lobby::new(Arc::clone(&backends.directory), backends.user);
        let sessions = SessionListRequest::new(Arc::clone(&backends.directory));

        Self {
            config,
            directory: backends.directory,
            prompt: backends.prompt,
            client,
            server,
            lobby,
            sessions,
            cancel: CancellationToken::new(),
        }
    }

    /// Token of the current operation. Cancelling it makes the pending
    /// wait, or the next one if nothing is waiting, fail with
    /// [`Error::Cancelled`]. The token is spent once that operation
    /// returns; later operations run under a fresh one, so fetch it again
    /// for each operation to cancel.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Close out an operation, replacing a spent cancellation token
    fn finish<T>(&mut self, outcome: Result<T>) -> Result<T> {
        if self.cancel.is_cancelled() {
            debug!("Renewing cancellation token");
            self.cancel = CancellationToken::new();
        }
        outcome
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn lobby(&self) -> &Lobby {
        &self.lobby
    }

    /// Deliver directory events and drain the client connection
    fn pump(&mut self) {
        for event in self.directory.poll_events() {
            self.lobby.handle_event(&event);
            self.sessions.handle_event(&event);
        }
        self.client.pump();
    }

    /// Pump until `poll` reports an outcome, the deadline passes or the
    /// provider is cancelled
    async fn wait_for<T, F>(&mut self, deadline: Instant, mut poll: F) -> Result<T>
    where
        T: Send,
        F: FnMut(&mut Self) -> Option<Result<T>> + Send,
    {
        let cancel = self.cancel.clone();
        let interval = self.config.poll_interval();
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.pump();
            if let Some(outcome) = poll(self) {
                return outcome;
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.connect_timeout()
    }

    async fn join_server(&mut self, server: Identity, password: Option<&str>) -> Result<()> {
        self.client.join(server, password)?;

        let deadline = self.deadline();
        let outcome = self
            .wait_for(deadline, |p| match p.client.state() {
                ClientState::Connected => Some(Ok(())),
                ClientState::Disconnected => Some(Err(Error::Generic("connection to server failed".into()))),
                _ if p.client.is_lost() => Some(Err(Error::Generic("server closed the connection".into()))),
                _ => None,
            })
            .await;

        if let Err(e) = &outcome {
            warn!(server = %server, error = %e, "Failed to join server");
            self.client.disconnect(DisconnectReason::ClientDisconnect);
        }
        outcome
    }

    async fn join_lobby(&mut self, entry: Identity, password: Option<&str>) -> Result<()> {
        if self.lobby.state() != LobbyState::None {
            debug!("Previous lobby session was not closed");
            self.lobby.leave();
        }
        self.lobby.join(entry)?;

        let deadline = self.deadline();
        let resolved = self
            .wait_for(deadline, |p| match p.lobby.state() {
                LobbyState::InLobby => p.lobby.game_server().map(Ok),
                LobbyState::None => Some(Err(Error::Generic("failed to join lobby".into()))),
                _ => None,
            })
            .await;

        let server = match resolved {
            Ok(server) => server,
            Err(e) => {
                self.lobby.leave();
                return Err(e);
            }
        };

        if let Err(e) = self.join_server(server, password).await {
            self.lobby.leave();
            return Err(e);
        }
        Ok(())
    }

    async fn join(&mut self, desc: &SessionDesc) -> Result<()> {
        let target = Identity::from_instance(desc.instance);
        let password = Some(desc.password.as_str()).filter(|p| !p.is_empty());

        if target.is_lobby() {
            self.join_lobby(target, password).await
        } else if target.is_game_server() {
            self.join_server(target, password).await
        } else {
            Err(Error::InvalidParam("session instance"))
        }
    }

    async fn create(&mut self, desc: &mut SessionDesc) -> Result<()> {
        if self.server.state() != ServerState::Disconnected || self.lobby.state() != LobbyState::None {
            debug!("Previous server session was not closed");
            self.stop_hosting().await;
        }

        let mut settings = ServerSettings {
            name: desc.name.clone(),
            password: if desc.flags.contains(SessionFlags::PASSWORD_REQUIRED) {
                desc.password.clone()
            } else {
                String::new()
            },
            ..Default::default()
        };
        if desc.max_players > 0 {
            settings.max_players = desc.max_players;
        }
        if !self.prompt.confirm_server_settings(&mut settings) {
            return Err(Error::Cancelled);
        }
        let settings = settings.normalized();

        self.server.start(settings.clone()).await?;
        if let Err(e) = self.lobby.create(&settings) {
            self.stop_hosting().await;
            return Err(e);
        }

        let deadline = self.deadline();
        let ready = self
            .wait_for(deadline, |p| {
                match (p.server.state(), p.lobby.state()) {
                    (ServerState::Connecting, _) | (_, LobbyState::Creating) => None,
                    (ServerState::Connected, LobbyState::InLobby) => Some(Ok(())),
                    _ => Some(Err(Error::Generic("failed to host session".into()))),
                }
            })
            .await;
        if let Err(e) = ready {
            self.stop_hosting().await;
            return Err(e);
        }

        let server = self.server.identity();
        let password = Some(settings.password.as_str()).filter(|p| !p.is_empty());
        if let Err(e) = self.join_server(server, password).await {
            self.stop_hosting().await;
            return Err(e);
        }

        self.lobby.set_game_server(server);
        desc.instance = server.to_instance();
        desc.name = settings.name;
        desc.max_players = settings.max_players;
        info!(server = %server, "Hosting session");
        Ok(())
    }

    async fn stop_hosting(&mut self) {
        self.lobby.leave();
        self.server.close().await;
    }

    async fn connect_to_address(&mut self, address: &[u8]) -> Result<()> {
        let address = CompoundAddress::decode(address);
        let Some(inet) = address.inet_address() else {
            return Ok(());
        };

        let target = Identity::parse_lossy(inet);
        if target.is_lobby() {
            self.join_lobby(target, None).await
        } else if target.is_game_server() {
            self.join_server(target, None).await
        } else {
            warn!(address = %inet, "Address does not name a session");
            Err(Error::Generic(format!("not a session address: {inet}")))
        }
    }

    async fn open_session(&mut self, desc: &mut SessionDesc, flags: OpenFlags) -> Result<()> {
        if flags.contains(OpenFlags::RETURN_STATUS) {
            return Err(Error::Unsupported("open with status return"));
        }
        if flags.contains(OpenFlags::CREATE) {
            self.create(desc).await
        } else if flags.contains(OpenFlags::JOIN) {
            self.join(desc).await
        } else {
            Err(Error::InvalidParam("open flags"))
        }
    }

    async fn request_player(
        &mut self,
        short_name: &str,
        long_name: &str,
        flags: PlayerFlags,
        data: &[u8],
    ) -> Result<Pid> {
        if !self.client.is_connected() {
            return Err(Error::NotConnected);
        }

        let (tx, mut rx) = oneshot::channel();
        let request = CreatePlayerRequest {
            short_name,
            long_name,
            server_player: flags.contains(PlayerFlags::SERVER_PLAYER),
            spectator: flags.contains(PlayerFlags::SPECTATOR),
            data,
        };
        self.client.create_player(
            &request,
            Box::new(move |pid| {
                let _ = tx.send(pid);
            }),
        )?;

        let deadline = self.deadline();
        let pid = self
            .wait_for(deadline, |_| match rx.try_recv() {
                Ok(pid) => Some(Ok(pid)),
                Err(oneshot::error::TryRecvError::Empty) => None,
                Err(oneshot::error::TryRecvError::Closed) => {
                    Some(Err(Error::Generic("create player request was superseded".into())))
                }
            })
            .await?;

        if pid.is_unknown() {
            return Err(Error::Generic("server refused to create player".into()));
        }
        Ok(pid)
    }

    /// Refresh the session list, cancelling the request if the wait fails
    async fn list_sessions(&mut self, timeout: Duration) -> Result<()> {
        let timeout = if timeout.is_zero() {
            self.config.connect_timeout()
        } else {
            timeout
        };

        self.sessions.request();
        let listed = self
            .wait_for(Instant::now() + timeout, |p| (!p.sessions.is_requesting()).then_some(Ok(())))
            .await;
        if listed.is_err() {
            self.sessions.cancel();
        }
        listed
    }
}

fn session_name(entry: &SessionEntry) -> String {
    let name = entry.name.replace(FRIEND_MARKER, "");
    if entry.friend {
        format!("{FRIEND_MARKER} {name}")
    } else {
        name
    }
}

#[async_trait]
impl PlayProvider for RelayProvider {
    async fn initialize_connection(&mut self, address: &[u8]) -> Result<()> {
        let outcome = self.connect_to_address(address).await;
        self.finish(outcome)
    }

    async fn open(&mut self, desc: &mut SessionDesc, flags: OpenFlags) -> Result<()> {
        let outcome = self.open_session(desc, flags).await;
        self.finish(outcome)
    }

    async fn create_player(
        &mut self,
        short_name: &str,
        long_name: &str,
        flags: PlayerFlags,
        data: &[u8],
    ) -> Result<Pid> {
        let outcome = self.request_player(short_name, long_name, flags, data).await;
        self.finish(outcome)
    }

    fn destroy_player(&mut self, pid: Pid) -> Result<()> {
        if !self.client.is_connected() {
            return Err(Error::NotConnected);
        }
        self.client.destroy_player(pid)
    }

    fn send(&mut self, from: Pid, to: Pid, flags: SendOptions, data: &[u8]) -> Result<()> {
        self.pump();

        if data.is_empty() {
            return Err(Error::InvalidParam("data"));
        }
        if !from.is_valid_sender() || !to.is_valid_recipient() {
            return Err(Error::InvalidPlayer);
        }
        if !self.client.is_connected() {
            return Err(Error::NotConnected);
        }
        if flags.intersects(SendOptions::SIGNED | SendOptions::ENCRYPTED | SendOptions::LOBBY_SYSTEM_MESSAGE) {
            return Err(Error::Unsupported("signed, encrypted or lobby system sends"));
        }
        if flags.contains(SendOptions::ASYNC) && !flags.contains(SendOptions::NO_SEND_COMPLETE_MSG) {
            return Err(Error::Unsupported("send complete notifications"));
        }

        let transport_flags = SendFlags {
            reliable: flags.contains(SendOptions::GUARANTEED),
            same_thread: !flags.contains(SendOptions::ASYNC),
        };
        self.client.send(from, to, data, transport_flags)
    }

    fn receive(&mut self, from: Pid, to: Pid, flags: ReceiveFlags, buf: &mut [u8]) -> Result<Received> {
        self.pump();

        if !self.client.is_connected() {
            return Err(Error::NotConnected);
        }
        let filter = ReceiveFilter {
            from: flags.contains(ReceiveFlags::FROM_PLAYER).then_some(from),
            to: flags.contains(ReceiveFlags::TO_PLAYER).then_some(to),
            any: flags.contains(ReceiveFlags::ALL),
            peek: flags.contains(ReceiveFlags::PEEK),
        };
        self.client.receive(filter, buf)
    }

    async fn enum_sessions(
        &mut self,
        filter: &SessionDesc,
        timeout: Duration,
        callback: &mut EnumSessionsCallback<'_>,
    ) -> Result<()> {
        let listed = self.list_sessions(timeout).await;
        self.finish(listed)?;

        for entry in self.sessions.entries() {
            // no metadata, e.g. a private entry
            if entry.max_players == 0 {
                continue;
            }

            let mut flags = SessionFlags::SECURE_SERVER;
            if entry.password {
                flags |= SessionFlags::PASSWORD_REQUIRED;
            }
            let desc = SessionDesc {
                flags,
                instance: entry.id.to_instance(),
                application: filter.application,
                max_players: entry.max_players,
                current_players: entry.current_players,
                name: session_name(entry),
                password: String::new(),
            };
            if !callback(&desc) {
                break;
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.client.disconnect(DisconnectReason::ClientDisconnect);
        self.stop_hosting().await;
        Ok(())
    }
}
