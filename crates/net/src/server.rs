//! Server session manager
//!
//! [`ServerCore`] owns the authoritative player directory and routes every
//! message between connections. [`Server`] drives it from a fixed-rate tick
//! task; all directory mutation happens inside a tick or in `close` after the
//! task has been joined.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use relayplay_core::{EngineConfig, Identity, Pid, PidAllocator};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{IdentityBackend, IdentityEvent, ServerDetails};
use crate::directory::Visibility;
use crate::error::{Error, Result};
use crate::frame::{MessageSender, Side};
use crate::protocol::{truncate_fixed, Message, PASSWORD_LEN, SESSION_NAME_LEN};
use crate::transport::{
    ConnectionHandle, ConnectionState, ConnectionStatusChanged, DisconnectReason, InboundMessage,
    ListenSocket, PollGroup, SendFlags, Transport,
};

/// How a hosted session is set up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub name: String,
    /// Empty for no password
    pub password: String,
    pub max_players: u32,
    pub visibility: Visibility,
    /// Require clients to present a proof token
    pub auth: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            password: String::new(),
            max_players: 4,
            visibility: Visibility::FriendsOnly,
            auth: true,
        }
    }
}

impl ServerSettings {
    pub fn has_password(&self) -> bool {
        !self.password.is_empty()
    }

    /// Clip name and password to what the wire format can carry
    pub fn normalized(mut self) -> Self {
        self.name = truncate_fixed(&self.name, SESSION_NAME_LEN).to_owned();
        self.password = truncate_fixed(&self.password, PASSWORD_LEN).to_owned();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
struct ConnectionRecord {
    remote: Identity,
    authorized: bool,
    last_activity: DateTime<Utc>,
}

/// One entry of the server directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRecord {
    pub pid: Pid,
    pub connection: ConnectionHandle,
    pub short_name: String,
    pub long_name: String,
}

/// Server state machine, advanced by [`ServerCore::tick`]
pub struct ServerCore {
    transport: Arc<dyn Transport>,
    identity: Arc<dyn IdentityBackend>,
    config: EngineConfig,
    settings: ServerSettings,
    state: ServerState,
    listen_socket: Option<ListenSocket>,
    poll_group: Option<PollGroup>,
    clients: HashMap<ConnectionHandle, ConnectionRecord>,
    players: HashMap<Pid, PlayerRecord>,
    allocator: PidAllocator,
}

impl ServerCore {
    pub fn new(transport: Arc<dyn Transport>, identity: Arc<dyn IdentityBackend>, config: EngineConfig) -> Self {
        let allocator = PidAllocator::new(config.pid_allocation_attempts);
        Self {
            transport,
            identity,
            config,
            settings: ServerSettings::default(),
            state: ServerState::Disconnected,
            listen_socket: None,
            poll_group: None,
            clients: HashMap::new(),
            players: HashMap::new(),
            allocator,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Identity clients connect to
    pub fn identity(&self) -> Identity {
        self.transport.local_identity()
    }

    /// Directory snapshot ordered by PID
    pub fn players(&self) -> Vec<PlayerRecord> {
        let mut players: Vec<PlayerRecord> = self.players.values().cloned().collect();
        players.sort_by_key(|p| p.pid);
        players
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn connection_count(&self) -> usize {
        self.clients.len()
    }

    /// Connections that have not sent anything for longer than `threshold`
    pub fn idle_connections(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> Vec<ConnectionHandle> {
        let mut idle: Vec<ConnectionHandle> = self
            .clients
            .iter()
            .filter(|(_, record)| now - record.last_activity > threshold)
            .map(|(conn, _)| *conn)
            .collect();
        idle.sort();
        idle
    }

    /// Log on, open the listening endpoint and the poll group.
    ///
    /// On success the state is `Connecting`; it becomes `Connected` on the
    /// tick that sees the log-on complete.
    pub fn start(&mut self, settings: ServerSettings) -> Result<()> {
        if self.state != ServerState::Disconnected {
            return Err(Error::AlreadyInitialized);
        }
        if settings.max_players == 0 {
            return Err(Error::InvalidParam("max_players"));
        }

        if !self.identity.log_on() {
            warn!("Identity service log on failed");
            return Err(Error::Backend("log on failed".into()));
        }

        let Some(listen_socket) = self.transport.create_listen_socket() else {
            self.identity.log_off();
            error!("Failed to create listen socket");
            return Err(Error::Backend("failed to create listen socket".into()));
        };
        let Some(poll_group) = self.transport.create_poll_group() else {
            self.transport.close_listen_socket(listen_socket);
            self.identity.log_off();
            error!("Failed to create poll group");
            return Err(Error::Backend("failed to create poll group".into()));
        };

        self.listen_socket = Some(listen_socket);
        self.poll_group = Some(poll_group);
        self.settings = settings.normalized();
        self.state = ServerState::Connecting;

        info!(identity = %self.identity(), name = %self.settings.name, "Server connecting");
        Ok(())
    }

    /// Notify every client, tear down the endpoint and clear the directory
    pub fn close(&mut self) {
        if self.state == ServerState::Disconnected {
            return;
        }

        let mut connections: Vec<_> = self.clients.iter().map(|(c, r)| (*c, r.remote)).collect();
        connections.sort_by_key(|(c, _)| *c);
        for (connection, remote) in connections {
            self.transport
                .close_connection(connection, DisconnectReason::ServerClosed, None);
            if self.settings.auth {
                self.identity.end_proof_session(remote);
            }
        }

        if let Some(socket) = self.listen_socket.take() {
            self.transport.close_listen_socket(socket);
        }
        if let Some(group) = self.poll_group.take() {
            self.transport.destroy_poll_group(group);
        }
        self.identity.log_off();
        // anything still queued belongs to the session just closed
        let stale = self.identity.poll_events();
        if !stale.is_empty() {
            debug!(count = stale.len(), "Discarding identity events of the closed session");
        }

        self.state = ServerState::Disconnected;
        self.settings = ServerSettings::default();
        self.clients.clear();
        self.players.clear();

        info!("Server closed");
    }

    /// One iteration of the server loop
    pub fn tick(&mut self) {
        for event in self.identity.poll_events() {
            self.on_identity_event(event);
        }

        for change in self.transport.poll_status_changes() {
            self.on_status_changed(change);
        }

        let Some(group) = self.poll_group else {
            return;
        };
        let messages = self
            .transport
            .receive_on_poll_group(group, self.config.server_receive_batch);
        if self.state != ServerState::Connected {
            if !messages.is_empty() {
                debug!(count = messages.len(), "Dropping messages, server not connected");
            }
            return;
        }
        for message in messages {
            self.process_message(message);
        }
    }

    fn sender(&self) -> MessageSender<'_> {
        MessageSender::new(self.transport.as_ref(), Side::Server)
    }

    fn on_identity_event(&mut self, event: IdentityEvent) {
        match event {
            IdentityEvent::LoggedOn => {
                if self.state != ServerState::Connecting {
                    return;
                }
                let product = self.config.product_name.clone();
                self.identity.set_server_details(&ServerDetails {
                    name: self.settings.name.clone(),
                    max_players: self.settings.max_players,
                    password_protected: self.settings.has_password(),
                    description: format!("{product} Multiplayer"),
                    product,
                });
                self.state = ServerState::Connected;
                info!(identity = %self.identity(), "Server connected");
            }
            IdentityEvent::LogOnFailed(reason) => {
                warn!(reason = %reason, "Server log on failed");
                self.close();
            }
            IdentityEvent::LoggedOff => {
                info!("Server logged off");
                self.close();
            }
            IdentityEvent::ProofValidated { remote, ok } => {
                let connection = self
                    .clients
                    .iter()
                    .find(|(_, record)| record.remote == remote)
                    .map(|(conn, _)| *conn);
                match connection {
                    Some(connection) => self.on_auth_completed(connection, ok),
                    None => debug!(remote = %remote, "Proof result for unknown client"),
                }
            }
        }
    }

    fn on_status_changed(&mut self, change: ConnectionStatusChanged) {
        use ConnectionState::*;

        match (change.old_state, change.new_state) {
            (None, Connecting) => self.add_client(change.connection, change.remote),
            (Connecting | Connected, ClosedByPeer | ProblemDetectedLocally) => {
                debug!(
                    connection = %change.connection,
                    old = ?change.old_state,
                    new = ?change.new_state,
                    "Client lost"
                );
                self.remove_client(change.connection, DisconnectReason::ClientDisconnect);
            }
            _ => {}
        }
    }

    fn add_client(&mut self, connection: ConnectionHandle, remote: Identity) {
        if self.state != ServerState::Connected {
            self.transport
                .close_connection(connection, DisconnectReason::ServerReject, Some("Server not ready"));
            info!(connection = %connection, "Rejecting client, server not connected");
            return;
        }

        if self.settings.auth && !remote.is_valid() {
            self.transport
                .close_connection(connection, DisconnectReason::ServerReject, Some("Invalid identity"));
            info!(connection = %connection, "Rejecting client, invalid identity");
            return;
        }

        if self.clients.contains_key(&connection) {
            warn!(connection = %connection, "Client connection already exists");
            return;
        }

        if self.players.len() >= self.settings.max_players as usize {
            self.transport
                .close_connection(connection, DisconnectReason::ServerFull, Some("Server full"));
            info!(connection = %connection, "Rejecting client, server is full");
            return;
        }

        if let Err(e) = self.transport.accept(connection) {
            self.transport
                .close_connection(connection, DisconnectReason::Generic, Some("Failed to accept connection"));
            info!(connection = %connection, error = %e, "Accepting connection failed");
            return;
        }

        if let Some(group) = self.poll_group {
            self.transport.set_connection_poll_group(connection, group);
        }

        let auth = self.settings.auth;
        let password = self.settings.has_password();
        self.clients.insert(
            connection,
            ConnectionRecord {
                remote,
                authorized: !auth && !password,
                last_activity: Utc::now(),
            },
        );

        self.sender()
            .send(connection, SendFlags::RELIABLE, &Message::Info { auth, password });

        info!(connection = %connection, remote = %remote, "Accepted client");
    }

    fn remove_client(&mut self, connection: ConnectionHandle, reason: DisconnectReason) -> bool {
        let Some(record) = self.clients.remove(&connection) else {
            return false;
        };

        if self.settings.auth {
            self.identity.end_proof_session(record.remote);
        }
        self.transport.close_connection(connection, reason, None);

        let mut owned: Vec<Pid> = self
            .players
            .values()
            .filter(|p| p.connection == connection)
            .map(|p| p.pid)
            .collect();
        owned.sort();
        for pid in owned {
            self.destroy_player(pid);
        }

        info!(connection = %connection, reason = ?reason, "Removed client");
        true
    }

    fn process_message(&mut self, inbound: InboundMessage) {
        let connection = inbound.connection;
        let Some(record) = self.clients.get_mut(&connection) else {
            info!(connection = %connection, "Message from unknown client");
            return;
        };
        record.last_activity = Utc::now();
        let authorized = record.authorized;

        let message = match Message::decode(&inbound.data) {
            Ok(message) => message,
            Err(e) => {
                warn!(connection = %connection, error = %e, "Dropping client message");
                return;
            }
        };

        match message {
            Message::BeginAuth { password, token } => self.on_begin_auth(connection, &password, &token),
            Message::CreatePlayer { .. } | Message::DestroyPlayer { .. } | Message::Data { .. }
                if !authorized =>
            {
                warn!(connection = %connection, kind = ?message.kind(), "Message from unauthorized client");
            }
            Message::CreatePlayer {
                short_name,
                long_name,
                ..
            } => self.on_create_player(connection, short_name, long_name),
            Message::DestroyPlayer { pid } => self.on_destroy_player(connection, pid),
            Message::Data { from, to, .. } => self.on_data(connection, from, to, &inbound),
            other => {
                warn!(connection = %connection, kind = ?other.kind(), "Client sent a server message");
            }
        }
    }

    fn on_begin_auth(&mut self, connection: ConnectionHandle, password: &str, token: &[u8]) {
        if self.settings.has_password() && password != self.settings.password {
            info!(connection = %connection, "Wrong password");
            self.remove_client(connection, DisconnectReason::ServerReject);
        } else if self.settings.auth {
            let Some(remote) = self.clients.get(&connection).map(|r| r.remote) else {
                return;
            };
            if !self.identity.begin_proof_session(token, remote) {
                info!(connection = %connection, "Proof token rejected");
                self.remove_client(connection, DisconnectReason::ServerReject);
            }
        } else {
            self.on_auth_completed(connection, true);
        }
    }

    fn on_auth_completed(&mut self, connection: ConnectionHandle, ok: bool) {
        if !ok {
            self.remove_client(connection, DisconnectReason::ServerReject);
            return;
        }
        let Some(record) = self.clients.get_mut(&connection) else {
            return;
        };
        record.authorized = true;

        self.sender()
            .send(connection, SendFlags::RELIABLE, &Message::AuthPassed);
        info!(connection = %connection, "Client passed auth");
    }

    fn on_create_player(&mut self, connection: ConnectionHandle, short_name: String, long_name: String) {
        let pid = if self.players.len() < self.settings.max_players as usize {
            self.allocator.allocate(&self.players)
        } else {
            Pid::UNKNOWN
        };

        if pid.is_unknown() {
            info!(connection = %connection, "Failed to create player");
        } else {
            self.players.insert(
                pid,
                PlayerRecord {
                    pid,
                    connection,
                    short_name: short_name.clone(),
                    long_name: long_name.clone(),
                },
            );
            let created = Message::PlayerCreated {
                pid,
                short_name: short_name.clone(),
                long_name: long_name.clone(),
            };
            self.broadcast_except(connection, &created);
            debug!(pid = %pid, connection = %connection, name = %short_name, "Created player");
        }

        self.sender().send(
            connection,
            SendFlags::RELIABLE,
            &Message::CreatePlayerResponse {
                pid,
                short_name,
                long_name,
            },
        );
    }

    fn on_destroy_player(&mut self, connection: ConnectionHandle, pid: Pid) {
        if pid == Pid::ALL_PLAYERS {
            let mut owned: Vec<Pid> = self
                .players
                .values()
                .filter(|p| p.connection == connection)
                .map(|p| p.pid)
                .collect();
            owned.sort();
            for pid in owned {
                self.destroy_player(pid);
            }
            return;
        }

        match self.players.get(&pid) {
            Some(player) if player.connection == connection => {
                self.destroy_player(pid);
            }
            Some(_) => warn!(pid = %pid, connection = %connection, "Client tried to destroy a foreign player"),
            None => debug!(pid = %pid, "Destroy for unknown player"),
        }
    }

    fn destroy_player(&mut self, pid: Pid) -> Option<PlayerRecord> {
        let record = self.players.remove(&pid)?;
        self.broadcast_except(record.connection, &Message::PlayerDestroyed { pid });
        debug!(pid = %pid, "Destroyed player");
        Some(record)
    }

    fn on_data(&mut self, connection: ConnectionHandle, from: Pid, to: Pid, inbound: &InboundMessage) {
        match self.players.get(&from) {
            Some(sender) if sender.connection == connection => {}
            _ => {
                info!(connection = %connection, from = %from, "Data with invalid sender");
                return;
            }
        }

        if to == Pid::ALL_PLAYERS {
            let sender = self.sender();
            for recipient in self.other_connections(connection) {
                sender.relay(recipient, inbound);
            }
        } else if let Some(recipient) = self.players.get(&to) {
            self.sender().relay(recipient.connection, inbound);
        } else {
            info!(to = %to, "Data recipient not found");
        }
    }

    fn other_connections(&self, except: ConnectionHandle) -> Vec<ConnectionHandle> {
        let mut connections: Vec<ConnectionHandle> =
            self.clients.keys().copied().filter(|c| *c != except).collect();
        connections.sort();
        connections
    }

    fn broadcast_except(&self, except: ConnectionHandle, message: &Message) {
        let sender = self.sender();
        for connection in self.other_connections(except) {
            sender.send(connection, SendFlags::RELIABLE, message);
        }
    }
}

fn lock(core: &Mutex<ServerCore>) -> MutexGuard<'_, ServerCore> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hosted server with its own tick task
pub struct Server {
    core: Arc<Mutex<ServerCore>>,
    tick: Duration,
    client_timeout: Duration,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Server {
    pub fn new(transport: Arc<dyn Transport>, identity: Arc<dyn IdentityBackend>, config: EngineConfig) -> Self {
        let tick = config.tick_duration();
        let client_timeout = config.client_timeout();
        Self {
            core: Arc::new(Mutex::new(ServerCore::new(transport, identity, config))),
            tick,
            client_timeout,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Start the server and its tick loop
    pub async fn start(&mut self, settings: ServerSettings) -> Result<()> {
        lock(&self.core).start(settings)?;

        self.cancel = CancellationToken::new();
        let cancel = self.cancel.clone();
        let core = Arc::clone(&self.core);
        let period = self.tick;

        self.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => lock(&core).tick(),
                }
            }
            debug!("Server tick loop stopped");
        }));
        Ok(())
    }

    /// Stop the tick loop, wait for it, then close the session
    pub async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Server tick loop failed");
            }
        }
        lock(&self.core).close();
    }

    /// Run one tick on the caller's task
    pub fn tick(&self) {
        lock(&self.core).tick();
    }

    pub fn state(&self) -> ServerState {
        lock(&self.core).state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ServerState::Connected
    }

    pub fn identity(&self) -> Identity {
        lock(&self.core).identity()
    }

    pub fn players(&self) -> Vec<PlayerRecord> {
        lock(&self.core).players()
    }

    pub fn player_count(&self) -> usize {
        lock(&self.core).player_count()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.core).connection_count()
    }

    /// Connections idle for longer than the configured client timeout
    pub fn idle_connections(&self) -> Vec<ConnectionHandle> {
        let threshold = chrono::Duration::seconds(self.client_timeout.as_secs() as i64);
        lock(&self.core).idle_connections(Utc::now(), threshold)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        lock(&self.core).close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{LocalUser, MemoryIdentityService};
    use crate::memory::{MemoryNetwork, MemoryTransport};
    use crate::transport::OutboundMessage;

    const SERVER_ID: u64 = 1;

    struct Harness {
        network: MemoryNetwork,
        service: MemoryIdentityService,
        core: ServerCore,
    }

    impl Harness {
        fn start(settings: ServerSettings) -> Self {
            let network = MemoryNetwork::new();
            let service = MemoryIdentityService::new();
            let id = Identity::game_server(SERVER_ID);
            let mut core = ServerCore::new(
                Arc::new(network.endpoint(id)),
                Arc::new(service.server(id)),
                EngineConfig::default(),
            );
            core.start(settings).unwrap();
            assert_eq!(core.state(), ServerState::Connecting);
            core.tick();
            assert_eq!(core.state(), ServerState::Connected);
            Self { network, service, core }
        }

        fn connect(&mut self, account: u64) -> Peer {
            let transport = self.network.endpoint(Identity::individual(account));
            let connection = transport.connect(self.core.identity()).unwrap();
            self.core.tick();
            Peer { transport, connection }
        }
    }

    struct Peer {
        transport: MemoryTransport,
        connection: ConnectionHandle,
    }

    impl Peer {
        fn send(&self, message: &Message) {
            self.send_raw(message.to_bytes());
        }

        fn send_raw(&self, bytes: Vec<u8>) {
            self.transport
                .send_message(self.connection, OutboundMessage::from_vec(bytes), SendFlags::RELIABLE)
                .unwrap();
        }

        fn recv(&self) -> Vec<Message> {
            self.transport
                .receive_on_connection(self.connection, 64)
                .iter()
                .map(|m| Message::decode(&m.data).unwrap())
                .collect()
        }

        fn end_reason(&self) -> Option<u32> {
            self.transport
                .poll_status_changes()
                .into_iter()
                .find(|e| e.new_state == ConnectionState::ClosedByPeer)
                .and_then(|e| e.end_reason)
        }

        fn create_player(&self, core: &mut ServerCore, name: &str) -> Pid {
            self.send(&Message::CreatePlayer {
                short_name: name.into(),
                long_name: format!("{name} long"),
                server_player: false,
                spectator: false,
                payload: vec![],
            });
            core.tick();
            let pid = self
                .recv()
                .into_iter()
                .find_map(|m| match m {
                    Message::CreatePlayerResponse { pid, .. } => Some(pid),
                    _ => None,
                });
            pid.unwrap()
        }
    }

    fn open(max_players: u32) -> ServerSettings {
        ServerSettings {
            name: "Test".into(),
            max_players,
            auth: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_start_publishes_details_once_logged_on() {
        let harness = Harness::start(ServerSettings {
            password: "pw".into(),
            ..open(8)
        });
        let details = harness
            .service
            .server_details(Identity::game_server(SERVER_ID))
            .unwrap();
        assert_eq!(details.name, "Test");
        assert_eq!(details.max_players, 8);
        assert!(details.password_protected);
        assert_eq!(details.product, "RedirectPlay");
        assert_eq!(details.description, "RedirectPlay Multiplayer");
    }

    #[test]
    fn test_start_failure_leaves_server_disconnected() {
        let network = MemoryNetwork::new();
        let service = MemoryIdentityService::new();
        let id = Identity::game_server(SERVER_ID);
        // another listener already owns the endpoint
        network.endpoint(id).create_listen_socket().unwrap();

        let mut core = ServerCore::new(Arc::new(network.endpoint(id)), Arc::new(service.server(id)), EngineConfig::default());
        assert!(core.start(open(2)).is_err());
        assert_eq!(core.state(), ServerState::Disconnected);
        assert!(!service.is_logged_on(id));
    }

    #[test]
    fn test_restart_ignores_events_of_closed_session() {
        let network = MemoryNetwork::new();
        let service = MemoryIdentityService::new();
        let id = Identity::game_server(SERVER_ID);
        let mut core = ServerCore::new(Arc::new(network.endpoint(id)), Arc::new(service.server(id)), EngineConfig::default());

        // closed before any tick saw the log-on
        core.start(open(2)).unwrap();
        core.close();

        core.start(open(2)).unwrap();
        core.tick();
        assert_eq!(core.state(), ServerState::Connected);
        core.tick();
        assert_eq!(core.state(), ServerState::Connected);
        assert!(service.is_logged_on(id));
    }

    #[test]
    fn test_log_on_failure_closes() {
        let network = MemoryNetwork::new();
        let service = MemoryIdentityService::new();
        service.refuse_log_on(true);
        let id = Identity::game_server(SERVER_ID);
        let mut core = ServerCore::new(Arc::new(network.endpoint(id)), Arc::new(service.server(id)), EngineConfig::default());

        core.start(open(2)).unwrap();
        core.tick();
        assert_eq!(core.state(), ServerState::Disconnected);
    }

    #[test]
    fn test_accepted_client_receives_info() {
        let mut harness = Harness::start(ServerSettings {
            password: "pw".into(),
            ..open(2)
        });
        let peer = harness.connect(10);
        assert_eq!(peer.recv(), vec![Message::Info { auth: false, password: true }]);
        assert_eq!(harness.core.connection_count(), 1);
    }

    #[test]
    fn test_create_players_up_to_capacity() {
        let mut harness = Harness::start(open(2));
        let peer = harness.connect(10);
        peer.recv();

        let first = peer.create_player(&mut harness.core, "A");
        let second = peer.create_player(&mut harness.core, "B");
        assert!(first.is_player());
        assert!(second.is_player());
        assert_ne!(first, second);

        let third = peer.create_player(&mut harness.core, "C");
        assert_eq!(third, Pid::UNKNOWN);
        assert_eq!(harness.core.player_count(), 2);
    }

    #[test]
    fn test_destroy_foreign_player_is_ignored() {
        let mut harness = Harness::start(open(4));
        let alice = harness.connect(10);
        let bob = harness.connect(11);
        let pid = alice.create_player(&mut harness.core, "A");

        bob.send(&Message::DestroyPlayer { pid });
        bob.send(&Message::DestroyPlayer { pid: Pid::ALL_PLAYERS });
        harness.core.tick();
        assert_eq!(harness.core.players().len(), 1);

        alice.send(&Message::DestroyPlayer { pid });
        harness.core.tick();
        assert!(harness.core.players().is_empty());
        assert!(bob.recv().contains(&Message::PlayerDestroyed { pid }));
    }

    #[test]
    fn test_truncated_message_is_dropped() {
        let mut harness = Harness::start(open(4));
        let peer = harness.connect(10);
        peer.recv();

        // create-player discriminant with a body far shorter than its fixed part
        peer.send_raw(vec![3, b'A', 0]);
        peer.send_raw(vec![0xEE]);
        harness.core.tick();

        assert_eq!(harness.core.player_count(), 0);
        assert!(peer.recv().is_empty());
        assert_eq!(harness.core.connection_count(), 1);
    }

    #[test]
    fn test_data_routing() {
        let mut harness = Harness::start(open(4));
        let alice = harness.connect(10);
        let bob = harness.connect(11);
        let carol = harness.connect(12);
        let a = alice.create_player(&mut harness.core, "A");
        let b = bob.create_player(&mut harness.core, "B");
        alice.recv();
        bob.recv();
        carol.recv();

        alice.send(&Message::Data { from: a, to: Pid::ALL_PLAYERS, payload: vec![7] });
        harness.core.tick();
        let expected = Message::Data { from: a, to: Pid::ALL_PLAYERS, payload: vec![7] };
        assert_eq!(bob.recv(), vec![expected.clone()]);
        assert_eq!(carol.recv(), vec![expected]);
        assert!(alice.recv().is_empty());

        alice.send(&Message::Data { from: a, to: b, payload: vec![8] });
        harness.core.tick();
        assert_eq!(bob.recv().len(), 1);
        assert!(carol.recv().is_empty());

        // spoofed sender
        carol.send(&Message::Data { from: a, to: Pid::ALL_PLAYERS, payload: vec![9] });
        harness.core.tick();
        assert!(alice.recv().is_empty());
        assert!(bob.recv().is_empty());
    }

    #[test]
    fn test_wrong_password_is_rejected() {
        let mut harness = Harness::start(ServerSettings {
            password: "secret".into(),
            ..open(4)
        });
        let peer = harness.connect(10);
        peer.recv();

        // unauthorized clients cannot create players
        peer.send(&Message::CreatePlayer {
            short_name: "A".into(),
            long_name: String::new(),
            server_player: false,
            spectator: false,
            payload: vec![],
        });
        peer.send(&Message::BeginAuth { password: "nope".into(), token: vec![] });
        harness.core.tick();

        assert_eq!(harness.core.player_count(), 0);
        assert_eq!(harness.core.connection_count(), 0);
        assert_eq!(peer.end_reason(), Some(DisconnectReason::ServerReject as u32));
    }

    #[test]
    fn test_correct_password_passes() {
        let mut harness = Harness::start(ServerSettings {
            password: "secret".into(),
            ..open(4)
        });
        let peer = harness.connect(10);
        peer.recv();

        peer.send(&Message::BeginAuth { password: "secret".into(), token: vec![] });
        harness.core.tick();
        assert_eq!(peer.recv(), vec![Message::AuthPassed]);
    }

    #[test]
    fn test_proof_token_flow() {
        let mut harness = Harness::start(ServerSettings {
            auth: true,
            ..open(4)
        });
        let user = harness.service.user(Identity::individual(10));
        let peer = harness.connect(10);
        assert_eq!(peer.recv(), vec![Message::Info { auth: true, password: false }]);

        let ticket = user.proof_token().unwrap();
        peer.send(&Message::BeginAuth { password: String::new(), token: ticket.token });
        harness.core.tick();
        harness.core.tick();
        assert_eq!(peer.recv(), vec![Message::AuthPassed]);

        // a token issued to someone else fails validation
        let other = harness.service.user(Identity::individual(99)).proof_token().unwrap();
        let intruder = harness.connect(11);
        intruder.recv();
        intruder.send(&Message::BeginAuth { password: String::new(), token: other.token });
        harness.core.tick();
        harness.core.tick();
        assert_eq!(intruder.end_reason(), Some(DisconnectReason::ServerReject as u32));
    }

    #[test]
    fn test_full_server_rejects_connection() {
        let mut harness = Harness::start(open(1));
        let alice = harness.connect(10);
        alice.create_player(&mut harness.core, "A");

        let bob = harness.connect(11);
        assert_eq!(bob.end_reason(), Some(DisconnectReason::ServerFull as u32));
        assert_eq!(harness.core.connection_count(), 1);
    }

    #[test]
    fn test_dropped_connection_cascades() {
        let mut harness = Harness::start(open(4));
        let alice = harness.connect(10);
        let bob = harness.connect(11);
        let a1 = alice.create_player(&mut harness.core, "A1");
        let a2 = alice.create_player(&mut harness.core, "A2");
        bob.recv();

        harness.network.sever(alice.transport.local_identity());
        harness.core.tick();

        let destroyed = bob.recv();
        assert_eq!(destroyed.len(), 2);
        assert!(destroyed.contains(&Message::PlayerDestroyed { pid: a1 }));
        assert!(destroyed.contains(&Message::PlayerDestroyed { pid: a2 }));
        assert!(harness.core.players().is_empty());
        assert_eq!(harness.core.connection_count(), 1);
    }

    #[test]
    fn test_close_notifies_clients() {
        let mut harness = Harness::start(open(4));
        let alice = harness.connect(10);
        alice.create_player(&mut harness.core, "A");

        harness.core.close();
        assert_eq!(harness.core.state(), ServerState::Disconnected);
        assert!(harness.core.players().is_empty());
        assert_eq!(alice.end_reason(), Some(DisconnectReason::ServerClosed as u32));
        assert!(!harness.service.is_logged_on(Identity::game_server(SERVER_ID)));
    }

    #[test]
    fn test_idle_connections() {
        let mut harness = Harness::start(open(4));
        harness.connect(10);
        let now = Utc::now();
        assert!(harness.core.idle_connections(now, chrono::Duration::seconds(50)).is_empty());
        let later = now + chrono::Duration::seconds(120);
        assert_eq!(harness.core.idle_connections(later, chrono::Duration::seconds(50)).len(), 1);
    }

    #[tokio::test]
    async fn test_server_tick_loop() {
        let network = MemoryNetwork::new();
        let service = MemoryIdentityService::new();
        let id = Identity::game_server(SERVER_ID);
        let mut server = Server::new(Arc::new(network.endpoint(id)), Arc::new(service.server(id)), EngineConfig::default());

        server.start(open(2)).await.unwrap();
        assert!(server.start(open(2)).await.is_err());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !server.is_connected() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(server.is_connected());
        assert_eq!(server.identity(), id);

        server.close().await;
        assert_eq!(server.state(), ServerState::Disconnected);
        assert!(!service.is_logged_on(id));
    }
}
