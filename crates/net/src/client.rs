//! Client session state machine
//!
//! Owns one connection to a server. Progress is made by [`Client::pump`],
//! which the caller runs on every operation and while waiting.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use relayplay_core::{EngineConfig, Identity, Pid};
use tracing::{debug, info, warn};

use crate::auth::LocalUser;
use crate::error::{Error, Result};
use crate::frame::{MessageSender, Side};
use crate::prompt::Prompt;
use crate::protocol::{truncate_fixed, Message, PASSWORD_LEN};
use crate::system::SystemMessage;
use crate::transport::{
    ConnectionHandle, ConnectionStatusChanged, DisconnectReason, InboundMessage, SendFlags, Transport,
};

/// Connection state as seen by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    PendingAuth,
    Connected,
}

/// Receives the PID assigned by the server, `Pid::UNKNOWN` on failure
pub type CreatePlayerCallback = Box<dyn FnOnce(Pid) + Send>;

/// A player in the client's view of the directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerEntry {
    pub pid: Pid,
    pub short_name: String,
    pub long_name: String,
    /// Created by this client
    pub local: bool,
}

/// Parameters of a create-player request
#[derive(Debug, Clone, Default)]
pub struct CreatePlayerRequest<'a> {
    pub short_name: &'a str,
    pub long_name: &'a str,
    pub server_player: bool,
    pub spectator: bool,
    pub data: &'a [u8],
}

/// Which queued message a receive call takes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveFilter {
    pub from: Option<Pid>,
    pub to: Option<Pid>,
    /// Take the head of the queue regardless of `from` and `to`
    pub any: bool,
    /// Leave the message queued
    pub peek: bool,
}

impl ReceiveFilter {
    pub fn any() -> Self {
        Self {
            any: true,
            ..Default::default()
        }
    }

    fn matches(&self, message: &PendingMessage) -> bool {
        self.any
            || (self.from.map_or(true, |from| message.from == from)
                && self.to.map_or(true, |to| message.to == to))
    }
}

/// Result of a successful receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    pub from: Pid,
    pub to: Pid,
    pub len: usize,
}

#[derive(Debug, Clone)]
struct PendingMessage {
    from: Pid,
    to: Pid,
    /// Shared between the copies queued for each local player
    body: Arc<[u8]>,
}

pub struct Client {
    transport: Arc<dyn Transport>,
    user: Arc<dyn LocalUser>,
    prompt: Arc<dyn Prompt>,
    receive_batch: usize,
    state: ClientState,
    server: Identity,
    connection: Option<ConnectionHandle>,
    password: String,
    ticket: Option<u32>,
    lost: bool,
    players: HashMap<Pid, PlayerEntry>,
    inbox: VecDeque<PendingMessage>,
    pending_create: Option<CreatePlayerCallback>,
}

impl Client {
    pub fn new(
        transport: Arc<dyn Transport>,
        user: Arc<dyn LocalUser>,
        prompt: Arc<dyn Prompt>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            transport,
            user,
            prompt,
            receive_batch: config.client_receive_batch,
            state: ClientState::Disconnected,
            server: Identity::NIL,
            connection: None,
            password: String::new(),
            ticket: None,
            lost: false,
            players: HashMap::new(),
            inbox: VecDeque::new(),
            pending_create: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    pub fn is_connecting_or_pending(&self) -> bool {
        matches!(self.state, ClientState::Connecting | ClientState::PendingAuth)
    }

    /// The transport dropped the connection. The state is left as it was
    /// until [`Client::disconnect`] is called.
    pub fn is_lost(&self) -> bool {
        self.lost
    }

    pub fn server(&self) -> Identity {
        self.server
    }

    /// Directory snapshot ordered by PID
    pub fn players(&self) -> Vec<PlayerEntry> {
        let mut players: Vec<PlayerEntry> = self.players.values().cloned().collect();
        players.sort_by_key(|p| p.pid);
        players
    }

    pub fn player(&self, pid: Pid) -> Option<&PlayerEntry> {
        self.players.get(&pid)
    }

    pub fn pending_messages(&self) -> usize {
        self.inbox.len()
    }

    fn local_pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self
            .players
            .values()
            .filter(|p| p.local)
            .map(|p| p.pid)
            .collect();
        pids.sort();
        pids
    }

    fn sender(&self) -> MessageSender<'_> {
        MessageSender::new(self.transport.as_ref(), Side::Client)
    }

    fn connection(&self) -> Result<ConnectionHandle> {
        self.connection.ok_or(Error::NotConnected)
    }

    /// Open a connection to `server`; completes through [`Client::pump`]
    pub fn join(&mut self, server: Identity, password: Option<&str>) -> Result<()> {
        if !server.is_valid() {
            return Err(Error::InvalidParam("server identity"));
        }
        if self.connection.is_some() {
            debug!("Previous client session was not closed");
            self.disconnect(DisconnectReason::ClientDisconnect);
        }

        let connection = self
            .transport
            .connect(server)
            .ok_or_else(|| Error::Backend("failed to open connection".into()))?;

        self.connection = Some(connection);
        self.state = ClientState::Connecting;
        self.server = server;
        self.password = truncate_fixed(password.unwrap_or_default(), PASSWORD_LEN).to_owned();
        self.lost = false;

        info!(server = %server, "Connecting to server");
        Ok(())
    }

    /// Close the connection and forget the session
    pub fn disconnect(&mut self, reason: DisconnectReason) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        match self.ticket.take() {
            Some(handle) => self.user.cancel_proof_token(handle),
            None => self.user.advertise_game(None),
        }

        self.transport.close_connection(connection, reason, None);
        self.state = ClientState::Disconnected;
        self.server = Identity::NIL;
        self.players.clear();
        self.password.clear();
        self.inbox.clear();
        self.pending_create = None;

        info!(reason = ?reason, "Disconnected from server");
    }

    /// Apply connection notifications and received messages
    pub fn pump(&mut self) {
        let Some(connection) = self.connection else {
            return;
        };

        for change in self.transport.poll_status_changes() {
            if change.connection == connection {
                self.on_status_changed(change);
            }
        }

        let messages = self
            .transport
            .receive_on_connection(connection, self.receive_batch);
        for message in messages {
            self.process_message(message);
            if self.connection.is_none() {
                break;
            }
        }
    }

    fn on_status_changed(&mut self, change: ConnectionStatusChanged) {
        if change.old_state.is_disconnected() || !change.new_state.is_disconnected() {
            return;
        }
        debug!(
            old = ?change.old_state,
            new = ?change.new_state,
            reason = ?change.end_reason,
            "Session lost"
        );
        self.lost = true;
        self.enqueue_system(&SystemMessage::SessionLost);
        self.prompt.session_lost();
    }

    fn process_message(&mut self, inbound: InboundMessage) {
        let message = match Message::decode(&inbound.data) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping server message");
                return;
            }
        };

        match message {
            Message::Info { auth, password } => self.on_info(auth, password),
            Message::AuthPassed => {
                self.state = ClientState::Connected;
                info!("Passed auth with server");
            }
            Message::CreatePlayerResponse {
                pid,
                short_name,
                long_name,
            } => self.on_create_player_response(pid, short_name, long_name),
            Message::PlayerCreated {
                pid,
                short_name,
                long_name,
            } => self.on_player_created(pid, short_name, long_name),
            Message::PlayerDestroyed { pid } => self.on_player_destroyed(pid),
            Message::Data { from, to, payload } => self.on_data(from, to, payload),
            other => warn!(kind = ?other.kind(), "Server sent a client message"),
        }
    }

    fn on_info(&mut self, auth: bool, password: bool) {
        if !auth && !password {
            self.user.advertise_game(Some(self.server));
            self.state = ClientState::Connected;
            info!("Connected to server");
            return;
        }

        let mut response_password = String::new();
        if password {
            if self.password.is_empty() {
                match self.prompt.request_password() {
                    Some(entered) => self.password = truncate_fixed(&entered, PASSWORD_LEN).to_owned(),
                    None => {
                        self.disconnect(DisconnectReason::ClientDisconnect);
                        return;
                    }
                }
            }
            response_password = self.password.clone();
        }

        let mut token = Vec::new();
        if auth {
            match self.user.proof_token() {
                Some(ticket) => {
                    self.ticket = Some(ticket.handle);
                    token = ticket.token;
                }
                None => warn!("Got invalid proof token"),
            }
        }

        let begin = Message::BeginAuth {
            password: response_password,
            token,
        };
        if let Ok(connection) = self.connection() {
            self.sender().send(connection, SendFlags::RELIABLE, &begin);
        }

        self.state = ClientState::PendingAuth;
        info!("Pending auth with server");
    }

    fn on_create_player_response(&mut self, pid: Pid, short_name: String, long_name: String) {
        if pid.is_unknown() {
            info!("Server failed to create player");
        } else {
            if self.players.contains_key(&pid) {
                info!(pid = %pid, "Player already exists");
            }
            debug!(pid = %pid, name = %short_name, "Created local player");
            self.players.insert(
                pid,
                PlayerEntry {
                    pid,
                    short_name,
                    long_name,
                    local: true,
                },
            );
        }

        if let Some(callback) = self.pending_create.take() {
            callback(pid);
        }
    }

    fn on_player_created(&mut self, pid: Pid, short_name: String, long_name: String) {
        if pid.is_unknown() {
            return;
        }
        self.players.insert(
            pid,
            PlayerEntry {
                pid,
                short_name: short_name.clone(),
                long_name: long_name.clone(),
                local: false,
            },
        );
        debug!(pid = %pid, name = %short_name, "Created remote player");

        self.enqueue_system(&SystemMessage::PlayerCreated {
            pid,
            current_players: self.players.len() as u32,
            short_name,
            long_name,
        });
    }

    fn on_player_destroyed(&mut self, pid: Pid) {
        let Some(player) = self.players.remove(&pid) else {
            return;
        };
        debug!(pid = %pid, "Destroyed remote player");

        self.enqueue_system(&SystemMessage::PlayerDestroyed {
            pid,
            short_name: player.short_name,
            long_name: player.long_name,
        });
    }

    fn on_data(&mut self, from: Pid, to: Pid, payload: Vec<u8>) {
        if !from.is_valid_sender() {
            warn!(from = %from, "Data sender is invalid");
            return;
        }
        if !to.is_valid_recipient() {
            warn!(to = %to, "Data recipient is invalid");
            return;
        }

        let body: Arc<[u8]> = payload.into();
        if to == Pid::ALL_PLAYERS {
            for local in self.local_pids() {
                self.inbox.push_back(PendingMessage {
                    from,
                    to: local,
                    body: Arc::clone(&body),
                });
            }
        } else if let Some(recipient) = self.players.get(&to) {
            if recipient.local {
                self.inbox.push_back(PendingMessage { from, to, body });
            }
        } else {
            info!(to = %to, "Data recipient not found");
        }
    }

    /// Queue a system message for every local player
    fn enqueue_system(&mut self, message: &SystemMessage) {
        let body: Arc<[u8]> = message.to_bytes().into();
        for local in self.local_pids() {
            self.inbox.push_back(PendingMessage {
                from: Pid::SYSTEM_MESSAGE,
                to: local,
                body: Arc::clone(&body),
            });
        }
    }

    /// Ask the server for a new player. The callback of the most recent
    /// request is the one that receives the next response.
    pub fn create_player(&mut self, request: &CreatePlayerRequest<'_>, callback: CreatePlayerCallback) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let message = Message::CreatePlayer {
            short_name: request.short_name.to_owned(),
            long_name: request.long_name.to_owned(),
            server_player: request.server_player,
            spectator: request.spectator,
            payload: request.data.to_vec(),
        };
        self.sender()
            .try_send(self.connection()?, SendFlags::RELIABLE, &message)?;

        self.pending_create = Some(callback);
        Ok(())
    }

    /// Remove a local player, or all of them with `Pid::ALL_PLAYERS`
    pub fn destroy_player(&mut self, pid: Pid) -> Result<()> {
        let connection = self.connection()?;
        if pid == Pid::ALL_PLAYERS {
            self.players.retain(|_, p| !p.local);
        } else {
            match self.players.get(&pid) {
                Some(player) if player.local => {
                    self.players.remove(&pid);
                }
                _ => return Err(Error::InvalidPlayer),
            }
        }

        self.sender()
            .try_send(connection, SendFlags::RELIABLE, &Message::DestroyPlayer { pid })
    }

    /// Send data to the server for relay
    pub fn send(&mut self, from: Pid, to: Pid, data: &[u8], flags: SendFlags) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let message = Message::Data {
            from,
            to,
            payload: data.to_vec(),
        };
        self.sender().try_send(self.connection()?, flags, &message)
    }

    /// Copy the first queued message matching `filter` into `buf`.
    ///
    /// System messages are copied whole, data messages without their header.
    /// If `buf` is too small nothing is dequeued.
    pub fn receive(&mut self, filter: ReceiveFilter, buf: &mut [u8]) -> Result<Received> {
        let index = self
            .inbox
            .iter()
            .position(|m| filter.matches(m))
            .ok_or(Error::NoMessages)?;

        let message = &self.inbox[index];
        let len = message.body.len();
        if buf.len() < len {
            return Err(Error::BufferTooSmall { required: len });
        }
        buf[..len].copy_from_slice(&message.body);
        let received = Received {
            from: message.from,
            to: message.to,
            len,
        };

        if !filter.peek {
            self.inbox.remove(index);
        }
        Ok(received)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect(DisconnectReason::ClientDisconnect);
    }
}
