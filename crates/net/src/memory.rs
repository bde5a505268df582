//! In-process transport
//!
//! [`MemoryNetwork`] is a shared switchboard; each [`MemoryTransport`] is one
//! endpoint on it, addressed by its [`Identity`]. Useful for tests and for
//! hosting and joining inside a single process.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use relayplay_core::Identity;
use tracing::debug;

use crate::transport::{
    ConnectionHandle, ConnectionInfo, ConnectionState, ConnectionStatusChanged, DisconnectReason,
    InboundMessage, ListenSocket, OutboundMessage, PollGroup, SendFlags, Transport, TransportError,
};

/// Largest message the in-memory transport carries
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 512 * 1024;

struct Link {
    remote: Identity,
    peer: Option<ConnectionHandle>,
    state: ConnectionState,
    poll_group: Option<PollGroup>,
    end_reason: Option<u32>,
}

#[derive(Default)]
struct Endpoint {
    listening: Option<ListenSocket>,
    connections: HashMap<ConnectionHandle, Link>,
    poll_groups: HashSet<PollGroup>,
    inbound: VecDeque<InboundMessage>,
    events: Vec<ConnectionStatusChanged>,
}

impl Endpoint {
    fn transition(&mut self, handle: ConnectionHandle, new_state: ConnectionState, end_reason: Option<u32>) {
        if let Some(link) = self.connections.get_mut(&handle) {
            let old_state = link.state;
            if old_state == new_state {
                return;
            }
            link.state = new_state;
            if end_reason.is_some() {
                link.end_reason = end_reason;
            }
            self.events.push(ConnectionStatusChanged {
                connection: handle,
                old_state,
                new_state,
                remote: link.remote,
                end_reason: link.end_reason,
            });
        }
    }
}

struct NetworkState {
    endpoints: HashMap<Identity, Endpoint>,
    next_id: u32,
    max_message_size: usize,
}

impl NetworkState {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

/// Shared in-process network
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetworkState {
                endpoints: HashMap::new(),
                next_id: 0,
                max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an endpoint and return its transport
    pub fn endpoint(&self, identity: Identity) -> MemoryTransport {
        self.state().endpoints.entry(identity).or_default();
        MemoryTransport {
            network: self.clone(),
            identity,
        }
    }

    /// Limit the size of messages that can be allocated
    pub fn set_max_message_size(&self, size: usize) {
        self.state().max_message_size = size;
    }

    /// Simulate an unclean loss of `identity`: every connection it holds
    /// drops without a close handshake.
    pub fn sever(&self, identity: Identity) {
        let mut state = self.state();
        let Some(endpoint) = state.endpoints.get_mut(&identity) else {
            return;
        };

        let handles: Vec<ConnectionHandle> = endpoint.connections.keys().copied().collect();
        let mut peers = Vec::new();
        for handle in handles {
            if let Some(link) = endpoint.connections.get(&handle) {
                if let Some(peer) = link.peer {
                    peers.push((link.remote, peer));
                }
            }
            endpoint.transition(handle, ConnectionState::ProblemDetectedLocally, None);
        }

        for (remote, peer) in peers {
            if let Some(other) = state.endpoints.get_mut(&remote) {
                other.transition(peer, ConnectionState::ProblemDetectedLocally, None);
            }
        }
        debug!(identity = %identity, "Severed endpoint");
    }
}

/// One endpoint on a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    identity: Identity,
}

impl MemoryTransport {
    fn with_endpoint<R>(&self, f: impl FnOnce(&mut Endpoint) -> R) -> Option<R> {
        let mut state = self.network.state();
        state.endpoints.get_mut(&self.identity).map(f)
    }

    fn drain_inbound(&self, max: usize, mut wanted: impl FnMut(&Endpoint, &InboundMessage) -> bool) -> Vec<InboundMessage> {
        self.with_endpoint(|endpoint| {
            let mut taken = Vec::new();
            let mut kept = VecDeque::with_capacity(endpoint.inbound.len());
            while let Some(message) = endpoint.inbound.pop_front() {
                if taken.len() < max && wanted(endpoint, &message) {
                    taken.push(message);
                } else {
                    kept.push_back(message);
                }
            }
            endpoint.inbound = kept;
            taken
        })
        .unwrap_or_default()
    }
}

impl Transport for MemoryTransport {
    fn local_identity(&self) -> Identity {
        self.identity
    }

    fn connect(&self, remote: Identity) -> Option<ConnectionHandle> {
        if !remote.is_valid() || remote == self.identity {
            return None;
        }

        let mut state = self.network.state();
        let local = ConnectionHandle(state.next_id());
        let listening = state
            .endpoints
            .get(&remote)
            .is_some_and(|e| e.listening.is_some());
        let peer = listening.then(|| ConnectionHandle(state.next_id()));

        let endpoint = state.endpoints.get_mut(&self.identity)?;
        endpoint.connections.insert(
            local,
            Link {
                remote,
                peer,
                state: ConnectionState::None,
                poll_group: None,
                end_reason: None,
            },
        );
        endpoint.transition(local, ConnectionState::Connecting, None);

        match peer {
            Some(peer) => {
                if let Some(other) = state.endpoints.get_mut(&remote) {
                    other.connections.insert(
                        peer,
                        Link {
                            remote: self.identity,
                            peer: Some(local),
                            state: ConnectionState::None,
                            poll_group: None,
                            end_reason: None,
                        },
                    );
                    other.transition(peer, ConnectionState::Connecting, None);
                }
            }
            None => {
                if let Some(endpoint) = state.endpoints.get_mut(&self.identity) {
                    endpoint.transition(local, ConnectionState::ProblemDetectedLocally, None);
                }
            }
        }
        Some(local)
    }

    fn accept(&self, connection: ConnectionHandle) -> Result<(), TransportError> {
        let mut state = self.network.state();
        let endpoint = state
            .endpoints
            .get_mut(&self.identity)
            .ok_or(TransportError::NoConnection(connection))?;
        let link = endpoint
            .connections
            .get(&connection)
            .ok_or(TransportError::NoConnection(connection))?;
        if link.state != ConnectionState::Connecting {
            return Err(TransportError::NotOpen(connection));
        }
        let (remote, peer) = (link.remote, link.peer);
        endpoint.transition(connection, ConnectionState::Connected, None);

        if let (Some(peer), Some(other)) = (peer, state.endpoints.get_mut(&remote)) {
            other.transition(peer, ConnectionState::Connected, None);
        }
        Ok(())
    }

    fn close_connection(&self, connection: ConnectionHandle, reason: DisconnectReason, debug: Option<&str>) {
        let mut state = self.network.state();
        let Some(endpoint) = state.endpoints.get_mut(&self.identity) else {
            return;
        };
        let Some(link) = endpoint.connections.remove(&connection) else {
            return;
        };
        endpoint.inbound.retain(|m| m.connection != connection);

        if let (Some(peer), Some(other)) = (link.peer, state.endpoints.get_mut(&link.remote)) {
            let open = other
                .connections
                .get(&peer)
                .is_some_and(|l| !l.state.is_disconnected());
            if open {
                other.transition(peer, ConnectionState::ClosedByPeer, Some(reason as u32));
            }
        }
        let detail = debug.unwrap_or("");
        debug!(connection = %connection, reason = ?reason, detail = detail, "Closed connection");
    }

    fn connection_info(&self, connection: ConnectionHandle) -> Option<ConnectionInfo> {
        self.with_endpoint(|endpoint| {
            endpoint.connections.get(&connection).map(|link| ConnectionInfo {
                remote: link.remote,
                state: link.state,
                end_reason: link.end_reason,
            })
        })
        .flatten()
    }

    fn create_listen_socket(&self) -> Option<ListenSocket> {
        let mut state = self.network.state();
        let socket = ListenSocket(state.next_id());
        let endpoint = state.endpoints.get_mut(&self.identity)?;
        if endpoint.listening.is_some() {
            return None;
        }
        endpoint.listening = Some(socket);
        Some(socket)
    }

    fn close_listen_socket(&self, socket: ListenSocket) {
        self.with_endpoint(|endpoint| {
            if endpoint.listening == Some(socket) {
                endpoint.listening = None;
            }
        });
    }

    fn create_poll_group(&self) -> Option<PollGroup> {
        let mut state = self.network.state();
        let group = PollGroup(state.next_id());
        state.endpoints.get_mut(&self.identity)?.poll_groups.insert(group);
        Some(group)
    }

    fn destroy_poll_group(&self, group: PollGroup) {
        self.with_endpoint(|endpoint| {
            endpoint.poll_groups.remove(&group);
            for link in endpoint.connections.values_mut() {
                if link.poll_group == Some(group) {
                    link.poll_group = None;
                }
            }
        });
    }

    fn set_connection_poll_group(&self, connection: ConnectionHandle, group: PollGroup) -> bool {
        self.with_endpoint(|endpoint| {
            if !endpoint.poll_groups.contains(&group) {
                return false;
            }
            match endpoint.connections.get_mut(&connection) {
                Some(link) => {
                    link.poll_group = Some(group);
                    true
                }
                None => false,
            }
        })
        .unwrap_or(false)
    }

    fn allocate_message(&self, size: usize) -> Option<OutboundMessage> {
        if size == 0 || size > self.network.state().max_message_size {
            return None;
        }
        Some(OutboundMessage::zeroed(size))
    }

    fn send_message(
        &self,
        connection: ConnectionHandle,
        message: OutboundMessage,
        flags: SendFlags,
    ) -> Result<(), TransportError> {
        let mut state = self.network.state();
        if message.len() > state.max_message_size {
            return Err(TransportError::TooLarge(message.len()));
        }

        let endpoint = state
            .endpoints
            .get(&self.identity)
            .ok_or(TransportError::NoConnection(connection))?;
        let link = endpoint
            .connections
            .get(&connection)
            .ok_or(TransportError::NoConnection(connection))?;
        if link.state != ConnectionState::Connected {
            return Err(TransportError::NotOpen(connection));
        }
        let (remote, peer) = match link.peer {
            Some(peer) => (link.remote, peer),
            None => return Err(TransportError::NotOpen(connection)),
        };

        let other = state
            .endpoints
            .get_mut(&remote)
            .ok_or(TransportError::NotOpen(connection))?;
        let peer_open = other
            .connections
            .get(&peer)
            .is_some_and(|l| l.state == ConnectionState::Connected);
        if !peer_open {
            return Err(TransportError::NotOpen(connection));
        }
        other.inbound.push_back(InboundMessage {
            connection: peer,
            flags,
            data: message.into_vec(),
        });
        Ok(())
    }

    fn receive_on_poll_group(&self, group: PollGroup, max: usize) -> Vec<InboundMessage> {
        self.drain_inbound(max, |endpoint, message| {
            endpoint
                .connections
                .get(&message.connection)
                .is_some_and(|l| l.poll_group == Some(group))
        })
    }

    fn receive_on_connection(&self, connection: ConnectionHandle, max: usize) -> Vec<InboundMessage> {
        self.drain_inbound(max, |_, message| message.connection == connection)
    }

    fn poll_status_changes(&self) -> Vec<ConnectionStatusChanged> {
        self.with_endpoint(|endpoint| std::mem::take(&mut endpoint.events))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listening_pair() -> (MemoryTransport, MemoryTransport, ConnectionHandle, ConnectionHandle) {
        let network = MemoryNetwork::new();
        let server = network.endpoint(Identity::game_server(1));
        let client = network.endpoint(Identity::individual(2));
        server.create_listen_socket().unwrap();

        let client_conn = client.connect(server.local_identity()).unwrap();
        let events = server.poll_status_changes();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].new_state, ConnectionState::Connecting);
        assert_eq!(events[0].remote, client.local_identity());
        let server_conn = events[0].connection;
        server.accept(server_conn).unwrap();

        (server, client, server_conn, client_conn)
    }

    #[test]
    fn test_connect_accept_and_send() {
        let (server, client, server_conn, client_conn) = listening_pair();

        let states: Vec<_> = client.poll_status_changes().iter().map(|e| e.new_state).collect();
        assert_eq!(states, vec![ConnectionState::Connecting, ConnectionState::Connected]);

        let group = server.create_poll_group().unwrap();
        assert!(server.set_connection_poll_group(server_conn, group));

        client
            .send_message(client_conn, OutboundMessage::from_vec(vec![1, 2, 3]), SendFlags::RELIABLE)
            .unwrap();
        let received = server.receive_on_poll_group(group, 16);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].connection, server_conn);
        assert_eq!(received[0].data, vec![1, 2, 3]);
    }

    #[test]
    fn test_connect_without_listener_fails_locally() {
        let network = MemoryNetwork::new();
        let client = network.endpoint(Identity::individual(2));

        let conn = client.connect(Identity::game_server(9)).unwrap();
        let events = client.poll_status_changes();
        assert_eq!(events.last().unwrap().new_state, ConnectionState::ProblemDetectedLocally);
        assert!(client
            .send_message(conn, OutboundMessage::zeroed(1), SendFlags::RELIABLE)
            .is_err());

        assert!(client.connect(Identity::NIL).is_none());
    }

    #[test]
    fn test_close_notifies_peer_with_reason() {
        let (server, client, server_conn, _client_conn) = listening_pair();
        client.poll_status_changes();

        server.close_connection(server_conn, DisconnectReason::ServerFull, Some("full"));
        let events = client.poll_status_changes();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].new_state, ConnectionState::ClosedByPeer);
        assert_eq!(events[0].end_reason, Some(DisconnectReason::ServerFull as u32));
        assert!(server.connection_info(server_conn).is_none());
    }

    #[test]
    fn test_sever_drops_both_sides() {
        let network = MemoryNetwork::new();
        let server = network.endpoint(Identity::game_server(1));
        let client = network.endpoint(Identity::individual(2));
        server.create_listen_socket().unwrap();
        client.connect(server.local_identity()).unwrap();
        let server_conn = server.poll_status_changes()[0].connection;
        server.accept(server_conn).unwrap();
        server.poll_status_changes();

        network.sever(client.local_identity());
        let events = server.poll_status_changes();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].old_state, ConnectionState::Connected);
        assert_eq!(events[0].new_state, ConnectionState::ProblemDetectedLocally);
    }

    #[test]
    fn test_allocation_limit() {
        let network = MemoryNetwork::new();
        let transport = network.endpoint(Identity::individual(2));
        network.set_max_message_size(8);
        assert_eq!(transport.allocate_message(8).unwrap().len(), 8);
        assert!(transport.allocate_message(9).is_none());
        assert!(transport.allocate_message(0).is_none());
    }
}
