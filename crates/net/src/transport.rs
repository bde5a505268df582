//! Transport backend boundary
//!
//! The session engine only sees opaque connection handles and raw byte
//! messages. Implementations wrap a relayed peer-to-peer networking
//! library; [`crate::memory::MemoryNetwork`] provides an in-process one.

use std::fmt;

use relayplay_core::Identity;

/// Handle of one connection, local to the endpoint that owns it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u32);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Listening endpoint handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenSocket(pub u32);

/// Group of connections drained with a single receive call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollGroup(pub u32);

/// Transport-level connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    None,
    Connecting,
    Connected,
    ClosedByPeer,
    ProblemDetectedLocally,
}

impl ConnectionState {
    /// States in which the connection can no longer carry messages
    pub fn is_disconnected(self) -> bool {
        matches!(
            self,
            ConnectionState::None
                | ConnectionState::ClosedByPeer
                | ConnectionState::ProblemDetectedLocally
        )
    }
}

/// Application-level reason codes passed when closing a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisconnectReason {
    ClientDisconnect = 1001,
    ServerClosed = 1002,
    ServerReject = 1003,
    ServerFull = 1004,
    ClientKicked = 1005,
    /// Transport-side failure, not an application decision
    Generic = 2000,
}

/// Delivery options for one send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendFlags {
    pub reliable: bool,
    /// Flush on the calling thread instead of queueing
    pub same_thread: bool,
}

impl SendFlags {
    pub const RELIABLE: SendFlags = SendFlags {
        reliable: true,
        same_thread: false,
    };
    pub const UNRELIABLE: SendFlags = SendFlags {
        reliable: false,
        same_thread: false,
    };
}

/// Buffer obtained from [`Transport::allocate_message`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    data: Vec<u8>,
}

impl OutboundMessage {
    pub fn zeroed(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

/// A message received on a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub connection: ConnectionHandle,
    pub flags: SendFlags,
    pub data: Vec<u8>,
}

/// Details of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub remote: Identity,
    pub state: ConnectionState,
    pub end_reason: Option<u32>,
}

/// Asynchronous connection state notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatusChanged {
    pub connection: ConnectionHandle,
    pub old_state: ConnectionState,
    pub new_state: ConnectionState,
    pub remote: Identity,
    pub end_reason: Option<u32>,
}

/// Transport failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("unknown connection {0}")]
    NoConnection(ConnectionHandle),

    #[error("connection {0} is not open")]
    NotOpen(ConnectionHandle),

    #[error("message of {0} bytes exceeds the transport limit")]
    TooLarge(usize),

    #[error("{0}")]
    Other(String),
}

/// Relayed peer-to-peer transport as seen by one endpoint.
///
/// Handles are only meaningful to the endpoint that produced them.
/// Implementations use interior mutability so one transport can be shared
/// between the caller and the server tick task.
pub trait Transport: Send + Sync {
    /// Identity other endpoints use to reach this one
    fn local_identity(&self) -> Identity;

    /// Open a connection to `remote`. `None` if no connection object could
    /// be created.
    fn connect(&self, remote: Identity) -> Option<ConnectionHandle>;

    /// Accept an incoming connection reported in state `Connecting`
    fn accept(&self, connection: ConnectionHandle) -> Result<(), TransportError>;

    /// Close a connection, telling the peer why
    fn close_connection(&self, connection: ConnectionHandle, reason: DisconnectReason, debug: Option<&str>);

    fn connection_info(&self, connection: ConnectionHandle) -> Option<ConnectionInfo>;

    fn create_listen_socket(&self) -> Option<ListenSocket>;

    fn close_listen_socket(&self, socket: ListenSocket);

    fn create_poll_group(&self) -> Option<PollGroup>;

    fn destroy_poll_group(&self, group: PollGroup);

    fn set_connection_poll_group(&self, connection: ConnectionHandle, group: PollGroup) -> bool;

    /// Obtain a zeroed buffer of exactly `size` bytes
    fn allocate_message(&self, size: usize) -> Option<OutboundMessage>;

    fn send_message(
        &self,
        connection: ConnectionHandle,
        message: OutboundMessage,
        flags: SendFlags,
    ) -> Result<(), TransportError>;

    /// Drain up to `max` messages from every connection in `group`
    fn receive_on_poll_group(&self, group: PollGroup, max: usize) -> Vec<InboundMessage>;

    /// Drain up to `max` messages from one connection
    fn receive_on_connection(&self, connection: ConnectionHandle, max: usize) -> Vec<InboundMessage>;

    /// Drain pending connection state notifications
    fn poll_status_changes(&self) -> Vec<ConnectionStatusChanged>;
}
