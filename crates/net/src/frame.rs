//! Message framing over a [`Transport`]
//!
//! Sends always ask the transport for a buffer of exactly the message's
//! wire size; allocation or send failures are reported, never fatal.

use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::protocol::Message;
use crate::transport::{ConnectionHandle, InboundMessage, OutboundMessage, SendFlags, Transport};

/// Which side of the session a sender logs for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// Allocate/populate/send helper bound to one transport
pub struct MessageSender<'a> {
    transport: &'a dyn Transport,
    side: Side,
}

impl<'a> MessageSender<'a> {
    pub fn new(transport: &'a dyn Transport, side: Side) -> Self {
        Self { transport, side }
    }

    /// Allocate a buffer of exactly `size` bytes
    pub fn allocate(&self, size: usize) -> Result<OutboundMessage> {
        match self.transport.allocate_message(size) {
            Some(message) => {
                debug_assert_eq!(message.len(), size);
                Ok(message)
            }
            None => {
                error!(side = ?self.side, size, "Failed to allocate message");
                Err(Error::AllocationFailed { size })
            }
        }
    }

    /// Frame and send `message`
    pub fn try_send(&self, connection: ConnectionHandle, flags: SendFlags, message: &Message) -> Result<()> {
        let mut buf = self.allocate(message.wire_size())?;
        message.write_to(buf.as_mut_slice());
        self.send_raw(connection, flags, buf)
    }

    /// Like [`MessageSender::try_send`], for fire-and-forget notifications
    pub fn send(&self, connection: ConnectionHandle, flags: SendFlags, message: &Message) -> bool {
        self.try_send(connection, flags, message).is_ok()
    }

    /// Send a copy of an already framed inbound message, keeping its flags
    pub fn relay(&self, connection: ConnectionHandle, inbound: &InboundMessage) -> bool {
        let Ok(mut buf) = self.allocate(inbound.data.len()) else {
            return false;
        };
        buf.as_mut_slice().copy_from_slice(&inbound.data);
        self.send_raw(connection, inbound.flags, buf).is_ok()
    }

    pub fn send_raw(&self, connection: ConnectionHandle, flags: SendFlags, buf: OutboundMessage) -> Result<()> {
        self.transport.send_message(connection, buf, flags).map_err(|e| {
            debug!(side = ?self.side, connection = %connection, error = %e, "Failed to send message");
            Error::SendFailed(e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use relayplay_core::{Identity, Pid};

    #[test]
    fn test_send_and_relay() {
        let network = MemoryNetwork::new();
        let server = network.endpoint(Identity::game_server(1));
        let client = network.endpoint(Identity::individual(2));
        server.create_listen_socket().unwrap();
        let client_conn = client.connect(server.local_identity()).unwrap();
        let server_conn = server.poll_status_changes()[0].connection;
        server.accept(server_conn).unwrap();

        let message = Message::Data {
            from: Pid(200),
            to: Pid::ALL_PLAYERS,
            payload: vec![1, 2, 3],
        };
        let sender = MessageSender::new(&client, Side::Client);
        sender.try_send(client_conn, SendFlags::UNRELIABLE, &message).unwrap();

        let inbound = server.receive_on_connection(server_conn, 8).remove(0);
        assert_eq!(inbound.data.len(), message.wire_size());
        assert_eq!(inbound.flags, SendFlags::UNRELIABLE);

        assert!(MessageSender::new(&server, Side::Server).relay(server_conn, &inbound));
        let echoed = client.receive_on_connection(client_conn, 8).remove(0);
        assert_eq!(Message::decode(&echoed.data).unwrap(), message);
        assert_eq!(echoed.flags, SendFlags::UNRELIABLE);
    }

    #[test]
    fn test_allocation_failure_sends_nothing() {
        let network = MemoryNetwork::new();
        let server = network.endpoint(Identity::game_server(1));
        let client = network.endpoint(Identity::individual(2));
        server.create_listen_socket().unwrap();
        let client_conn = client.connect(server.local_identity()).unwrap();
        let server_conn = server.poll_status_changes()[0].connection;
        server.accept(server_conn).unwrap();
        network.set_max_message_size(4);

        let message = Message::Data {
            from: Pid(200),
            to: Pid(300),
            payload: vec![0; 16],
        };
        let result = MessageSender::new(&client, Side::Client).try_send(client_conn, SendFlags::RELIABLE, &message);
        assert!(matches!(result, Err(Error::AllocationFailed { size: 25 })));
        assert!(server.receive_on_connection(server_conn, 8).is_empty());
    }
}
