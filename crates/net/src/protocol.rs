//! Wire message catalog
//!
//! Every message starts with a one-byte discriminant followed by a packed,
//! little-endian fixed part. `Data` and `CreatePlayer` carry a trailing
//! payload whose length is implied by the total message size.

use bytes::{Buf, BufMut, BytesMut, TryGetError};
use relayplay_core::Pid;

/// Fixed width of a short player name, terminator included
pub const SHORT_NAME_LEN: usize = 20;
/// Fixed width of a long player name, terminator included
pub const LONG_NAME_LEN: usize = 52;
/// Fixed width of a session password, terminator included
pub const PASSWORD_LEN: usize = 16;
/// Fixed width of a session name, terminator included
pub const SESSION_NAME_LEN: usize = 32;
/// Capacity of the proof token carried by begin-auth
pub const MAX_TOKEN_LEN: usize = 1024;
/// Size of the generic discriminant header
pub const HEADER_SIZE: usize = 1;

/// Message discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Invalid = 0,
    Data = 1,
    ClientBeginAuth = 2,
    ClientCreatePlayer = 3,
    ClientDestroyPlayer = 4,
    ServerInfo = 5,
    ServerAuthPassed = 6,
    ServerCreatePlayerResponse = 7,
    ServerPlayerCreated = 8,
    ServerPlayerDestroyed = 9,
}

impl MessageKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => MessageKind::Data,
            2 => MessageKind::ClientBeginAuth,
            3 => MessageKind::ClientCreatePlayer,
            4 => MessageKind::ClientDestroyPlayer,
            5 => MessageKind::ServerInfo,
            6 => MessageKind::ServerAuthPassed,
            7 => MessageKind::ServerCreatePlayerResponse,
            8 => MessageKind::ServerPlayerCreated,
            9 => MessageKind::ServerPlayerDestroyed,
            _ => return None,
        })
    }

    /// Size of the fixed part, discriminant included
    pub const fn fixed_size(self) -> usize {
        HEADER_SIZE
            + match self {
                MessageKind::Invalid => 0,
                MessageKind::Data => 4 + 4,
                MessageKind::ClientBeginAuth => PASSWORD_LEN + 4 + MAX_TOKEN_LEN,
                MessageKind::ClientCreatePlayer => SHORT_NAME_LEN + LONG_NAME_LEN + 1 + 1,
                MessageKind::ClientDestroyPlayer => 4,
                MessageKind::ServerInfo => 1 + 1,
                MessageKind::ServerAuthPassed => 0,
                MessageKind::ServerCreatePlayerResponse
                | MessageKind::ServerPlayerCreated => 4 + SHORT_NAME_LEN + LONG_NAME_LEN,
                MessageKind::ServerPlayerDestroyed => 4,
            }
    }
}

/// Receive-side validation failures. Always logged and dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("message of {len} bytes is shorter than the header")]
    TooShort { len: usize },

    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    #[error("{kind:?} message was {len} bytes, expected at least {expected}")]
    Truncated {
        kind: MessageKind,
        len: usize,
        expected: usize,
    },

    #[error("malformed {kind:?} message: {reason}")]
    Malformed {
        kind: MessageKind,
        reason: &'static str,
    },
}

/// A decoded wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Application data, relayed by the server
    Data { from: Pid, to: Pid, payload: Vec<u8> },

    /// Client answers the server info with credentials
    BeginAuth { password: String, token: Vec<u8> },

    /// Client asks for a new player
    CreatePlayer {
        short_name: String,
        long_name: String,
        server_player: bool,
        spectator: bool,
        payload: Vec<u8>,
    },

    /// Client destroys one of its players, or all of them with `ALL_PLAYERS`
    DestroyPlayer { pid: Pid },

    /// Server declares what the connecting client must present
    Info { auth: bool, password: bool },

    /// Server accepted the client's credentials
    AuthPassed,

    /// Server answers a create request, `pid` is `UNKNOWN` on failure
    CreatePlayerResponse {
        pid: Pid,
        short_name: String,
        long_name: String,
    },

    /// Another client created a player
    PlayerCreated {
        pid: Pid,
        short_name: String,
        long_name: String,
    },

    /// Another client's player went away
    PlayerDestroyed { pid: Pid },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Data { .. } => MessageKind::Data,
            Message::BeginAuth { .. } => MessageKind::ClientBeginAuth,
            Message::CreatePlayer { .. } => MessageKind::ClientCreatePlayer,
            Message::DestroyPlayer { .. } => MessageKind::ClientDestroyPlayer,
            Message::Info { .. } => MessageKind::ServerInfo,
            Message::AuthPassed => MessageKind::ServerAuthPassed,
            Message::CreatePlayerResponse { .. } => MessageKind::ServerCreatePlayerResponse,
            Message::PlayerCreated { .. } => MessageKind::ServerPlayerCreated,
            Message::PlayerDestroyed { .. } => MessageKind::ServerPlayerDestroyed,
        }
    }

    /// Length of the trailing variable part
    pub fn payload_len(&self) -> usize {
        match self {
            Message::Data { payload, .. } | Message::CreatePlayer { payload, .. } => payload.len(),
            _ => 0,
        }
    }

    /// Exact number of bytes this message occupies on the wire
    pub fn wire_size(&self) -> usize {
        self.kind().fixed_size() + self.payload_len()
    }

    /// Serialize into `buf`, which must be exactly [`Message::wire_size`] long
    pub fn write_to(&self, mut buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), self.wire_size());
        self.encode(&mut buf);
    }

    /// Serialize into a fresh buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.wire_size());
        self.encode(&mut buf);
        buf.to_vec()
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind() as u8);
        match self {
            Message::Data { from, to, payload } => {
                buf.put_u32_le(from.raw());
                buf.put_u32_le(to.raw());
                buf.put_slice(payload);
            }
            Message::BeginAuth { password, token } => {
                put_str(buf, password, PASSWORD_LEN);
                let len = token.len().min(MAX_TOKEN_LEN);
                buf.put_u32_le(len as u32);
                put_padded(buf, &token[..len], MAX_TOKEN_LEN);
            }
            Message::CreatePlayer {
                short_name,
                long_name,
                server_player,
                spectator,
                payload,
            } => {
                put_str(buf, short_name, SHORT_NAME_LEN);
                put_str(buf, long_name, LONG_NAME_LEN);
                buf.put_u8(u8::from(*server_player));
                buf.put_u8(u8::from(*spectator));
                buf.put_slice(payload);
            }
            Message::DestroyPlayer { pid } | Message::PlayerDestroyed { pid } => {
                buf.put_u32_le(pid.raw());
            }
            Message::Info { auth, password } => {
                buf.put_u8(u8::from(*auth));
                buf.put_u8(u8::from(*password));
            }
            Message::AuthPassed => {}
            Message::CreatePlayerResponse {
                pid,
                short_name,
                long_name,
            }
            | Message::PlayerCreated {
                pid,
                short_name,
                long_name,
            } => {
                buf.put_u32_le(pid.raw());
                put_str(buf, short_name, SHORT_NAME_LEN);
                put_str(buf, long_name, LONG_NAME_LEN);
            }
        }
    }

    /// Validate and decode a received buffer.
    ///
    /// Checks, in order: the buffer holds the discriminant, the discriminant
    /// is known, and the buffer holds that kind's fixed part.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = bytes;
        let raw = buf
            .try_get_u8()
            .map_err(|_| ProtocolError::TooShort { len: bytes.len() })?;
        let kind = match MessageKind::from_u8(raw) {
            Some(kind) => kind,
            None => return Err(ProtocolError::UnknownKind(raw)),
        };
        let expected = kind.fixed_size();
        let truncated = |_: TryGetError| ProtocolError::Truncated {
            kind,
            len: bytes.len(),
            expected,
        };
        if bytes.len() < expected {
            return Err(truncated(TryGetError {
                requested: expected - HEADER_SIZE,
                available: buf.remaining(),
            }));
        }

        let message = match kind {
            MessageKind::Invalid => return Err(ProtocolError::UnknownKind(raw)),
            MessageKind::Data => Message::Data {
                from: Pid(buf.try_get_u32_le().map_err(truncated)?),
                to: Pid(buf.try_get_u32_le().map_err(truncated)?),
                payload: buf.to_vec(),
            },
            MessageKind::ClientBeginAuth => {
                let password = get_str(&mut buf, PASSWORD_LEN).map_err(truncated)?;
                let len = buf.try_get_u32_le().map_err(truncated)? as usize;
                if len > MAX_TOKEN_LEN {
                    return Err(ProtocolError::Malformed {
                        kind,
                        reason: "token length exceeds capacity",
                    });
                }
                let token = get_field(&mut buf, MAX_TOKEN_LEN).map_err(truncated)?[..len].to_vec();
                Message::BeginAuth { password, token }
            }
            MessageKind::ClientCreatePlayer => Message::CreatePlayer {
                short_name: get_str(&mut buf, SHORT_NAME_LEN).map_err(truncated)?,
                long_name: get_str(&mut buf, LONG_NAME_LEN).map_err(truncated)?,
                server_player: buf.try_get_u8().map_err(truncated)? != 0,
                spectator: buf.try_get_u8().map_err(truncated)? != 0,
                payload: buf.to_vec(),
            },
            MessageKind::ClientDestroyPlayer => Message::DestroyPlayer {
                pid: Pid(buf.try_get_u32_le().map_err(truncated)?),
            },
            MessageKind::ServerInfo => Message::Info {
                auth: buf.try_get_u8().map_err(truncated)? != 0,
                password: buf.try_get_u8().map_err(truncated)? != 0,
            },
            MessageKind::ServerAuthPassed => Message::AuthPassed,
            MessageKind::ServerCreatePlayerResponse => Message::CreatePlayerResponse {
                pid: Pid(buf.try_get_u32_le().map_err(truncated)?),
                short_name: get_str(&mut buf, SHORT_NAME_LEN).map_err(truncated)?,
                long_name: get_str(&mut buf, LONG_NAME_LEN).map_err(truncated)?,
            },
            MessageKind::ServerPlayerCreated => Message::PlayerCreated {
                pid: Pid(buf.try_get_u32_le().map_err(truncated)?),
                short_name: get_str(&mut buf, SHORT_NAME_LEN).map_err(truncated)?,
                long_name: get_str(&mut buf, LONG_NAME_LEN).map_err(truncated)?,
            },
            MessageKind::ServerPlayerDestroyed => Message::PlayerDestroyed {
                pid: Pid(buf.try_get_u32_le().map_err(truncated)?),
            },
        };
        Ok(message)
    }
}

/// Truncate `s` so it fits a fixed field of `width` bytes with a terminator
pub fn truncate_fixed(s: &str, width: usize) -> &str {
    let max = width.saturating_sub(1);
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn put_padded(buf: &mut impl BufMut, bytes: &[u8], width: usize) {
    buf.put_slice(bytes);
    buf.put_bytes(0, width - bytes.len());
}

fn put_str(buf: &mut impl BufMut, s: &str, width: usize) {
    put_padded(buf, truncate_fixed(s, width).as_bytes(), width);
}

/// Split the next `width` bytes off the front of `buf`
fn get_field<'a>(buf: &mut &'a [u8], width: usize) -> Result<&'a [u8], TryGetError> {
    if buf.remaining() < width {
        return Err(TryGetError {
            requested: width,
            available: buf.remaining(),
        });
    }
    let (field, rest) = buf.split_at(width);
    *buf = rest;
    Ok(field)
}

/// Read a NUL-padded fixed-width string field
fn get_str(buf: &mut &[u8], width: usize) -> Result<String, TryGetError> {
    let field = get_field(buf, width)?;
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    Ok(String::from_utf8_lossy(&field[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_sizes() {
        assert_eq!(MessageKind::Data.fixed_size(), 9);
        assert_eq!(MessageKind::ClientBeginAuth.fixed_size(), 1045);
        assert_eq!(MessageKind::ClientCreatePlayer.fixed_size(), 75);
        assert_eq!(MessageKind::ClientDestroyPlayer.fixed_size(), 5);
        assert_eq!(MessageKind::ServerInfo.fixed_size(), 3);
        assert_eq!(MessageKind::ServerAuthPassed.fixed_size(), 1);
        assert_eq!(MessageKind::ServerCreatePlayerResponse.fixed_size(), 77);
        assert_eq!(MessageKind::ServerPlayerCreated.fixed_size(), 77);
        assert_eq!(MessageKind::ServerPlayerDestroyed.fixed_size(), 5);
    }

    #[test]
    fn test_data_layout() {
        let msg = Message::Data {
            from: Pid(0x1234_5678),
            to: Pid::ALL_PLAYERS,
            payload: vec![0xaa, 0xbb],
        };
        let bytes = msg.to_bytes();
        assert_eq!(bytes, vec![1, 0x78, 0x56, 0x34, 0x12, 0, 0, 0, 0, 0xaa, 0xbb]);
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_empty_and_unknown_rejected() {
        assert_eq!(Message::decode(&[]), Err(ProtocolError::TooShort { len: 0 }));
        assert_eq!(Message::decode(&[0]), Err(ProtocolError::UnknownKind(0)));
        assert_eq!(Message::decode(&[200, 1, 2]), Err(ProtocolError::UnknownKind(200)));
    }

    #[test]
    fn test_truncated_fixed_part_rejected() {
        let bytes = Message::CreatePlayerResponse {
            pid: Pid(500),
            short_name: "a".into(),
            long_name: "b".into(),
        }
        .to_bytes();

        let err = Message::decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Truncated {
                kind: MessageKind::ServerCreatePlayerResponse,
                len: 76,
                expected: 77,
            }
        );
    }

    #[test]
    fn test_names_truncated_to_field_width() {
        let long = "x".repeat(100);
        let bytes = Message::PlayerCreated {
            pid: Pid(777),
            short_name: long.clone(),
            long_name: long,
        }
        .to_bytes();

        match Message::decode(&bytes).unwrap() {
            Message::PlayerCreated {
                short_name,
                long_name,
                ..
            } => {
                assert_eq!(short_name.len(), SHORT_NAME_LEN - 1);
                assert_eq!(long_name.len(), LONG_NAME_LEN - 1);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let s = "ééééééééééé"; // 22 bytes
        let cut = truncate_fixed(s, SHORT_NAME_LEN);
        assert!(cut.len() <= SHORT_NAME_LEN - 1);
        assert!(s.starts_with(cut));
    }

    #[test]
    fn test_begin_auth_token_bounds() {
        let msg = Message::BeginAuth {
            password: "secret".into(),
            token: vec![7; 40],
        };
        let mut bytes = msg.to_bytes();
        assert_eq!(bytes.len(), 1045);
        assert_eq!(Message::decode(&bytes).unwrap(), msg);

        // Declared token length larger than the field
        let at = HEADER_SIZE + PASSWORD_LEN;
        bytes[at..at + 4].copy_from_slice(&2000u32.to_le_bytes());
        assert!(matches!(
            Message::decode(&bytes),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn test_create_player_payload_follows_fixed_part() {
        let msg = Message::CreatePlayer {
            short_name: "P1".into(),
            long_name: "Player One".into(),
            server_player: false,
            spectator: true,
            payload: b"hello".to_vec(),
        };
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), 75 + 5);
        assert_eq!(&bytes[75..], b"hello");
    }

    #[test]
    fn test_encode_appends_to_buffer() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xff);
        Message::PlayerDestroyed { pid: Pid(0x0102_0304) }.encode(&mut buf);
        assert_eq!(&buf[..], &[0xff, 9, 4, 3, 2, 1]);

        let mut fixed = [0u8; 5];
        Message::DestroyPlayer { pid: Pid(300) }.write_to(&mut fixed);
        assert_eq!(Message::decode(&fixed), Ok(Message::DestroyPlayer { pid: Pid(300) }));
    }
}
