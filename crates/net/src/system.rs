//! Synthesized system notifications
//!
//! Membership changes reach the session API consumer as system messages
//! (sender [`Pid::SYSTEM_MESSAGE`]) laid out the way legacy consumers parse
//! them: little-endian `u32` fields followed by NUL-terminated UTF-16 names.

use bytes::{Buf, BufMut, BytesMut};
use relayplay_core::Pid;

pub const CREATE_PLAYER_OR_GROUP: u32 = 0x0003;
pub const DESTROY_PLAYER_OR_GROUP: u32 = 0x0005;
pub const SESSION_LOST: u32 = 0x0031;

pub const PLAYER_TYPE_PLAYER: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemMessage {
    PlayerCreated {
        pid: Pid,
        current_players: u32,
        short_name: String,
        long_name: String,
    },
    PlayerDestroyed {
        pid: Pid,
        short_name: String,
        long_name: String,
    },
    SessionLost,
}

impl SystemMessage {
    pub fn kind(&self) -> u32 {
        match self {
            SystemMessage::PlayerCreated { .. } => CREATE_PLAYER_OR_GROUP,
            SystemMessage::PlayerDestroyed { .. } => DESTROY_PLAYER_OR_GROUP,
            SystemMessage::SessionLost => SESSION_LOST,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = BytesMut::new();
        out.put_u32_le(self.kind());
        match self {
            SystemMessage::PlayerCreated {
                pid,
                current_players,
                short_name,
                long_name,
            } => {
                out.put_u32_le(PLAYER_TYPE_PLAYER);
                out.put_u32_le(pid.raw());
                out.put_u32_le(*current_players);
                put_wide(&mut out, short_name);
                put_wide(&mut out, long_name);
            }
            SystemMessage::PlayerDestroyed {
                pid,
                short_name,
                long_name,
            } => {
                out.put_u32_le(PLAYER_TYPE_PLAYER);
                out.put_u32_le(pid.raw());
                put_wide(&mut out, short_name);
                put_wide(&mut out, long_name);
            }
            SystemMessage::SessionLost => {}
        }
        out.to_vec()
    }

    /// Parse bytes produced by [`SystemMessage::to_bytes`]
    pub fn parse(mut bytes: &[u8]) -> Option<Self> {
        match bytes.try_get_u32_le().ok()? {
            CREATE_PLAYER_OR_GROUP => {
                bytes.try_get_u32_le().ok()?;
                let pid = Pid(bytes.try_get_u32_le().ok()?);
                let current_players = bytes.try_get_u32_le().ok()?;
                Some(SystemMessage::PlayerCreated {
                    pid,
                    current_players,
                    short_name: get_wide(&mut bytes)?,
                    long_name: get_wide(&mut bytes)?,
                })
            }
            DESTROY_PLAYER_OR_GROUP => {
                bytes.try_get_u32_le().ok()?;
                let pid = Pid(bytes.try_get_u32_le().ok()?);
                Some(SystemMessage::PlayerDestroyed {
                    pid,
                    short_name: get_wide(&mut bytes)?,
                    long_name: get_wide(&mut bytes)?,
                })
            }
            SESSION_LOST => Some(SystemMessage::SessionLost),
            _ => None,
        }
    }
}

fn put_wide(out: &mut impl BufMut, s: &str) {
    for unit in s.encode_utf16().chain(std::iter::once(0)) {
        out.put_u16_le(unit);
    }
}

/// Read UTF-16 units up to and including the terminator
fn get_wide(buf: &mut impl Buf) -> Option<String> {
    let mut units = Vec::new();
    loop {
        match buf.try_get_u16_le().ok()? {
            0 => break,
            unit => units.push(unit),
        }
    }
    String::from_utf16(&units).ok()
}
