//! Transport identities
//!
//! Every transport endpoint is named by a 64-bit identity. The top byte
//! carries the account kind so a bare decimal string is enough to tell a
//! lobby from a game server.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::{Error, Result};

const KIND_SHIFT: u32 = 56;
const ACCOUNT_MASK: u64 = (1 << KIND_SHIFT) - 1;

/// Trailing bytes marking a session instance GUID that carries an identity
const INSTANCE_MARKER: [u8; 8] = *b"RELAYID\0";

/// Account kind encoded in an [`Identity`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IdentityKind {
    Invalid = 0,
    Individual = 1,
    GameServer = 3,
    Lobby = 7,
}

impl IdentityKind {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => IdentityKind::Individual,
            3 => IdentityKind::GameServer,
            7 => IdentityKind::Lobby,
            _ => IdentityKind::Invalid,
        }
    }
}

/// Opaque endpoint identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Identity(u64);

impl Identity {
    pub const NIL: Identity = Identity(0);

    pub fn new(kind: IdentityKind, account: u64) -> Self {
        Identity(((kind as u64) << KIND_SHIFT) | (account & ACCOUNT_MASK))
    }

    pub fn individual(account: u64) -> Self {
        Self::new(IdentityKind::Individual, account)
    }

    pub fn game_server(account: u64) -> Self {
        Self::new(IdentityKind::GameServer, account)
    }

    pub fn lobby(account: u64) -> Self {
        Self::new(IdentityKind::Lobby, account)
    }

    pub fn from_raw(raw: u64) -> Self {
        Identity(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn kind(self) -> IdentityKind {
        IdentityKind::from_raw((self.0 >> KIND_SHIFT) as u8)
    }

    pub fn account(self) -> u64 {
        self.0 & ACCOUNT_MASK
    }

    pub fn is_valid(self) -> bool {
        self.kind() != IdentityKind::Invalid && self.account() != 0
    }

    pub fn is_lobby(self) -> bool {
        self.is_valid() && self.kind() == IdentityKind::Lobby
    }

    pub fn is_game_server(self) -> bool {
        self.is_valid() && self.kind() == IdentityKind::GameServer
    }

    /// Session instance GUID carrying this identity
    pub fn to_instance(self) -> Uuid {
        Uuid::from_fields(
            (self.0 >> 32) as u32,
            (self.0 >> 16) as u16,
            self.0 as u16,
            &INSTANCE_MARKER,
        )
    }

    /// Inverse of [`Identity::to_instance`]; [`Identity::NIL`] for GUIDs
    /// that do not carry an identity
    pub fn from_instance(guid: Uuid) -> Self {
        let (d1, d2, d3, d4) = guid.as_fields();
        if *d4 != INSTANCE_MARKER {
            return Identity::NIL;
        }
        Identity(((d1 as u64) << 32) | ((d2 as u64) << 16) | d3 as u64)
    }

    /// Lenient parse used for address strings: anything that is not a
    /// decimal number yields [`Identity::NIL`]
    pub fn parse_lossy(s: &str) -> Self {
        s.trim().parse().unwrap_or(Identity::NIL)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u64>()
            .map(Identity)
            .map_err(|_| Error::InvalidIdentity(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        let server = Identity::game_server(42);
        assert_eq!(server.kind(), IdentityKind::GameServer);
        assert_eq!(server.account(), 42);
        assert!(server.is_game_server());
        assert!(!server.is_lobby());

        let parsed: Identity = server.to_string().parse().unwrap();
        assert_eq!(parsed, server);
    }

    #[test]
    fn test_instance_guid() {
        let lobby = Identity::lobby(0x1234_5678_9abc);
        let guid = lobby.to_instance();
        assert_eq!(Identity::from_instance(guid), lobby);
        assert_eq!(Identity::from_instance(Uuid::new_v4()), Identity::NIL);
    }

    #[test]
    fn test_invalid_identities() {
        assert!(!Identity::NIL.is_valid());
        assert!(!Identity::individual(0).is_valid());
        assert!(!Identity::from_raw(5).is_valid());
        assert_eq!(Identity::parse_lossy("not-a-number"), Identity::NIL);
        assert!("abc".parse::<Identity>().is_err());
    }
}
