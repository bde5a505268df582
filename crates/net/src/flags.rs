//! Legacy API flag words
//!
//! Values match the constants the legacy session API hands to the provider.

use bitflags::bitflags;

bitflags! {
    /// How `receive` selects a queued message
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ReceiveFlags: u32 {
        const ALL = 0x0001;
        const TO_PLAYER = 0x0002;
        const FROM_PLAYER = 0x0004;
        const PEEK = 0x0008;
    }
}

bitflags! {
    /// Delivery options of `send`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SendOptions: u32 {
        const GUARANTEED = 0x0001;
        const SIGNED = 0x0020;
        const ENCRYPTED = 0x0040;
        const LOBBY_SYSTEM_MESSAGE = 0x0080;
        const ASYNC = 0x0200;
        const NO_SEND_COMPLETE_MSG = 0x0400;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpenFlags: u32 {
        const JOIN = 0x0001;
        const CREATE = 0x0002;
        const RETURN_STATUS = 0x0080;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PlayerFlags: u32 {
        const SPECTATOR = 0x0001;
        const SERVER_PLAYER = 0x0100;
    }
}

bitflags! {
    /// Session descriptor flags reported by session enumeration
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SessionFlags: u32 {
        const PASSWORD_REQUIRED = 0x0040;
        const SECURE_SERVER = 0x0200;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_and_intersects() {
        let flags = SendOptions::GUARANTEED | SendOptions::NO_SEND_COMPLETE_MSG;
        assert!(flags.contains(SendOptions::GUARANTEED));
        assert!(!flags.contains(SendOptions::GUARANTEED | SendOptions::ASYNC));
        assert!(flags.intersects(SendOptions::ASYNC | SendOptions::GUARANTEED));
        assert!(!flags.intersects(SendOptions::SIGNED | SendOptions::ENCRYPTED));
        assert_eq!(flags.bits(), 0x0401);
    }

    #[test]
    fn test_legacy_words_keep_unknown_bits() {
        // callers may pass bits this provider has no name for
        let open = OpenFlags::from_bits_retain(0x0002 | 0x1000);
        assert!(open.contains(OpenFlags::CREATE));
        assert!(!open.contains(OpenFlags::JOIN));
        assert_eq!(open.bits(), 0x1002);
        assert_eq!(SessionFlags::default(), SessionFlags::empty());
    }
}
