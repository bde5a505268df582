//! Player identifiers and the collision-free allocator
//!
//! A [`Pid`] names a participant for the lifetime of a session. The low band
//! `0..=RESERVED_RANGE` is never handed to real players and carries the
//! sentinels below.

use std::collections::HashMap;
use std::fmt;

use rand::Rng;

/// Default number of draws before the allocator gives up
pub const DEFAULT_ALLOCATION_ATTEMPTS: usize = 1000;

/// Transient participant identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Pid(pub u32);

impl Pid {
    /// Sender of synthesized system notifications
    pub const SYSTEM_MESSAGE: Pid = Pid(0);
    /// Broadcast recipient. Shares its value with [`Pid::SYSTEM_MESSAGE`];
    /// the position (sender vs recipient) disambiguates.
    pub const ALL_PLAYERS: Pid = Pid(0);
    /// The server's own player
    pub const SERVER_PLAYER: Pid = Pid(1);
    /// Upper bound (inclusive) of the reserved band
    pub const RESERVED_RANGE: Pid = Pid(100);
    /// Unknown / invalid player, also the allocation failure sentinel
    pub const UNKNOWN: Pid = Pid(u32::MAX);

    pub fn raw(self) -> u32 {
        self.0
    }

    /// True for identifiers in the allocatable range
    pub fn is_player(self) -> bool {
        self > Self::RESERVED_RANGE && self < Self::UNKNOWN
    }

    pub fn is_unknown(self) -> bool {
        self == Self::UNKNOWN
    }

    /// A sender is either a real player or the system sentinel
    pub fn is_valid_sender(self) -> bool {
        self.is_player() || self == Self::SYSTEM_MESSAGE
    }

    /// A recipient is a real player, the server player or the broadcast sentinel
    pub fn is_valid_recipient(self) -> bool {
        self.is_player() || self == Self::SERVER_PLAYER || self == Self::ALL_PLAYERS
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Pid {
    fn from(raw: u32) -> Self {
        Pid(raw)
    }
}

impl From<Pid> for u32 {
    fn from(pid: Pid) -> Self {
        pid.0
    }
}

/// Draws random identifiers outside the reserved band
#[derive(Debug, Clone, Copy)]
pub struct PidAllocator {
    attempts: usize,
}

impl Default for PidAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOCATION_ATTEMPTS)
    }
}

impl PidAllocator {
    pub fn new(attempts: usize) -> Self {
        Self { attempts }
    }

    /// Allocate an identifier not present in `directory`.
    ///
    /// Returns [`Pid::UNKNOWN`] when every attempt collided.
    pub fn allocate<V>(&self, directory: &HashMap<Pid, V>) -> Pid {
        self.allocate_with(&mut rand::thread_rng(), directory)
    }

    /// Same as [`PidAllocator::allocate`] with a caller-supplied random source
    pub fn allocate_with<R: Rng + ?Sized, V>(&self, rng: &mut R, directory: &HashMap<Pid, V>) -> Pid {
        for _ in 0..self.attempts {
            let candidate = Pid(rng.gen_range(Pid::RESERVED_RANGE.0 + 1..Pid::UNKNOWN.0));
            if !directory.contains_key(&candidate) {
                return candidate;
            }
        }
        tracing::warn!(attempts = self.attempts, "PID allocation exhausted");
        Pid::UNKNOWN
    }
}
