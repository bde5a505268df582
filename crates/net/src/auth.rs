//! Identity and authentication backends
//!
//! The server side logs on to an identity service, publishes its details and
//! validates proof tokens presented by clients. The client side obtains those
//! tokens and advertises the game it is in. [`MemoryIdentityService`] is an
//! in-process implementation of both.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::RngCore;
use relayplay_core::Identity;
use tracing::debug;

use crate::protocol::MAX_TOKEN_LEN;

/// Details a server publishes once logged on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerDetails {
    pub name: String,
    pub max_players: u32,
    pub password_protected: bool,
    pub product: String,
    pub description: String,
}

/// Notifications from the identity service to a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityEvent {
    LoggedOn,
    LogOnFailed(String),
    LoggedOff,
    /// Result of a proof session started with [`IdentityBackend::begin_proof_session`]
    ProofValidated { remote: Identity, ok: bool },
}

/// Server-side identity service
pub trait IdentityBackend: Send + Sync {
    /// Start logging on; completion arrives as [`IdentityEvent::LoggedOn`]
    fn log_on(&self) -> bool;

    fn log_off(&self);

    fn set_server_details(&self, details: &ServerDetails);

    /// Start validating `token` for `remote`. `false` rejects immediately,
    /// otherwise the verdict arrives as [`IdentityEvent::ProofValidated`].
    fn begin_proof_session(&self, token: &[u8], remote: Identity) -> bool;

    fn end_proof_session(&self, remote: Identity);

    fn poll_events(&self) -> Vec<IdentityEvent>;
}

/// A proof token and the handle used to cancel it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofTicket {
    pub handle: u32,
    pub token: Vec<u8>,
}

/// Client-side account of the local user
pub trait LocalUser: Send + Sync {
    fn identity(&self) -> Identity;

    /// Token proving this user's identity to a server
    fn proof_token(&self) -> Option<ProofTicket>;

    fn cancel_proof_token(&self, handle: u32);

    /// Tell friends which server the user is playing on, `None` clears it
    fn advertise_game(&self, server: Option<Identity>);
}

#[derive(Default)]
struct ServiceState {
    next_ticket: u32,
    tickets: HashMap<Vec<u8>, (u32, Identity)>,
    sessions: HashSet<(Identity, Identity)>,
    events: HashMap<Identity, Vec<IdentityEvent>>,
    details: HashMap<Identity, ServerDetails>,
    logged_on: HashSet<Identity>,
    advertised: HashMap<Identity, Identity>,
    refuse_log_on: bool,
}

/// In-process identity service
#[derive(Clone, Default)]
pub struct MemoryIdentityService {
    inner: Arc<Mutex<ServiceState>>,
}

impl MemoryIdentityService {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ServiceState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn server(&self, identity: Identity) -> MemoryServerAccount {
        MemoryServerAccount {
            service: self.clone(),
            identity,
        }
    }

    pub fn user(&self, identity: Identity) -> MemoryUser {
        MemoryUser {
            service: self.clone(),
            identity,
        }
    }

    /// Make subsequent log-ons fail
    pub fn refuse_log_on(&self, refuse: bool) {
        self.state().refuse_log_on = refuse;
    }

    pub fn server_details(&self, server: Identity) -> Option<ServerDetails> {
        self.state().details.get(&server).cloned()
    }

    pub fn is_logged_on(&self, server: Identity) -> bool {
        self.state().logged_on.contains(&server)
    }

    pub fn advertised_game(&self, user: Identity) -> Option<Identity> {
        self.state().advertised.get(&user).copied()
    }

    /// Proof sessions currently open on `server`
    pub fn open_sessions(&self, server: Identity) -> usize {
        self.state().sessions.iter().filter(|(s, _)| *s == server).count()
    }

    pub fn outstanding_tickets(&self, user: Identity) -> usize {
        self.state().tickets.values().filter(|(_, id)| *id == user).count()
    }
}

/// Server account on a [`MemoryIdentityService`]
#[derive(Clone)]
pub struct MemoryServerAccount {
    service: MemoryIdentityService,
    identity: Identity,
}

impl MemoryServerAccount {
    fn push(state: &mut ServiceState, server: Identity, event: IdentityEvent) {
        state.events.entry(server).or_default().push(event);
    }
}

impl IdentityBackend for MemoryServerAccount {
    fn log_on(&self) -> bool {
        let mut state = self.service.state();
        if state.refuse_log_on {
            Self::push(&mut state, self.identity, IdentityEvent::LogOnFailed("log on refused".into()));
        } else {
            state.logged_on.insert(self.identity);
            Self::push(&mut state, self.identity, IdentityEvent::LoggedOn);
        }
        true
    }

    fn log_off(&self) {
        let mut state = self.service.state();
        if state.logged_on.remove(&self.identity) {
            Self::push(&mut state, self.identity, IdentityEvent::LoggedOff);
        }
        state.details.remove(&self.identity);
    }

    fn set_server_details(&self, details: &ServerDetails) {
        self.service.state().details.insert(self.identity, details.clone());
    }

    fn begin_proof_session(&self, token: &[u8], remote: Identity) -> bool {
        if token.is_empty() || token.len() > MAX_TOKEN_LEN {
            return false;
        }
        let mut state = self.service.state();
        if !state.sessions.insert((self.identity, remote)) {
            // duplicate request for the same remote
            return false;
        }
        let ok = state
            .tickets
            .get(token)
            .is_some_and(|(_, owner)| *owner == remote);
        debug!(remote = %remote, ok, "Proof session started");
        Self::push(&mut state, self.identity, IdentityEvent::ProofValidated { remote, ok });
        true
    }

    fn end_proof_session(&self, remote: Identity) {
        self.service.state().sessions.remove(&(self.identity, remote));
    }

    fn poll_events(&self) -> Vec<IdentityEvent> {
        self.service
            .state()
            .events
            .get_mut(&self.identity)
            .map(std::mem::take)
            .unwrap_or_default()
    }
}

/// User account on a [`MemoryIdentityService`]
#[derive(Clone)]
pub struct MemoryUser {
    service: MemoryIdentityService,
    identity: Identity,
}

impl LocalUser for MemoryUser {
    fn identity(&self) -> Identity {
        self.identity
    }

    fn proof_token(&self) -> Option<ProofTicket> {
        let mut token = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut token);

        let mut state = self.service.state();
        state.next_ticket = state.next_ticket.wrapping_add(1);
        let handle = state.next_ticket;
        state.tickets.insert(token.clone(), (handle, self.identity));
        Some(ProofTicket { handle, token })
    }

    fn cancel_proof_token(&self, handle: u32) {
        self.service.state().tickets.retain(|_, (h, _)| *h != handle);
    }

    fn advertise_game(&self, server: Option<Identity>) {
        let mut state = self.service.state();
        match server {
            Some(server) => {
                state.advertised.insert(self.identity, server);
            }
            None => {
                state.advertised.remove(&self.identity);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issued_token_validates_for_owner_only() {
        let service = MemoryIdentityService::new();
        let server = service.server(Identity::game_server(1));
        let alice = service.user(Identity::individual(10));
        let mallory = Identity::individual(11);

        let ticket = alice.proof_token().unwrap();
        assert!(server.begin_proof_session(&ticket.token, alice.identity()));
        assert!(server.begin_proof_session(&ticket.token, mallory));

        let events = server.poll_events();
        assert_eq!(
            events,
            vec![
                IdentityEvent::ProofValidated { remote: alice.identity(), ok: true },
                IdentityEvent::ProofValidated { remote: mallory, ok: false },
            ]
        );
        assert!(server.poll_events().is_empty());
    }

    #[test]
    fn test_cancelled_token_fails_validation() {
        let service = MemoryIdentityService::new();
        let server = service.server(Identity::game_server(1));
        let alice = service.user(Identity::individual(10));

        let ticket = alice.proof_token().unwrap();
        alice.cancel_proof_token(ticket.handle);
        assert_eq!(service.outstanding_tickets(alice.identity()), 0);

        assert!(server.begin_proof_session(&ticket.token, alice.identity()));
        assert_eq!(
            server.poll_events(),
            vec![IdentityEvent::ProofValidated { remote: alice.identity(), ok: false }]
        );
    }

    #[test]
    fn test_ticket_handles_wrap_around() {
        let service = MemoryIdentityService::new();
        let alice = service.user(Identity::individual(10));
        service.state().next_ticket = u32::MAX - 1;

        let last = alice.proof_token().unwrap();
        let wrapped = alice.proof_token().unwrap();
        assert_eq!(last.handle, u32::MAX);
        assert_eq!(wrapped.handle, 0);

        alice.cancel_proof_token(last.handle);
        assert_eq!(service.outstanding_tickets(alice.identity()), 1);
    }

    #[test]
    fn test_empty_token_rejected_synchronously() {
        let service = MemoryIdentityService::new();
        let server = service.server(Identity::game_server(1));
        assert!(!server.begin_proof_session(&[], Identity::individual(10)));
        assert!(server.poll_events().is_empty());
    }

    #[test]
    fn test_log_on_and_off() {
        let service = MemoryIdentityService::new();
        let id = Identity::game_server(1);
        let server = service.server(id);

        assert!(server.log_on());
        assert_eq!(server.poll_events(), vec![IdentityEvent::LoggedOn]);
        assert!(service.is_logged_on(id));

        server.log_off();
        assert!(!service.is_logged_on(id));
        assert_eq!(server.poll_events(), vec![IdentityEvent::LoggedOff]);

        service.refuse_log_on(true);
        server.log_on();
        assert!(matches!(server.poll_events()[..], [IdentityEvent::LogOnFailed(_)]));
    }
}
