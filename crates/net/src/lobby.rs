//! Lobby helper
//!
//! Advertises a hosted session, or finds a joined one, through the rendezvous
//! directory. The lobby only resolves where the server is; it never carries
//! application data.

use std::sync::Arc;

use relayplay_core::Identity;
use tracing::{debug, info, warn};

use crate::auth::LocalUser;
use crate::directory::{DirectoryEvent, RendezvousDirectory};
use crate::error::{Error, Result};
use crate::server::ServerSettings;

/// Metadata key holding the session name
pub const KEY_NAME: &str = "name";
/// Metadata key holding `"1"` when a password is required
pub const KEY_PASSWORD: &str = "pw";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyState {
    None,
    Creating,
    Joining,
    InLobby,
}

pub struct Lobby {
    directory: Arc<dyn RendezvousDirectory>,
    user: Arc<dyn LocalUser>,
    state: LobbyState,
    entry: Option<Identity>,
    name: String,
    password: bool,
}

impl Lobby {
    pub fn new(directory: Arc<dyn RendezvousDirectory>, user: Arc<dyn LocalUser>) -> Self {
        Self {
            directory,
            user,
            state: LobbyState::None,
            entry: None,
            name: String::new(),
            password: false,
        }
    }

    pub fn state(&self) -> LobbyState {
        self.state
    }

    pub fn is_in_lobby(&self) -> bool {
        self.state == LobbyState::InLobby
    }

    /// The directory entry, once in the lobby
    pub fn entry(&self) -> Option<Identity> {
        self.entry
    }

    /// Ask the directory for a new entry sized for `settings`
    pub fn create(&mut self, settings: &ServerSettings) -> Result<()> {
        if !self.directory.create_entry(settings.visibility, settings.max_players) {
            return Err(Error::Backend("failed to create directory entry".into()));
        }
        self.state = LobbyState::Creating;
        self.name = settings.name.clone();
        self.password = settings.has_password();
        debug!("Creating lobby");
        Ok(())
    }

    pub fn join(&mut self, entry: Identity) -> Result<()> {
        if !self.directory.join_entry(entry) {
            return Err(Error::Backend("failed to join directory entry".into()));
        }
        self.state = LobbyState::Joining;
        debug!(entry = %entry, "Joining lobby");
        Ok(())
    }

    pub fn leave(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.directory.leave_entry(entry);
            info!(entry = %entry, "Left lobby");
        }
        self.state = LobbyState::None;
        self.update_details();
    }

    /// Attach the server others should connect to
    pub fn set_game_server(&mut self, server: Identity) {
        let Some(entry) = self.entry else {
            warn!("Setting game server without a lobby");
            return;
        };
        self.directory.set_game_server(entry, server);
        self.update_details();
        debug!(entry = %entry, server = %server, "Set lobby game server");
    }

    pub fn game_server(&self) -> Option<Identity> {
        self.directory
            .game_server(self.entry?)
            .filter(|server| server.is_valid())
    }

    /// Drain directory events and apply the ones that concern this lobby
    pub fn pump(&mut self) {
        for event in self.directory.poll_events() {
            self.handle_event(&event);
        }
    }

    pub fn handle_event(&mut self, event: &DirectoryEvent) {
        match *event {
            DirectoryEvent::EntryCreated(result) if self.state == LobbyState::Creating => match result {
                Some(entry) if entry.is_valid() => {
                    self.state = LobbyState::InLobby;
                    self.entry = Some(entry);
                    self.directory.set_metadata(entry, KEY_NAME, &self.name);
                    self.directory
                        .set_metadata(entry, KEY_PASSWORD, if self.password { "1" } else { "0" });
                    self.update_details();
                    info!(entry = %entry, "Created lobby");
                }
                _ => {
                    warn!("Lobby creation failed");
                    self.state = LobbyState::None;
                }
            },
            DirectoryEvent::EntryEntered(result) if self.state == LobbyState::Joining => match result {
                Some(entry) if entry.is_valid() => {
                    self.state = LobbyState::InLobby;
                    self.entry = Some(entry);
                    self.update_details();
                    info!(entry = %entry, "Entered lobby");
                }
                _ => {
                    warn!("Failed to enter lobby");
                    self.state = LobbyState::None;
                }
            },
            // result of a create or join that was given up on
            DirectoryEvent::EntryCreated(Some(entry)) | DirectoryEvent::EntryEntered(Some(entry))
                if self.entry != Some(entry) =>
            {
                debug!(entry = %entry, "Leaving abandoned lobby");
                self.directory.leave_entry(entry);
            }
            DirectoryEvent::Kicked(entry) if self.entry == Some(entry) => {
                self.entry = None;
                self.state = LobbyState::None;
                self.update_details();
                info!(entry = %entry, "Kicked from lobby");
            }
            DirectoryEvent::GameServerSet { entry, .. } if self.entry == Some(entry) => {
                self.update_details();
            }
            _ => {}
        }
    }

    fn update_details(&self) {
        let entry = match self.entry {
            Some(entry) if self.is_in_lobby() => entry,
            _ => {
                self.directory.clear_presence();
                return;
            }
        };

        self.directory.set_presence("status", "In Multiplayer Game");
        self.directory
            .set_presence("connect", &format!("+connect {entry}"));

        match self.game_server() {
            Some(server) => {
                self.user.advertise_game(Some(server));
                self.directory
                    .set_presence("steam_player_group", &server.to_string());
            }
            None => self.directory.set_presence("steam_player_group", ""),
        }
    }
}

impl Drop for Lobby {
    fn drop(&mut self) {
        if self.state != LobbyState::None || self.entry.is_some() {
            self.leave();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryIdentityService;
    use crate::directory::{MemoryDirectory, Visibility};

    fn lobby_for(directory: &MemoryDirectory, service: &MemoryIdentityService, account: u64) -> Lobby {
        let user = Identity::individual(account);
        Lobby::new(Arc::new(directory.member(user)), Arc::new(service.user(user)))
    }

    fn settings() -> ServerSettings {
        ServerSettings {
            name: "Arena".into(),
            password: "pw".into(),
            max_players: 4,
            visibility: Visibility::Public,
            auth: true,
        }
    }

    #[test]
    fn test_create_publishes_metadata_and_presence() {
        let directory = MemoryDirectory::new();
        let service = MemoryIdentityService::new();
        let mut lobby = lobby_for(&directory, &service, 1);

        lobby.create(&settings()).unwrap();
        assert_eq!(lobby.state(), LobbyState::Creating);
        lobby.pump();
        assert!(lobby.is_in_lobby());

        let entry = lobby.entry().unwrap();
        let reader = directory.member(Identity::individual(2));
        assert_eq!(reader.metadata(entry, KEY_NAME).as_deref(), Some("Arena"));
        assert_eq!(reader.metadata(entry, KEY_PASSWORD).as_deref(), Some("1"));

        let presence = directory.presence(Identity::individual(1));
        assert_eq!(presence["status"], "In Multiplayer Game");
        assert_eq!(presence["connect"], format!("+connect {entry}"));
        assert_eq!(presence["steam_player_group"], "");
    }

    #[test]
    fn test_abandoned_create_is_left() {
        let directory = MemoryDirectory::new();
        let service = MemoryIdentityService::new();
        let mut lobby = lobby_for(&directory, &service, 1);

        lobby.create(&settings()).unwrap();
        lobby.leave();
        lobby.create(&settings()).unwrap();
        lobby.pump();

        assert!(lobby.is_in_lobby());
        assert_eq!(directory.entry_count(), 1);
        assert_eq!(
            directory.member(Identity::individual(2)).metadata(lobby.entry().unwrap(), KEY_NAME).as_deref(),
            Some("Arena")
        );
    }

    #[test]
    fn test_game_server_resolution() {
        let directory = MemoryDirectory::new();
        let service = MemoryIdentityService::new();
        let mut host = lobby_for(&directory, &service, 1);
        host.create(&settings()).unwrap();
        host.pump();

        let server = Identity::game_server(77);
        host.set_game_server(server);
        assert_eq!(host.game_server(), Some(server));
        assert_eq!(service.advertised_game(Identity::individual(1)), Some(server));

        let mut guest = lobby_for(&directory, &service, 2);
        guest.join(host.entry().unwrap()).unwrap();
        guest.pump();
        assert!(guest.is_in_lobby());
        assert_eq!(guest.game_server(), Some(server));
        assert_eq!(
            directory.presence(Identity::individual(2))["steam_player_group"],
            server.to_string()
        );
    }

    #[test]
    fn test_join_failure_resets() {
        let directory = MemoryDirectory::new();
        let service = MemoryIdentityService::new();
        let mut lobby = lobby_for(&directory, &service, 1);
        lobby.join(Identity::lobby(404)).unwrap();
        lobby.pump();
        assert_eq!(lobby.state(), LobbyState::None);
        assert_eq!(lobby.entry(), None);
    }

    #[test]
    fn test_leave_and_kick_clear_presence() {
        let directory = MemoryDirectory::new();
        let service = MemoryIdentityService::new();
        let mut host = lobby_for(&directory, &service, 1);
        host.create(&settings()).unwrap();
        host.pump();
        let entry = host.entry().unwrap();

        let mut guest = lobby_for(&directory, &service, 2);
        guest.join(entry).unwrap();
        guest.pump();

        directory.kick(entry, Identity::individual(2));
        guest.pump();
        assert_eq!(guest.state(), LobbyState::None);
        assert!(directory.presence(Identity::individual(2)).is_empty());

        host.leave();
        assert_eq!(host.state(), LobbyState::None);
        assert!(directory.presence(Identity::individual(1)).is_empty());
        assert_eq!(directory.entry_count(), 0);
    }
}
