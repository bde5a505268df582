//! Session discovery
//!
//! Collects the directory entries of friends' games and of the public listing,
//! together with the metadata needed to describe them as sessions.

use std::sync::Arc;

use relayplay_core::Identity;
use tracing::debug;

use crate::directory::{DirectoryEvent, RendezvousDirectory};
use crate::lobby::{KEY_NAME, KEY_PASSWORD};

/// Name used when an entry has none
const FALLBACK_NAME: &str = "Lobby";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub id: Identity,
    pub name: String,
    pub password: bool,
    /// Found through a friend's current game
    pub friend: bool,
    pub max_players: u32,
    pub current_players: u32,
}

/// One pass over the directory, completed by pumping events
pub struct SessionListRequest {
    directory: Arc<dyn RendezvousDirectory>,
    requesting_list: bool,
    requesting_data: usize,
    entries: Vec<SessionEntry>,
}

impl SessionListRequest {
    pub fn new(directory: Arc<dyn RendezvousDirectory>) -> Self {
        Self {
            directory,
            requesting_list: false,
            requesting_data: 0,
            entries: Vec::new(),
        }
    }

    /// Start collecting; friend entries are added right away
    pub fn request(&mut self) {
        if self.is_requesting() {
            return;
        }
        debug!("Requesting session list");
        self.entries.clear();

        for entry in self.directory.friend_entries() {
            self.add(entry, true);
        }
        self.requesting_list = self.directory.request_entry_list();
    }

    pub fn cancel(&mut self) {
        self.requesting_list = false;
        self.requesting_data = 0;
    }

    pub fn is_requesting(&self) -> bool {
        self.requesting_list || self.requesting_data > 0
    }

    pub fn entries(&self) -> &[SessionEntry] {
        &self.entries
    }

    pub fn pump(&mut self) {
        for event in self.directory.poll_events() {
            self.handle_event(&event);
        }
    }

    pub fn handle_event(&mut self, event: &DirectoryEvent) {
        match event {
            DirectoryEvent::EntryList(entries) if self.requesting_list => {
                self.requesting_list = false;
                for entry in entries {
                    self.add(*entry, false);
                }
            }
            DirectoryEvent::DataUpdated { entry, success } if self.requesting_data > 0 => {
                self.requesting_data -= 1;
                if let Some(pos) = self.entries.iter().position(|e| e.id == *entry) {
                    let refreshed = *success && self.refresh(pos);
                    if !refreshed {
                        self.entries.remove(pos);
                    }
                }
            }
            _ => {}
        }
    }

    fn add(&mut self, id: Identity, friend: bool) {
        if !id.is_lobby() {
            return;
        }

        let pos = match self.entries.iter().position(|e| e.id == id) {
            Some(pos) => pos,
            None => {
                self.entries.push(SessionEntry {
                    id,
                    name: String::new(),
                    password: false,
                    friend: false,
                    max_players: 0,
                    current_players: 0,
                });
                self.entries.len() - 1
            }
        };
        self.entries[pos].friend |= friend;

        if !self.refresh(pos) && self.directory.request_entry_data(id) {
            self.requesting_data += 1;
        }
    }

    /// Reload metadata for an entry; false if some of it is missing
    fn refresh(&mut self, pos: usize) -> bool {
        let directory = &self.directory;
        let entry = &mut self.entries[pos];
        let mut complete = true;

        entry.max_players = directory.member_limit(entry.id);
        entry.current_players = directory.member_count(entry.id);

        match directory.metadata(entry.id, KEY_NAME).filter(|n| !n.is_empty()) {
            Some(name) => entry.name = name,
            None => {
                entry.name = FALLBACK_NAME.to_owned();
                complete = false;
            }
        }

        match directory.metadata(entry.id, KEY_PASSWORD).filter(|p| !p.is_empty()) {
            Some(pw) => entry.password = pw.starts_with('1'),
            None => {
                entry.password = false;
                complete = false;
            }
        }

        complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{MemoryDirectory, Visibility};

    fn create_entry(directory: &MemoryDirectory, owner: Identity, visibility: Visibility, name: Option<&str>) -> Identity {
        let member = directory.member(owner);
        member.create_entry(visibility, 4);
        let entry = match member.poll_events().as_slice() {
            [DirectoryEvent::EntryCreated(Some(id))] => *id,
            other => panic!("unexpected events {other:?}"),
        };
        if let Some(name) = name {
            member.set_metadata(entry, KEY_NAME, name);
            member.set_metadata(entry, KEY_PASSWORD, "0");
        }
        entry
    }

    #[test]
    fn test_collects_friend_and_public_entries() {
        let directory = MemoryDirectory::new();
        let me = Identity::individual(1);
        let friend = Identity::individual(2);
        directory.add_friends(me, friend);

        let friend_entry = create_entry(&directory, friend, Visibility::Public, Some("Friendly"));
        let public_entry = create_entry(&directory, Identity::individual(3), Visibility::Public, Some("Open"));

        let mut request = SessionListRequest::new(Arc::new(directory.member(me)));
        request.request();
        assert!(request.is_requesting());
        request.pump();
        assert!(!request.is_requesting());

        let entries = request.entries();
        assert_eq!(entries.len(), 2);
        let f = entries.iter().find(|e| e.id == friend_entry).unwrap();
        assert!(f.friend);
        assert_eq!(f.name, "Friendly");
        assert_eq!(f.max_players, 4);
        assert_eq!(f.current_players, 1);
        let p = entries.iter().find(|e| e.id == public_entry).unwrap();
        assert!(!p.friend);
    }

    #[test]
    fn test_missing_metadata_is_refetched_then_dropped() {
        let directory = MemoryDirectory::new();
        let me = Identity::individual(1);
        let named = create_entry(&directory, Identity::individual(2), Visibility::Public, Some("Named"));
        create_entry(&directory, Identity::individual(3), Visibility::Public, None);
        directory.forget_metadata(me, named);

        let mut request = SessionListRequest::new(Arc::new(directory.member(me)));
        request.request();
        // list reply, then one data reply per incomplete entry
        request.pump();
        request.pump();
        assert!(!request.is_requesting());

        let entries = request.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, named);
        assert_eq!(entries[0].name, "Named");
    }

    #[test]
    fn test_cancel_stops_request() {
        let directory = MemoryDirectory::new();
        let mut request = SessionListRequest::new(Arc::new(directory.member(Identity::individual(1))));
        request.request();
        request.cancel();
        assert!(!request.is_requesting());
        request.pump();
        assert!(request.entries().is_empty());
    }
}
