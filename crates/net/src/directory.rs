//! Rendezvous directory backend
//!
//! A matchmaking service holding entries that advertise where a server can be
//! reached. Results of requests arrive asynchronously as
//! [`DirectoryEvent`]s, drained by [`RendezvousDirectory::poll_events`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use relayplay_core::Identity;
use tracing::debug;

/// Who can see a new entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    Private,
    #[default]
    FriendsOnly,
    Public,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    /// Reply to [`RendezvousDirectory::create_entry`], `None` on failure
    EntryCreated(Option<Identity>),
    /// Reply to [`RendezvousDirectory::join_entry`], `None` on failure
    EntryEntered(Option<Identity>),
    Kicked(Identity),
    /// Reply to [`RendezvousDirectory::request_entry_data`]
    DataUpdated { entry: Identity, success: bool },
    /// Reply to [`RendezvousDirectory::request_entry_list`]
    EntryList(Vec<Identity>),
    GameServerSet { entry: Identity, server: Identity },
}

/// Directory service as seen by the local user
pub trait RendezvousDirectory: Send + Sync {
    fn create_entry(&self, visibility: Visibility, capacity: u32) -> bool;

    fn join_entry(&self, entry: Identity) -> bool;

    fn leave_entry(&self, entry: Identity);

    fn set_metadata(&self, entry: Identity, key: &str, value: &str) -> bool;

    /// Metadata known locally, `None` when missing or not yet fetched
    fn metadata(&self, entry: Identity, key: &str) -> Option<String>;

    fn set_game_server(&self, entry: Identity, server: Identity);

    fn game_server(&self, entry: Identity) -> Option<Identity>;

    fn member_limit(&self, entry: Identity) -> u32;

    fn member_count(&self, entry: Identity) -> u32;

    fn request_entry_list(&self) -> bool;

    fn request_entry_data(&self, entry: Identity) -> bool;

    /// Entries friends of the local user are currently in
    fn friend_entries(&self) -> Vec<Identity>;

    fn set_presence(&self, key: &str, value: &str);

    fn clear_presence(&self);

    fn poll_events(&self) -> Vec<DirectoryEvent>;
}

struct Entry {
    visibility: Visibility,
    capacity: u32,
    members: Vec<Identity>,
    data: HashMap<String, String>,
    game_server: Option<Identity>,
}

#[derive(Default)]
struct DirectoryState {
    next_entry: u64,
    entries: HashMap<Identity, Entry>,
    events: HashMap<Identity, VecDeque<DirectoryEvent>>,
    presence: HashMap<Identity, HashMap<String, String>>,
    friends: HashSet<(Identity, Identity)>,
    /// Entries whose metadata a member has not fetched yet
    unfetched: HashSet<(Identity, Identity)>,
}

impl DirectoryState {
    fn push(&mut self, member: Identity, event: DirectoryEvent) {
        self.events.entry(member).or_default().push_back(event);
    }

    fn visible_to(&self, entry: &Entry, member: Identity) -> bool {
        match entry.visibility {
            Visibility::Public => true,
            Visibility::FriendsOnly => entry
                .members
                .iter()
                .any(|m| *m == member || self.friends.contains(&(member, *m))),
            Visibility::Private => entry.members.contains(&member),
        }
    }
}

/// In-process directory service
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    inner: Arc<Mutex<DirectoryState>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, DirectoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Directory view of `user`
    pub fn member(&self, user: Identity) -> MemoryDirectoryMember {
        MemoryDirectoryMember {
            directory: self.clone(),
            user,
        }
    }

    pub fn add_friends(&self, a: Identity, b: Identity) {
        let mut state = self.state();
        state.friends.insert((a, b));
        state.friends.insert((b, a));
    }

    /// Remove `member` from `entry` as if the owner kicked them
    pub fn kick(&self, entry: Identity, member: Identity) {
        let mut state = self.state();
        if let Some(e) = state.entries.get_mut(&entry) {
            e.members.retain(|m| *m != member);
            state.push(member, DirectoryEvent::Kicked(entry));
        }
    }

    /// Pretend `member` has no cached metadata for `entry`
    pub fn forget_metadata(&self, member: Identity, entry: Identity) {
        self.state().unfetched.insert((member, entry));
    }

    pub fn presence(&self, user: Identity) -> HashMap<String, String> {
        self.state().presence.get(&user).cloned().unwrap_or_default()
    }

    pub fn entry_count(&self) -> usize {
        self.state().entries.len()
    }
}

/// One user's view of a [`MemoryDirectory`]
#[derive(Clone)]
pub struct MemoryDirectoryMember {
    directory: MemoryDirectory,
    user: Identity,
}

impl RendezvousDirectory for MemoryDirectoryMember {
    fn create_entry(&self, visibility: Visibility, capacity: u32) -> bool {
        if capacity == 0 {
            return false;
        }
        let mut state = self.directory.state();
        state.next_entry += 1;
        let id = Identity::lobby(state.next_entry);
        state.entries.insert(
            id,
            Entry {
                visibility,
                capacity,
                members: vec![self.user],
                data: HashMap::new(),
                game_server: None,
            },
        );
        state.push(self.user, DirectoryEvent::EntryCreated(Some(id)));
        debug!(entry = %id, "Directory entry created");
        true
    }

    fn join_entry(&self, entry: Identity) -> bool {
        if !entry.is_lobby() {
            return false;
        }
        let mut state = self.directory.state();
        let joined = match state.entries.get_mut(&entry) {
            Some(e) if (e.members.len() as u32) < e.capacity => {
                if !e.members.contains(&self.user) {
                    e.members.push(self.user);
                }
                Some(entry)
            }
            _ => None,
        };
        state.push(self.user, DirectoryEvent::EntryEntered(joined));
        true
    }

    fn leave_entry(&self, entry: Identity) {
        let mut state = self.directory.state();
        let empty = match state.entries.get_mut(&entry) {
            Some(e) => {
                e.members.retain(|m| *m != self.user);
                e.members.is_empty()
            }
            None => false,
        };
        if empty {
            state.entries.remove(&entry);
            debug!(entry = %entry, "Directory entry removed");
        }
    }

    fn set_metadata(&self, entry: Identity, key: &str, value: &str) -> bool {
        let mut state = self.directory.state();
        match state.entries.get_mut(&entry) {
            Some(e) if e.members.contains(&self.user) => {
                e.data.insert(key.to_owned(), value.to_owned());
                true
            }
            _ => false,
        }
    }

    fn metadata(&self, entry: Identity, key: &str) -> Option<String> {
        let state = self.directory.state();
        if state.unfetched.contains(&(self.user, entry)) {
            return None;
        }
        state.entries.get(&entry)?.data.get(key).cloned()
    }

    fn set_game_server(&self, entry: Identity, server: Identity) {
        let mut state = self.directory.state();
        let members = match state.entries.get_mut(&entry) {
            Some(e) if e.members.contains(&self.user) => {
                e.game_server = Some(server);
                e.members.clone()
            }
            _ => return,
        };
        for member in members {
            state.push(member, DirectoryEvent::GameServerSet { entry, server });
        }
    }

    fn game_server(&self, entry: Identity) -> Option<Identity> {
        self.directory.state().entries.get(&entry)?.game_server
    }

    fn member_limit(&self, entry: Identity) -> u32 {
        let state = self.directory.state();
        if state.unfetched.contains(&(self.user, entry)) {
            return 0;
        }
        state.entries.get(&entry).map_or(0, |e| e.capacity)
    }

    fn member_count(&self, entry: Identity) -> u32 {
        self.directory
            .state()
            .entries
            .get(&entry)
            .map_or(0, |e| e.members.len() as u32)
    }

    fn request_entry_list(&self) -> bool {
        let mut state = self.directory.state();
        let mut entries: Vec<Identity> = state
            .entries
            .iter()
            .filter(|(_, e)| e.visibility == Visibility::Public && !e.members.is_empty())
            .map(|(id, _)| *id)
            .collect();
        entries.sort();
        state.push(self.user, DirectoryEvent::EntryList(entries));
        true
    }

    fn request_entry_data(&self, entry: Identity) -> bool {
        let mut state = self.directory.state();
        let success = state.entries.contains_key(&entry);
        state.unfetched.remove(&(self.user, entry));
        state.push(self.user, DirectoryEvent::DataUpdated { entry, success });
        true
    }

    fn friend_entries(&self) -> Vec<Identity> {
        let state = self.directory.state();
        let mut entries: Vec<Identity> = state
            .entries
            .iter()
            .filter(|(_, e)| {
                e.members
                    .iter()
                    .any(|m| state.friends.contains(&(self.user, *m)))
                    && state.visible_to(e, self.user)
            })
            .map(|(id, _)| *id)
            .collect();
        entries.sort();
        entries
    }

    fn set_presence(&self, key: &str, value: &str) {
        self.directory
            .state()
            .presence
            .entry(self.user)
            .or_default()
            .insert(key.to_owned(), value.to_owned());
    }

    fn clear_presence(&self) {
        self.directory.state().presence.remove(&self.user);
    }

    fn poll_events(&self) -> Vec<DirectoryEvent> {
        self.directory
            .state()
            .events
            .get_mut(&self.user)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_join_entry() {
        let directory = MemoryDirectory::new();
        let host = directory.member(Identity::individual(1));
        let guest = directory.member(Identity::individual(2));

        assert!(host.create_entry(Visibility::Public, 4));
        let entry = match host.poll_events().as_slice() {
            [DirectoryEvent::EntryCreated(Some(id))] => *id,
            other => panic!("unexpected events {other:?}"),
        };
        assert!(entry.is_lobby());
        assert!(host.set_metadata(entry, "name", "Game"));

        assert!(guest.join_entry(entry));
        assert_eq!(guest.poll_events(), vec![DirectoryEvent::EntryEntered(Some(entry))]);
        assert_eq!(guest.metadata(entry, "name").as_deref(), Some("Game"));
        assert_eq!(host.member_count(entry), 2);

        // only members may write metadata
        assert!(!directory.member(Identity::individual(3)).set_metadata(entry, "name", "x"));
    }

    #[test]
    fn test_join_full_or_missing_entry_fails() {
        let directory = MemoryDirectory::new();
        let host = directory.member(Identity::individual(1));
        host.create_entry(Visibility::Public, 1);
        let entry = match host.poll_events().as_slice() {
            [DirectoryEvent::EntryCreated(Some(id))] => *id,
            other => panic!("unexpected events {other:?}"),
        };

        let guest = directory.member(Identity::individual(2));
        guest.join_entry(entry);
        guest.join_entry(Identity::lobby(999));
        assert_eq!(
            guest.poll_events(),
            vec![DirectoryEvent::EntryEntered(None), DirectoryEvent::EntryEntered(None)]
        );
    }

    #[test]
    fn test_friend_entries_and_listing() {
        let directory = MemoryDirectory::new();
        let alice = Identity::individual(1);
        let bob = Identity::individual(2);
        directory.add_friends(alice, bob);

        let host = directory.member(alice);
        host.create_entry(Visibility::FriendsOnly, 4);
        let entry = match host.poll_events().as_slice() {
            [DirectoryEvent::EntryCreated(Some(id))] => *id,
            other => panic!("unexpected events {other:?}"),
        };

        let friend = directory.member(bob);
        assert_eq!(friend.friend_entries(), vec![entry]);
        assert!(directory.member(Identity::individual(3)).friend_entries().is_empty());

        // friends-only entries are not listed publicly
        friend.request_entry_list();
        assert_eq!(friend.poll_events(), vec![DirectoryEvent::EntryList(vec![])]);
    }

    #[test]
    fn test_last_member_leaving_removes_entry() {
        let directory = MemoryDirectory::new();
        let host = directory.member(Identity::individual(1));
        host.create_entry(Visibility::Public, 2);
        let entry = match host.poll_events().as_slice() {
            [DirectoryEvent::EntryCreated(Some(id))] => *id,
            other => panic!("unexpected events {other:?}"),
        };
        host.leave_entry(entry);
        assert_eq!(directory.entry_count(), 0);
    }
}
