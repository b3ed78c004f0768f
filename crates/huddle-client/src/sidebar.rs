use std::collections::{BTreeSet, HashSet};

use tracing::debug;
use uuid::Uuid;

use huddle_types::events::RoomEvent;

/// What the sidebar should do with a personal-channel event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SidebarUpdate {
    ThreadAdded {
        share_code: String,
        thread_id: Uuid,
        title: String,
    },
    /// Re-fetch this room's entry.
    RefreshRoom(String),
}

/// Rooms the user belongs to plus the threads already shown under them.
///
/// The server only sends personal events for authorized rooms; this checks
/// again and drops anything else.
#[derive(Debug, Default)]
pub struct Sidebar {
    rooms: BTreeSet<String>,
    seen_threads: HashSet<Uuid>,
}

impl Sidebar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the room list, e.g. after a reconnect re-fetch.
    pub fn repopulate(&mut self, share_codes: impl IntoIterator<Item = String>) {
        self.rooms = share_codes.into_iter().collect();
        self.seen_threads.clear();
    }

    pub fn add_room(&mut self, share_code: &str) {
        self.rooms.insert(share_code.to_string());
    }

    pub fn remove_room(&mut self, share_code: &str) {
        self.rooms.remove(share_code);
    }

    pub fn contains(&self, share_code: &str) -> bool {
        self.rooms.contains(share_code)
    }

    pub fn rooms(&self) -> impl Iterator<Item = &str> {
        self.rooms.iter().map(String::as_str)
    }

    pub fn apply(&mut self, event: &RoomEvent) -> Option<SidebarUpdate> {
        let share_code = event.share_code()?;
        if !self.rooms.contains(share_code) {
            debug!("Dropping sidebar event for foreign room {}", share_code);
            return None;
        }

        match event {
            RoomEvent::ThreadCreated {
                share_code,
                thread_id,
                title,
                ..
            } => self.seen_threads.insert(*thread_id).then(|| SidebarUpdate::ThreadAdded {
                share_code: share_code.clone(),
                thread_id: *thread_id,
                title: title.clone(),
            }),
            RoomEvent::SidebarRefreshRequested { share_code } => {
                Some(SidebarUpdate::RefreshRoom(share_code.clone()))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread(share_code: &str, thread_id: Uuid) -> RoomEvent {
        RoomEvent::ThreadCreated {
            share_code: share_code.into(),
            thread_id,
            title: "ideas".into(),
            created_by: "anon_a".into(),
        }
    }

    #[test]
    fn duplicate_thread_events_are_shown_once() {
        let mut sidebar = Sidebar::new();
        sidebar.add_room("ROOM2345");
        let id = Uuid::new_v4();

        assert!(matches!(
            sidebar.apply(&thread("ROOM2345", id)),
            Some(SidebarUpdate::ThreadAdded { .. })
        ));
        assert_eq!(sidebar.apply(&thread("ROOM2345", id)), None);
    }

    #[test]
    fn events_for_other_rooms_are_dropped() {
        let mut sidebar = Sidebar::new();
        sidebar.add_room("ROOM2345");

        assert_eq!(sidebar.apply(&thread("OTHER234", Uuid::new_v4())), None);
        assert_eq!(
            sidebar.apply(&RoomEvent::SidebarRefreshRequested {
                share_code: "OTHER234".into()
            }),
            None
        );
        assert_eq!(
            sidebar.apply(&RoomEvent::SidebarRefreshRequested {
                share_code: "ROOM2345".into()
            }),
            Some(SidebarUpdate::RefreshRoom("ROOM2345".into()))
        );
    }

    #[test]
    fn repopulate_forgets_seen_threads() {
        let mut sidebar = Sidebar::new();
        sidebar.add_room("ROOM2345");
        let id = Uuid::new_v4();
        sidebar.apply(&thread("ROOM2345", id));

        sidebar.repopulate(vec!["ROOM2345".to_string()]);
        assert!(sidebar.apply(&thread("ROOM2345", id)).is_some());
    }
}
