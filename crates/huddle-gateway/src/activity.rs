//! Per-room, per-thread presence: which sessions are working in a thread and
//! which of them are typing. Feeds the `cross-thread-activity` summary.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::RwLock;
use uuid::Uuid;

use huddle_types::events::ThreadActivity;

#[derive(Debug, Default)]
struct RoomActivity {
    /// session_id -> (thread, display name). A session works in one thread at a time.
    current: HashMap<String, (Option<Uuid>, String)>,
    /// Sessions typing, keyed by thread.
    typing: BTreeMap<Option<Uuid>, BTreeMap<String, String>>,
}

#[derive(Default)]
pub struct ActivityTracker {
    rooms: RwLock<HashMap<String, RoomActivity>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a typing change. Also moves the session into `thread_id`.
    /// Returns `true` when the room summary changed.
    pub async fn set_typing(
        &self,
        share_code: &str,
        thread_id: Option<Uuid>,
        session_id: &str,
        display_name: &str,
        is_typing: bool,
    ) -> bool {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(share_code.to_string()).or_default();
        let mut changed = false;

        let previous = room
            .current
            .insert(session_id.to_string(), (thread_id, display_name.to_string()));
        if let Some((old_thread, _)) = previous {
            if old_thread != thread_id {
                changed = true;
                clear_typing(room, old_thread, session_id);
            }
        } else {
            changed = true;
        }

        let typists = room.typing.entry(thread_id).or_default();
        if is_typing {
            changed |= typists
                .insert(session_id.to_string(), display_name.to_string())
                .is_none();
        } else {
            changed |= typists.remove(session_id).is_some();
            if typists.is_empty() {
                room.typing.remove(&thread_id);
            }
        }

        changed
    }

    /// Forget a session in one room (leave, removal, disconnect). Returns the
    /// thread it was typing in, if any, so a final `is_typing: false` can go out.
    pub async fn remove_session(&self, share_code: &str, session_id: &str) -> Option<Option<Uuid>> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(share_code)?;

        let (thread, _) = room.current.remove(session_id)?;
        let was_typing = clear_typing(room, thread, session_id);

        if room.current.is_empty() {
            rooms.remove(share_code);
        }
        was_typing.then_some(thread)
    }

    /// Threads with at least one working or typing session. The main
    /// conversation sorts first.
    pub async fn summary(&self, share_code: &str) -> Vec<ThreadActivity> {
        let rooms = self.rooms.read().await;
        let Some(room) = rooms.get(share_code) else {
            return Vec::new();
        };

        let mut by_thread: BTreeMap<Option<Uuid>, ThreadActivity> = BTreeMap::new();
        for (thread, name) in room.current.values() {
            by_thread
                .entry(*thread)
                .or_insert_with(|| empty_activity(*thread))
                .active
                .push(name.clone());
        }
        for (thread, typists) in &room.typing {
            by_thread
                .entry(*thread)
                .or_insert_with(|| empty_activity(*thread))
                .typing
                .extend(typists.values().cloned());
        }

        by_thread
            .into_values()
            .map(|mut a| {
                a.active.sort();
                a
            })
            .collect()
    }

    pub async fn drop_room(&self, share_code: &str) {
        self.rooms.write().await.remove(share_code);
    }
}

fn clear_typing(room: &mut RoomActivity, thread: Option<Uuid>, session_id: &str) -> bool {
    let Some(typists) = room.typing.get_mut(&thread) else {
        return false;
    };
    let removed = typists.remove(session_id).is_some();
    if typists.is_empty() {
        room.typing.remove(&thread);
    }
    removed
}

fn empty_activity(thread_id: Option<Uuid>) -> ThreadActivity {
    ThreadActivity {
        thread_id,
        active: Vec::new(),
        typing: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn typing_shows_up_per_thread() {
        let tracker = ActivityTracker::new();
        let thread = Uuid::new_v4();

        assert!(tracker.set_typing("ROOM2345", None, "anon_a", "alice", true).await);
        assert!(tracker.set_typing("ROOM2345", Some(thread), "anon_b", "bob", true).await);

        let summary = tracker.summary("ROOM2345").await;
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].thread_id, None);
        assert_eq!(summary[0].typing, vec!["alice".to_string()]);
        assert_eq!(summary[1].thread_id, Some(thread));
        assert_eq!(summary[1].active, vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn repeated_typing_is_not_a_change() {
        let tracker = ActivityTracker::new();
        assert!(tracker.set_typing("ROOM2345", None, "anon_a", "alice", true).await);
        assert!(!tracker.set_typing("ROOM2345", None, "anon_a", "alice", true).await);
        assert!(tracker.set_typing("ROOM2345", None, "anon_a", "alice", false).await);

        let summary = tracker.summary("ROOM2345").await;
        assert!(summary[0].typing.is_empty());
        assert_eq!(summary[0].active, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn switching_threads_clears_old_typing() {
        let tracker = ActivityTracker::new();
        let thread = Uuid::new_v4();
        tracker.set_typing("ROOM2345", None, "anon_a", "alice", true).await;
        assert!(tracker.set_typing("ROOM2345", Some(thread), "anon_a", "alice", false).await);

        let summary = tracker.summary("ROOM2345").await;
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].thread_id, Some(thread));
    }

    #[tokio::test]
    async fn removing_a_session_reports_where_it_typed() {
        let tracker = ActivityTracker::new();
        let thread = Uuid::new_v4();
        tracker.set_typing("ROOM2345", Some(thread), "anon_a", "alice", true).await;

        assert_eq!(tracker.remove_session("ROOM2345", "anon_a").await, Some(Some(thread)));
        assert_eq!(tracker.remove_session("ROOM2345", "anon_a").await, None);
        assert!(tracker.summary("ROOM2345").await.is_empty());
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let tracker = ActivityTracker::new();
        tracker.set_typing("ROOM2345", None, "anon_a", "alice", true).await;
        assert!(tracker.summary("OTHER234").await.is_empty());
    }
}
