use uuid::Uuid;

use huddle_types::events::{RemovalReason, RoomEvent};

/// What to do when a `user-removed-from-room` event arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalAction {
    /// Leave the room page.
    Redirect,
    /// Keep the page but show that the room is over.
    ShowExpired,
    Ignore,
}

/// One open room page, optionally narrowed to a thread.
#[derive(Debug, Clone)]
pub struct ThreadView {
    pub share_code: String,
    /// `None` is the main room.
    pub thread_id: Option<Uuid>,
    pub session_id: String,
    pub history_loaded: bool,
}

impl ThreadView {
    pub fn new(share_code: impl Into<String>, thread_id: Option<Uuid>, session_id: impl Into<String>) -> Self {
        Self {
            share_code: share_code.into(),
            thread_id,
            session_id: session_id.into(),
            history_loaded: false,
        }
    }

    /// Whether an event should be rendered here. Thread-scoped events
    /// (typing, messages, AI output) must match this view's thread.
    pub fn accepts(&self, event: &RoomEvent) -> bool {
        if event.share_code() != Some(self.share_code.as_str()) {
            return false;
        }
        match event.thread_scope() {
            Some(thread_id) => thread_id == self.thread_id,
            None => true,
        }
    }

    /// Only a genuine removal of this session redirects, and only once the
    /// page has shown history. A removal seen while still loading is stale.
    pub fn on_removal(&self, event: &RoomEvent) -> RemovalAction {
        let RoomEvent::UserRemovedFromRoom {
            share_code,
            session_id,
            reason,
        } = event
        else {
            return RemovalAction::Ignore;
        };
        if *share_code != self.share_code || *session_id != self.session_id {
            return RemovalAction::Ignore;
        }

        match reason {
            RemovalReason::Removed if self.history_loaded => RemovalAction::Redirect,
            RemovalReason::Removed => RemovalAction::Ignore,
            RemovalReason::RoomExpired => RemovalAction::ShowExpired,
        }
    }
}
