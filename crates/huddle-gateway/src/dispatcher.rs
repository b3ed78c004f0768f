use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use huddle_types::events::RoomEvent;

use crate::activity::ActivityTracker;
use crate::streams::StreamRegistry;

/// Fans events out to connected sessions.
///
/// Room events go over one broadcast channel and each connection keeps only
/// the share codes it subscribed to. Personal events go over per-session
/// channels and are gated by the session's authorized room list.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Room-scoped events, filtered per connection by subscription
    broadcast_tx: broadcast::Sender<RoomEvent>,

    /// Per-session personal channels: session_id -> (conn_id, sender)
    user_channels: RwLock<HashMap<String, (Uuid, mpsc::UnboundedSender<RoomEvent>)>>,

    /// Rooms each session may receive personal events about. Absent until
    /// the session joins its user channel.
    authorized_rooms: RwLock<HashMap<String, HashSet<String>>>,

    activity: ActivityTracker,
    streams: StreamRegistry,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                user_channels: RwLock::new(HashMap::new()),
                authorized_rooms: RwLock::new(HashMap::new()),
                activity: ActivityTracker::new(),
                streams: StreamRegistry::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Publish a room-scoped event. Events without a share code, and personal
    /// events, never go out on the room channel.
    pub fn broadcast_to_room(&self, event: RoomEvent) {
        if event.share_code().is_none() || event.is_personal() {
            warn!("Refusing to broadcast non-room event {:?}", event);
            return;
        }
        let _ = self.inner.broadcast_tx.send(event);
    }

    pub fn activity(&self) -> &ActivityTracker {
        &self.inner.activity
    }

    pub fn streams(&self) -> &StreamRegistry {
        &self.inner.streams
    }

    /// Register the session's personal channel. A newer connection replaces
    /// the older one. Returns (conn_id, receiver).
    pub async fn register_user_channel(
        &self,
        session_id: &str,
    ) -> (Uuid, mpsc::UnboundedReceiver<RoomEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .user_channels
            .write()
            .await
            .insert(session_id.to_string(), (conn_id, tx));
        (conn_id, rx)
    }

    /// Unregister, but only if `conn_id` still owns the channel.
    pub async fn unregister_user_channel(&self, session_id: &str, conn_id: Uuid) -> bool {
        let mut channels = self.inner.user_channels.write().await;
        let owned = channels
            .get(session_id)
            .is_some_and(|(stored, _)| *stored == conn_id);
        if owned {
            channels.remove(session_id);
            self.inner.authorized_rooms.write().await.remove(session_id);
        }
        owned
    }

    /// Replace the session's authorized room list (on `join-user-channel`).
    pub async fn set_authorized_rooms(&self, session_id: &str, share_codes: Vec<String>) {
        debug!("{} authorized for {} rooms", session_id, share_codes.len());
        self.inner
            .authorized_rooms
            .write()
            .await
            .insert(session_id.to_string(), share_codes.into_iter().collect());
    }

    pub async fn clear_authorized_rooms(&self, session_id: &str) {
        self.inner.authorized_rooms.write().await.remove(session_id);
    }

    /// Refresh after a successful join. No-op unless the session is on its
    /// user channel.
    pub async fn authorize_room(&self, session_id: &str, share_code: &str) {
        if let Some(rooms) = self.inner.authorized_rooms.write().await.get_mut(session_id) {
            rooms.insert(share_code.to_string());
        }
    }

    /// Refresh after leave or removal.
    pub async fn revoke_room(&self, session_id: &str, share_code: &str) {
        if let Some(rooms) = self.inner.authorized_rooms.write().await.get_mut(session_id) {
            rooms.remove(share_code);
        }
    }

    pub async fn is_authorized(&self, session_id: &str, share_code: &str) -> bool {
        self.inner
            .authorized_rooms
            .read()
            .await
            .get(session_id)
            .is_some_and(|rooms| rooms.contains(share_code))
    }

    /// Deliver a personal event to one session. Dropped unless the event's
    /// room is on the session's authorized list. Returns whether it was sent.
    pub async fn send_to_user(&self, session_id: &str, event: RoomEvent) -> bool {
        let Some(share_code) = event.share_code() else {
            return false;
        };
        if !self.is_authorized(session_id, share_code).await {
            debug!("Dropping {} event for unauthorized {}", share_code, session_id);
            return false;
        }

        let channels = self.inner.user_channels.read().await;
        match channels.get(session_id) {
            Some((_, tx)) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Deliver a personal event to every session authorized for its room.
    /// Returns how many sessions received it.
    pub async fn send_to_members(&self, event: RoomEvent) -> usize {
        let Some(share_code) = event.share_code() else {
            return 0;
        };

        let recipients: Vec<String> = self
            .inner
            .authorized_rooms
            .read()
            .await
            .iter()
            .filter(|(_, rooms)| rooms.contains(share_code))
            .map(|(session, _)| session.clone())
            .collect();

        let channels = self.inner.user_channels.read().await;
        let mut delivered = 0;
        for session in recipients {
            if let Some((_, tx)) = channels.get(&session) {
                if tx.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Publish the room's current thread activity summary.
    pub async fn publish_activity(&self, share_code: &str) {
        let threads = self.inner.activity.summary(share_code).await;
        self.broadcast_to_room(RoomEvent::CrossThreadActivity {
            share_code: share_code.to_string(),
            threads,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread_created(share_code: &str) -> RoomEvent {
        RoomEvent::ThreadCreated {
            share_code: share_code.into(),
            thread_id: Uuid::new_v4(),
            title: "plans".into(),
            created_by: "anon_a".into(),
        }
    }

    #[tokio::test]
    async fn personal_events_require_authorization() {
        let dispatcher = Dispatcher::new();
        let (_, mut rx) = dispatcher.register_user_channel("anon_a").await;

        // Not on the user channel yet: nothing is authorized
        assert!(!dispatcher.send_to_user("anon_a", thread_created("ROOM2345")).await);

        dispatcher
            .set_authorized_rooms("anon_a", vec!["ROOM2345".into()])
            .await;
        assert!(dispatcher.send_to_user("anon_a", thread_created("ROOM2345")).await);
        assert!(!dispatcher.send_to_user("anon_a", thread_created("OTHER234")).await);

        assert_eq!(rx.recv().await.unwrap().share_code(), Some("ROOM2345"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn members_fan_out_skips_other_rooms() {
        let dispatcher = Dispatcher::new();
        let (_, mut rx_a) = dispatcher.register_user_channel("anon_a").await;
        let (_, mut rx_b) = dispatcher.register_user_channel("anon_b").await;
        dispatcher.set_authorized_rooms("anon_a", vec!["ROOM2345".into()]).await;
        dispatcher.set_authorized_rooms("anon_b", vec!["OTHER234".into()]).await;

        assert_eq!(dispatcher.send_to_members(thread_created("ROOM2345")).await, 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn revoke_stops_delivery() {
        let dispatcher = Dispatcher::new();
        let (_, _rx) = dispatcher.register_user_channel("anon_a").await;
        dispatcher.set_authorized_rooms("anon_a", vec![]).await;

        dispatcher.authorize_room("anon_a", "ROOM2345").await;
        assert!(dispatcher.is_authorized("anon_a", "ROOM2345").await);
        dispatcher.revoke_room("anon_a", "ROOM2345").await;
        assert!(!dispatcher.send_to_user("anon_a", thread_created("ROOM2345")).await);
    }

    #[tokio::test]
    async fn stale_connection_cannot_unregister_newer_one() {
        let dispatcher = Dispatcher::new();
        let (old_conn, _old_rx) = dispatcher.register_user_channel("anon_a").await;
        let (new_conn, _new_rx) = dispatcher.register_user_channel("anon_a").await;

        assert!(!dispatcher.unregister_user_channel("anon_a", old_conn).await);
        assert!(dispatcher.unregister_user_channel("anon_a", new_conn).await);
    }

    #[tokio::test]
    async fn room_channel_rejects_personal_events() {
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.subscribe();

        dispatcher.broadcast_to_room(thread_created("ROOM2345"));
        dispatcher.broadcast_to_room(RoomEvent::Pong { id: 1 });
        dispatcher.broadcast_to_room(RoomEvent::UserJoinedRoom {
            share_code: "ROOM2345".into(),
            session_id: "anon_a".into(),
            display_name: "alice".into(),
        });

        assert!(matches!(rx.recv().await.unwrap(), RoomEvent::UserJoinedRoom { .. }));
        assert!(rx.try_recv().is_err());
    }
}
