//! Owns the gateway link for one signed-in (or anonymous) client.
//!
//! The app constructs a `ConnectionManager`, calls `start`, and then pulls
//! `ManagerEvent`s with `next_event`. Heartbeats, reconnects and re-joining
//! rooms happen inside `next_event`.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use huddle_types::events::{RoomCommand, RoomEvent};

use crate::error::ClientError;
use crate::health::{HealthConfig, HealthMonitor, HealthSignal, HealthStatus};
use crate::sidebar::{Sidebar, SidebarUpdate};
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub struct ClientIdentity {
    /// `auth_<user id>` or `anon_<hash>`
    pub token: String,
    pub jwt: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(2),
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    Ready { session_id: String },
    Room(RoomEvent),
    Sidebar(SidebarUpdate),
    Health(HealthStatus),
    /// Fetch messages newer than `since` for these rooms.
    FetchMissed { since: DateTime<Utc>, rooms: Vec<String> },
    /// A new link is up and every channel was re-joined. History after
    /// `since` may be missing.
    Reconnected { since: DateTime<Utc>, rooms: Vec<String> },
}

enum Step {
    Event(Option<Result<RoomEvent, ClientError>>),
    Signal(HealthSignal),
}

pub struct ConnectionManager<T: Transport> {
    transport: T,
    identity: ClientIdentity,
    health: HealthConfig,
    reconnect: ReconnectConfig,
    monitor: Option<(HealthMonitor, mpsc::UnboundedReceiver<HealthSignal>)>,
    rooms: BTreeSet<String>,
    user_channel: bool,
    sidebar: Sidebar,
    session_id: Option<String>,
    last_seen: DateTime<Utc>,
    reconnecting: bool,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, identity: ClientIdentity, health: HealthConfig, reconnect: ReconnectConfig) -> Self {
        Self {
            transport,
            identity,
            health,
            reconnect,
            monitor: None,
            rooms: BTreeSet::new(),
            user_channel: false,
            sidebar: Sidebar::new(),
            session_id: None,
            last_seen: Utc::now(),
            reconnecting: false,
        }
    }

    /// Connect, identify and begin health checks.
    pub async fn start(&mut self) -> Result<(), ClientError> {
        self.transport.connect().await?;
        self.identify().await?;
        self.monitor = Some(HealthMonitor::start(self.health));
        Ok(())
    }

    /// Stop health checks and close the link.
    pub async fn stop(&mut self) {
        if let Some((mut monitor, _)) = self.monitor.take() {
            monitor.stop().await;
        }
        self.transport.close().await;
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn joined_rooms(&self) -> impl Iterator<Item = &str> {
        self.rooms.iter().map(String::as_str)
    }

    pub fn sidebar(&self) -> &Sidebar {
        &self.sidebar
    }

    pub fn sidebar_mut(&mut self) -> &mut Sidebar {
        &mut self.sidebar
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting
    }

    pub fn health(&self) -> Option<HealthStatus> {
        self.monitor.as_ref().map(|(m, _)| m.status())
    }

    pub async fn join_room(&mut self, share_code: &str) -> Result<(), ClientError> {
        self.transport
            .send(&RoomCommand::JoinRoom {
                share_code: share_code.to_string(),
            })
            .await?;
        self.rooms.insert(share_code.to_string());
        self.sidebar.add_room(share_code);
        Ok(())
    }

    pub async fn leave_room(&mut self, share_code: &str) -> Result<(), ClientError> {
        self.rooms.remove(share_code);
        self.sidebar.remove_room(share_code);
        self.transport
            .send(&RoomCommand::LeaveRoom {
                share_code: share_code.to_string(),
            })
            .await
    }

    /// Subscribe to personal events. `rooms` is the membership list the app
    /// just loaded; it seeds the sidebar.
    pub async fn join_user_channel(&mut self, rooms: Vec<String>) -> Result<(), ClientError> {
        self.transport.send(&RoomCommand::JoinUserChannel).await?;
        self.user_channel = true;
        self.sidebar.repopulate(rooms);
        Ok(())
    }

    pub async fn leave_user_channel(&mut self) -> Result<(), ClientError> {
        self.user_channel = false;
        self.transport.send(&RoomCommand::LeaveUserChannel).await
    }

    pub async fn typing(&mut self, share_code: &str, thread_id: Option<Uuid>, is_typing: bool) -> Result<(), ClientError> {
        self.transport
            .send(&RoomCommand::Typing {
                share_code: share_code.to_string(),
                thread_id,
                is_typing,
            })
            .await
    }

    pub async fn stop_ai(&mut self, share_code: &str, thread_id: Option<Uuid>) -> Result<(), ClientError> {
        self.transport
            .send(&RoomCommand::StopAi {
                share_code: share_code.to_string(),
                thread_id,
            })
            .await
    }

    /// App backgrounded or foregrounded.
    pub fn set_background(&self, background: bool) {
        if let Some((monitor, _)) = &self.monitor {
            monitor.set_background(background);
        }
    }

    pub async fn next_event(&mut self) -> Result<ManagerEvent, ClientError> {
        // A reconnect interrupted by a dropped future picks up where it was
        if self.reconnecting {
            return self.reconnect().await;
        }

        loop {
            let step = {
                let signals = self.monitor.as_mut().map(|(_, rx)| rx);
                tokio::select! {
                    event = self.transport.recv() => Step::Event(event),
                    Some(signal) = next_signal(signals) => Step::Signal(signal),
                }
            };

            match step {
                Step::Event(None) => {
                    warn!("Gateway connection lost");
                    return self.reconnect().await;
                }
                Step::Event(Some(Err(e))) => {
                    if !self.transport.is_connected() {
                        warn!("Gateway connection failed: {}", e);
                        return self.reconnect().await;
                    }
                    warn!("Skipping unreadable gateway frame: {}", e);
                }
                Step::Event(Some(Ok(event))) => {
                    self.last_seen = Utc::now();
                    if let Some(out) = self.on_event(event) {
                        return Ok(out);
                    }
                }
                Step::Signal(signal) => {
                    if let Some(out) = self.on_signal(signal).await? {
                        return Ok(out);
                    }
                }
            }
        }
    }

    fn on_event(&mut self, event: RoomEvent) -> Option<ManagerEvent> {
        match &event {
            RoomEvent::Pong { id } => {
                if let Some((monitor, _)) = &self.monitor {
                    monitor.pong_received(*id);
                }
                return None;
            }
            RoomEvent::Ready { session_id, .. } => {
                self.session_id = Some(session_id.clone());
                return Some(ManagerEvent::Ready {
                    session_id: session_id.clone(),
                });
            }
            RoomEvent::Error { message } => {
                warn!("Gateway rejected a command: {}", message);
                return Some(ManagerEvent::Room(event));
            }
            _ => {}
        }

        if event.is_personal() {
            return self.sidebar.apply(&event).map(ManagerEvent::Sidebar);
        }

        let share_code = event.share_code()?.to_string();
        if !self.rooms.contains(&share_code) {
            debug!("Dropping event for room {} we are not in", share_code);
            return None;
        }
        if let RoomEvent::UserRemovedFromRoom { session_id, .. } = &event {
            if self.session_id.as_deref() == Some(session_id.as_str()) {
                self.rooms.remove(&share_code);
                self.sidebar.remove_room(&share_code);
            }
        }
        Some(ManagerEvent::Room(event))
    }

    async fn on_signal(&mut self, signal: HealthSignal) -> Result<Option<ManagerEvent>, ClientError> {
        match signal {
            HealthSignal::SendPing { id } => {
                if let Err(e) = self.transport.send(&RoomCommand::Ping { id }).await {
                    debug!("Ping {} not sent: {}", id, e);
                }
                Ok(None)
            }
            HealthSignal::StatusChanged(status) => Ok(Some(ManagerEvent::Health(status))),
            HealthSignal::ReconnectNeeded => {
                if self.transport.is_connected() {
                    debug!("Health checks failing but transport still open; not reconnecting");
                    Ok(None)
                } else {
                    self.reconnect().await.map(Some)
                }
            }
            HealthSignal::MissedMessagesRequested { since } => Ok(Some(ManagerEvent::FetchMissed {
                since,
                rooms: self.rooms.iter().cloned().collect(),
            })),
        }
    }

    /// Fixed-delay retries up to `max_attempts`, then give up.
    async fn reconnect(&mut self) -> Result<ManagerEvent, ClientError> {
        self.reconnecting = true;
        self.transport.close().await;

        let max = self.reconnect.max_attempts;
        for attempt in 1..=max {
            info!("Reconnecting in {:?} (attempt {}/{})", self.reconnect.delay, attempt, max);
            tokio::time::sleep(self.reconnect.delay).await;

            match self.resume().await {
                Ok(()) => {
                    self.reconnecting = false;
                    if let Some((monitor, _)) = &self.monitor {
                        monitor.reset_after_reconnect();
                    }
                    let rooms: Vec<String> = self.rooms.iter().cloned().collect();
                    let sidebar_rooms: Vec<String> = self.sidebar.rooms().map(str::to_string).collect();
                    self.sidebar.repopulate(sidebar_rooms);
                    info!("Reconnected; rejoined {} rooms", rooms.len());
                    return Ok(ManagerEvent::Reconnected {
                        since: self.last_seen,
                        rooms,
                    });
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }

        self.reconnecting = false;
        Err(ClientError::ReconnectFailed { attempts: max })
    }

    async fn resume(&mut self) -> Result<(), ClientError> {
        self.transport.connect().await?;
        self.identify().await?;
        let rooms: Vec<String> = self.rooms.iter().cloned().collect();
        for share_code in rooms {
            self.transport.send(&RoomCommand::JoinRoom { share_code }).await?;
        }
        if self.user_channel {
            self.transport.send(&RoomCommand::JoinUserChannel).await?;
        }
        Ok(())
    }

    async fn identify(&mut self) -> Result<(), ClientError> {
        self.transport
            .send(&RoomCommand::Identify {
                token: self.identity.token.clone(),
                jwt: self.identity.jwt.clone(),
            })
            .await?;

        loop {
            match self.transport.recv().await {
                Some(Ok(RoomEvent::Ready { session_id, .. })) => {
                    info!("Identified as {}", session_id);
                    self.session_id = Some(session_id);
                    return Ok(());
                }
                Some(Ok(RoomEvent::Error { message })) => return Err(ClientError::Rejected(message)),
                Some(Ok(other)) => debug!("Ignoring {:?} before ready", other),
                Some(Err(e)) => return Err(e),
                None => return Err(ClientError::NotConnected),
            }
        }
    }
}

async fn next_signal(rx: Option<&mut mpsc::UnboundedReceiver<HealthSignal>>) -> Option<HealthSignal> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
