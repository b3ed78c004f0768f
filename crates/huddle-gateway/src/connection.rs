use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use huddle_db::Database;
use huddle_types::api::Claims;
use huddle_types::events::{RemovalReason, RoomCommand, RoomEvent};
use huddle_types::models::{ParticipantStatus, SessionId, normalize_share_code};

use crate::dispatcher::Dispatcher;
use crate::error::GatewayError;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state every connection needs.
#[derive(Clone)]
pub struct GatewayContext {
    pub dispatcher: Dispatcher,
    pub db: Arc<Database>,
    pub jwt_secret: Arc<str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub session_id: String,
    pub user_id: Option<Uuid>,
}

/// Check an identify token.
///
/// `auth_<userId>` needs a JWT whose subject is that user. `anon_…` must be
/// the id derived from the client's address, when the address is known.
pub fn verify_identity(
    token: &str,
    jwt: Option<&str>,
    jwt_secret: &str,
    client_ip: Option<IpAddr>,
) -> Result<Identity, GatewayError> {
    let session = token
        .parse::<SessionId>()
        .map_err(|e| GatewayError::InvalidToken(e.to_string()))?;

    match session {
        SessionId::User(user_id) => {
            let jwt = jwt.ok_or(GatewayError::JwtRequired)?;
            let data = decode::<Claims>(
                jwt,
                &DecodingKey::from_secret(jwt_secret.as_bytes()),
                &Validation::default(),
            )?;
            if data.claims.sub != user_id {
                return Err(GatewayError::SubjectMismatch);
            }
            Ok(Identity {
                session_id: session.to_string(),
                user_id: Some(user_id),
            })
        }
        SessionId::Anonymous(_) => {
            if let Some(ip) = client_ip {
                if SessionId::from_address(&ip.to_string()) != session {
                    return Err(GatewayError::AddressMismatch);
                }
            }
            Ok(Identity {
                session_id: session.to_string(),
                user_id: None,
            })
        }
    }
}

/// Room channels this connection listens to: share_code -> display name.
#[derive(Clone, Default)]
pub(crate) struct Subscriptions(Arc<RwLock<HashMap<String, String>>>);

impl Subscriptions {
    fn insert(&self, share_code: String, display_name: String) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(share_code, display_name);
    }

    fn remove(&self, share_code: &str) -> Option<String> {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(share_code)
    }

    fn contains(&self, share_code: &str) -> bool {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(share_code)
    }

    fn display_name(&self, share_code: &str) -> Option<String> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(share_code)
            .cloned()
    }

    /// Whether a room broadcast reaches this connection. An event that ends
    /// the session's membership is still delivered, then the room is dropped.
    fn admit(&self, event: &RoomEvent, own_session: &str) -> bool {
        let Some(code) = event.share_code() else {
            return false;
        };
        if !self.contains(code) {
            return false;
        }
        if ends_membership(event, own_session) {
            debug!("{} no longer listening to room {}", own_session, code);
            let _ = self.remove(code);
        }
        true
    }

    fn entries(&self) -> Vec<(String, String)> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(code, name)| (code.clone(), name.clone()))
            .collect()
    }
}

/// Leaving or removal ends one session's membership; expiry ends everyone's.
fn ends_membership(event: &RoomEvent, own_session: &str) -> bool {
    match event {
        RoomEvent::UserLeftRoom { session_id, .. } => session_id == own_session,
        RoomEvent::UserRemovedFromRoom {
            session_id, reason, ..
        } => session_id == own_session || *reason == RemovalReason::RoomExpired,
        _ => false,
    }
}

/// Per-connection state the command handler works against.
pub(crate) struct ConnState {
    identity: Identity,
    subscriptions: Subscriptions,
    /// Direct replies (pong, errors, initial summaries) to this connection only
    reply_tx: mpsc::UnboundedSender<RoomEvent>,
}

impl ConnState {
    fn reply(&self, event: RoomEvent) {
        let _ = self.reply_tx.send(event);
    }
}

/// Handle one WebSocket connection: identify, then the event loop.
pub async fn handle_connection(socket: WebSocket, ctx: GatewayContext, client_ip: Option<IpAddr>) {
    let (mut sender, mut receiver) = socket.split();

    let identity = match wait_for_identify(&mut receiver, &ctx.jwt_secret, client_ip).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!("WebSocket client failed to identify: {}", e);
            if let Some(msg) = encode(&RoomEvent::Error {
                message: e.client_message(),
            }) {
                let _ = sender.send(msg).await;
            }
            return;
        }
    };

    info!("{} connected to gateway", identity.session_id);

    let ready = RoomEvent::Ready {
        session_id: identity.session_id.clone(),
        user_id: identity.user_id,
    };
    let Some(ready) = encode(&ready) else {
        return;
    };
    if sender.send(ready).await.is_err() {
        return;
    }

    run_connection_loop(sender, receiver, ctx, identity).await;
}

async fn wait_for_identify(
    receiver: &mut SplitStream<WebSocket>,
    jwt_secret: &str,
    client_ip: Option<IpAddr>,
) -> Result<Identity, GatewayError> {
    tokio::time::timeout(IDENTIFY_TIMEOUT, read_identify(receiver, jwt_secret, client_ip))
        .await
        .map_err(|_| GatewayError::IdentifyTimeout)?
}

/// Skip frames until the first `identify` command and verify it.
async fn read_identify(
    receiver: &mut SplitStream<WebSocket>,
    jwt_secret: &str,
    client_ip: Option<IpAddr>,
) -> Result<Identity, GatewayError> {
    while let Some(Ok(msg)) = receiver.next().await {
        let Message::Text(text) = msg else { continue };
        let Ok(cmd) = serde_json::from_str::<RoomCommand>(&text) else {
            continue;
        };
        if let RoomCommand::Identify { token, jwt } = &cmd {
            cmd.validate()?;
            return verify_identity(token, jwt.as_deref(), jwt_secret, client_ip);
        }
    }
    Err(GatewayError::Closed)
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    ctx: GatewayContext,
    identity: Identity,
) {
    let dispatcher = ctx.dispatcher.clone();
    let session_id = identity.session_id.clone();

    let (conn_id, mut user_rx) = dispatcher.register_user_channel(&session_id).await;
    let mut broadcast_rx = dispatcher.subscribe();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

    let subscriptions = Subscriptions::default();
    let send_subscriptions = subscriptions.clone();
    let send_session = session_id.clone();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward room broadcasts, personal events and direct replies, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            let event = tokio::select! {
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };
                    if !send_subscriptions.admit(&event, &send_session) {
                        continue;
                    }
                    event
                }
                result = user_rx.recv() => match result {
                    Some(event) => event,
                    None => break,
                },
                result = reply_rx.recv() => match result {
                    Some(event) => event,
                    None => break,
                },
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let Some(msg) = encode(&event) else { continue };
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Read commands from the client
    let state = ConnState {
        identity,
        subscriptions: subscriptions.clone(),
        reply_tx,
    };
    let recv_ctx = ctx.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let cmd = match serde_json::from_str::<RoomCommand>(&text) {
                        Ok(cmd) => cmd,
                        Err(e) => {
                            warn!(
                                "{} bad command: {} -- raw: {}",
                                state.identity.session_id,
                                e,
                                text.chars().take(200).collect::<String>()
                            );
                            state.reply(RoomEvent::Error {
                                message: format!("malformed command: {}", e),
                            });
                            continue;
                        }
                    };
                    if let Err(e) = handle_command(&recv_ctx, &state, cmd).await {
                        debug!("{} command failed: {}", state.identity.session_id, e);
                        state.reply(RoomEvent::Error {
                            message: e.client_message(),
                        });
                    }
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    for (code, display_name) in subscriptions.entries() {
        clear_presence(&dispatcher, &code, &session_id, &display_name).await;
    }
    dispatcher.unregister_user_channel(&session_id, conn_id).await;
    info!("{} disconnected from gateway", session_id);
}

pub(crate) async fn handle_command(
    ctx: &GatewayContext,
    state: &ConnState,
    cmd: RoomCommand,
) -> Result<(), GatewayError> {
    cmd.validate()?;
    let session_id = state.identity.session_id.as_str();

    match cmd {
        RoomCommand::Identify { .. } => return Err(GatewayError::AlreadyIdentified),

        RoomCommand::JoinRoom { share_code } => {
            let code = normalize_share_code(&share_code);
            let display_name = active_display_name(&ctx.db, &code, session_id).await?;

            info!("{} subscribing to room {}", session_id, code);
            state.subscriptions.insert(code.clone(), display_name);
            state.reply(RoomEvent::CrossThreadActivity {
                threads: ctx.dispatcher.activity().summary(&code).await,
                share_code: code,
            });
        }

        RoomCommand::LeaveRoom { share_code } => {
            let code = normalize_share_code(&share_code);
            if let Some(display_name) = state.subscriptions.remove(&code) {
                info!("{} unsubscribing from room {}", session_id, code);
                clear_presence(&ctx.dispatcher, &code, session_id, &display_name).await;
            }
        }

        RoomCommand::JoinUserChannel => {
            let db = ctx.db.clone();
            let session = session_id.to_string();
            let codes = tokio::task::spawn_blocking(move || {
                db.active_share_codes_for_session(&session, Utc::now())
            })
            .await??;
            ctx.dispatcher.set_authorized_rooms(session_id, codes).await;
        }

        RoomCommand::LeaveUserChannel => {
            ctx.dispatcher.clear_authorized_rooms(session_id).await;
        }

        RoomCommand::Typing {
            share_code,
            thread_id,
            is_typing,
        } => {
            let code = normalize_share_code(&share_code);
            let display_name = state
                .subscriptions
                .display_name(&code)
                .ok_or_else(|| GatewayError::NotSubscribed(code.clone()))?;

            ctx.dispatcher
                .activity()
                .set_typing(&code, thread_id, session_id, &display_name, is_typing)
                .await;
            ctx.dispatcher.broadcast_to_room(RoomEvent::UserTyping {
                share_code: code.clone(),
                thread_id,
                session_id: session_id.to_string(),
                display_name,
                is_typing,
            });
            ctx.dispatcher.publish_activity(&code).await;
        }

        RoomCommand::StopAi {
            share_code,
            thread_id,
        } => {
            let code = normalize_share_code(&share_code);
            let display_name = state
                .subscriptions
                .display_name(&code)
                .ok_or_else(|| GatewayError::NotSubscribed(code.clone()))?;

            if !ctx.dispatcher.streams().cancel(&code, thread_id) {
                return Err(GatewayError::NoActiveStream);
            }
            info!("{} stopped the AI stream in {}/{:?}", session_id, code, thread_id);
            ctx.dispatcher.broadcast_to_room(RoomEvent::AiStopped {
                share_code: code,
                thread_id,
                stopped_by: display_name,
            });
        }

        RoomCommand::Ping { id } => state.reply(RoomEvent::Pong { id }),
    }

    Ok(())
}

/// Display name of an active participant of an open room.
async fn active_display_name(
    db: &Arc<Database>,
    share_code: &str,
    session_id: &str,
) -> Result<String, GatewayError> {
    let db = db.clone();
    let code = share_code.to_string();
    let session = session_id.to_string();

    let participant = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let Some(room) = db.get_room_by_share_code(&code)? else {
            return Ok(None);
        };
        if Utc::now() > room.expires_at {
            return Ok(None);
        }
        db.get_participant(&room.id, &session)
    })
    .await??;

    let not_participant = || GatewayError::NotParticipant(share_code.to_string());
    let participant = participant.ok_or_else(not_participant)?;
    if participant.status()? != ParticipantStatus::Active {
        return Err(not_participant());
    }
    Ok(participant.display_name)
}

/// Drop a session's typing/activity in a room and tell the room.
async fn clear_presence(
    dispatcher: &Dispatcher,
    share_code: &str,
    session_id: &str,
    display_name: &str,
) {
    let Some(typing_thread) = dispatcher.activity().remove_session(share_code, session_id).await
    else {
        // Never typed here; the summary may still list it as active
        dispatcher.publish_activity(share_code).await;
        return;
    };
    if let Some(thread_id) = typing_thread {
        debug!("{} stopped typing in {}/{}", session_id, share_code, thread_id);
    }
    dispatcher.broadcast_to_room(RoomEvent::UserTyping {
        share_code: share_code.to_string(),
        thread_id: typing_thread,
        session_id: session_id.to_string(),
        display_name: display_name.to_string(),
        is_typing: false,
    });
    dispatcher.publish_activity(share_code).await;
}

fn encode(event: &RoomEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            warn!("Failed to encode event: {}", e);
            None
        }
    }
}
