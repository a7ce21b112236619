//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::{EngineCommand, ReattachOutcome};
use crate::http::middleware::verify_jwt;
use crate::store::with_timeout;
use crate::util::rate_limit::SessionRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// Messages buffered per session before new ones are dropped
const OUTBOX_CAPACITY: usize = 256;

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// JWT token for authentication
    pub token: String,
    /// Match the client was in before it lost its connection
    #[serde(default)]
    pub resume: Option<Uuid>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    // Verify JWT token before upgrading
    match verify_jwt(&query.token, &state.config.supabase_jwt_secret) {
        Ok(claims) => {
            info!(identity = %claims.sub, "WebSocket upgrade for authenticated user");
            let resume = query.resume;
            ws.on_upgrade(move |socket| handle_socket(socket, claims.sub, resume, state))
        }
        Err(e) => {
            error!(error = %e, "WebSocket auth failed");
            (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
        }
    }
}

/// Nickname from the profile, or a generated fallback
async fn resolve_display_name(state: &AppState, user_id: Uuid) -> String {
    let fallback = || format!("Player_{}", &user_id.simple().to_string()[..4]);
    match with_timeout(state.config.tuning.store_timeout, state.store.nickname(user_id)).await {
        Ok(Some(nickname)) => nickname,
        Ok(None) => fallback(),
        Err(e) => {
            warn!(identity = %user_id, error = %e, "Failed to fetch nickname");
            fallback()
        }
    }
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, user_id: Uuid, resume: Option<Uuid>, state: AppState) {
    let (ws_sink, mut ws_stream) = socket.split();
    let display_name = resolve_display_name(&state, user_id).await;

    let (outbox, outbox_rx) = mpsc::channel::<ServerMsg>(OUTBOX_CAPACITY);
    let epoch = state
        .sessions
        .register(user_id, display_name.clone(), outbox.clone());
    info!(identity = %user_id, epoch, name = %display_name, "New WebSocket connection");

    let _ = outbox.try_send(ServerMsg::Welcome {
        user_id,
        display_name,
        server_time: unix_millis(),
    });

    // Spawn writer task: outbox -> WebSocket
    let writer = tokio::spawn(write_outbox(user_id, ws_sink, outbox_rx));

    match state
        .resolver
        .try_reattach(user_id, resume, epoch, outbox.clone())
        .await
    {
        ReattachOutcome::Reattached(match_id) => {
            info!(identity = %user_id, match_id = %match_id, "Session resumed match");
        }
        ReattachOutcome::Refused => {
            let _ = outbox.try_send(ServerMsg::LobbyNotice {
                message: "That match has already started without you".to_string(),
            });
        }
        ReattachOutcome::SpawnAllowed => {}
    }

    let rate_limiter = SessionRateLimiter::new();

    // Reader loop: WebSocket -> services
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if !state.sessions.is_current(user_id, epoch) {
                    debug!(identity = %user_id, epoch, "Superseded session, closing");
                    break;
                }
                if !rate_limiter.check_message() {
                    warn!(identity = %user_id, "Rate limited input message");
                    continue;
                }
                match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(msg) => dispatch(&state, user_id, epoch, &rate_limiter, &outbox, msg).await,
                    Err(e) => {
                        warn!(identity = %user_id, error = %e, "Failed to parse client message");
                        let _ = outbox.try_send(ServerMsg::Error {
                            code: "bad_message".to_string(),
                            message: "Unrecognised message".to_string(),
                        });
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(identity = %user_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(identity = %user_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(identity = %user_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // The running match keeps the combatant; only this session's slot goes
    if let Some(handle) = state.match_registry.match_of(user_id) {
        let _ = handle
            .send(EngineCommand::Detach {
                identity: user_id,
                epoch,
            })
            .await;
    }
    if state.sessions.unregister(user_id, epoch) {
        state.matchmaking.dequeue(user_id);
        let _ = state.rooms.leave(user_id);
    }
    writer.abort();

    info!(identity = %user_id, epoch, "WebSocket connection closed");
}

async fn write_outbox(
    user_id: Uuid,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbox: mpsc::Receiver<ServerMsg>,
) {
    while let Some(msg) = outbox.recv().await {
        if let Err(e) = send_msg(&mut sink, &msg).await {
            debug!(identity = %user_id, error = %e, "WebSocket send failed");
            break;
        }
    }
}

/// Route one client message to the service that owns it
async fn dispatch(
    state: &AppState,
    user_id: Uuid,
    epoch: u64,
    limiter: &SessionRateLimiter,
    outbox: &mpsc::Sender<ServerMsg>,
    msg: ClientMsg,
) {
    let notice = |message: String| {
        let _ = outbox.try_send(ServerMsg::LobbyNotice { message });
    };
    let error = |code: &str, message: String| {
        let _ = outbox.try_send(ServerMsg::Error {
            code: code.to_string(),
            message,
        });
    };
    let display_name = || {
        state
            .sessions
            .display_name(user_id)
            .unwrap_or_else(|| format!("Player_{}", &user_id.simple().to_string()[..4]))
    };

    match msg {
        ClientMsg::Enqueue { mode } => {
            if !limiter.check_enqueue() {
                notice("Too many search attempts, slow down".to_string());
                return;
            }
            if state.rooms.room_of(user_id).is_some() {
                notice("Leave your room before searching".to_string());
                return;
            }
            if let Err(e) = state.matchmaking.enqueue(user_id, display_name(), mode).await {
                notice(e.to_string());
            }
        }
        ClientMsg::CancelSearch => {
            state.matchmaking.dequeue(user_id);
        }
        ClientMsg::SubmitAction { kind, target } => match state.match_registry.match_of(user_id) {
            Some(handle) => {
                let _ = handle
                    .send(EngineCommand::Submit {
                        identity: user_id,
                        epoch,
                        kind,
                        target,
                    })
                    .await;
            }
            None => error("not_in_match", "You are not in a match".to_string()),
        },
        ClientMsg::ToggleReady => match state.match_registry.match_of(user_id) {
            Some(handle) => {
                let _ = handle
                    .send(EngineCommand::ToggleReady {
                        identity: user_id,
                        epoch,
                    })
                    .await;
            }
            None => {
                if let Err(e) = state.rooms.toggle_ready(user_id) {
                    notice(e.to_string());
                }
            }
        },
        ClientMsg::CreateRoom => {
            if state.matchmaking.queued_mode(user_id).is_some() {
                notice("Cancel your search before creating a room".to_string());
                return;
            }
            if let Err(e) = state.rooms.create(user_id, display_name()) {
                notice(e.to_string());
            }
        }
        ClientMsg::JoinRoom { room_id } => {
            if state.matchmaking.queued_mode(user_id).is_some() {
                notice("Cancel your search before joining a room".to_string());
                return;
            }
            if let Err(e) = state.rooms.join(user_id, display_name(), room_id) {
                notice(e.to_string());
            }
        }
        ClientMsg::LeaveRoom => {
            if let Err(e) = state.rooms.leave(user_id) {
                notice(e.to_string());
            }
        }
        ClientMsg::StartRoom => {
            if let Err(e) = state.rooms.start(user_id) {
                notice(e.to_string());
            }
        }
        ClientMsg::LeaveMatch => {
            let Some(handle) = state.match_registry.match_of(user_id) else {
                return;
            };
            // A host walking out of a room match before it starts cancels it
            if handle.record.admin == Some(user_id) && !handle.status.started() {
                match state.instances.abort(handle.id, "The host left").await {
                    Ok(()) => return,
                    Err(e) => debug!(match_id = %handle.id, error = %e, "Abort on host leave rejected"),
                }
            }
            let _ = handle
                .send(EngineCommand::Leave {
                    identity: user_id,
                    epoch,
                })
                .await;
            state.match_registry.unbind_member(user_id, handle.id);
        }
        ClientMsg::Ping { t } => {
            let _ = outbox.try_send(ServerMsg::Pong { t });
        }
    }
}

/// Send a message over WebSocket
async fn send_msg(sink: &mut SplitSink<WebSocket, Message>, msg: &ServerMsg) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json)).await.map_err(|e| e.to_string())
}
