//! WebSocket upgrade handler and session loop

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::app::AppState;
use crate::http::middleware::{verify_session_token, SessionClaims};
use crate::security::SecurityEvent;
use crate::sync::SyncSession;
use crate::util::rate_limit::ConnectionLimiter;
use crate::util::time::{unix_millis, TICK_DURATION_MICROS};
use crate::ws::protocol::{msg_type, Envelope, WelcomeData};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Session token for authentication
    pub token: String,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    // Verify the session token before upgrading
    match verify_session_token(&query.token, &state.config.session_secret) {
        Ok(claims) => {
            info!(session_id = %claims.sid, battle_id = claims.battle_id, "WebSocket upgrade");
            ws.on_upgrade(move |socket| handle_socket(socket, claims, state))
        }
        Err(e) => {
            error!(error = %e, "WebSocket auth failed");
            Response::builder()
                .status(401)
                .body("Unauthorized".into())
                .unwrap()
        }
    }
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, claims: SessionClaims, state: AppState) {
    let session_id = claims.sid;
    info!(session_id = %session_id, "New WebSocket connection");

    let room = state.battles.join(claims.battle_id);
    let mut room_rx = room.subscribe();

    let (security_tx, mut security_rx) = mpsc::unbounded_channel();
    let mut session = SyncSession::new(
        session_id,
        claims.player_id,
        claims.battle_id,
        state.config.session_secret.as_bytes(),
        state.config.rate.clone(),
        state.config.security.clone(),
        security_tx,
    );

    let limiter = ConnectionLimiter::new();
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Send welcome message
    let welcome = Envelope::new(
        msg_type::WELCOME,
        serde_json::to_value(WelcomeData {
            session_id: session_id.to_string(),
            battle_id: claims.battle_id,
            server_time: unix_millis(),
        })
        .unwrap_or_default(),
    );
    if let Err(e) = send_envelope(&mut ws_sink, &mut session, &welcome).await {
        error!(session_id = %session_id, error = %e, "Failed to send welcome");
        state.battles.leave(claims.battle_id);
        return;
    }

    let mut tick_interval = tokio::time::interval(Duration::from_micros(TICK_DURATION_MICROS));
    tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    // Single session loop: the sync core is owned here, and inbound
    // messages are processed in strict arrival order per connection
    'session: loop {
        tokio::select! {
            _ = tick_interval.tick() => {
                for envelope in session.tick() {
                    if let Err(e) = send_envelope(&mut ws_sink, &mut session, &envelope).await {
                        debug!(session_id = %session_id, error = %e, "WebSocket send failed");
                        break 'session;
                    }
                }
            }

            event = room_rx.recv() => {
                match event {
                    Ok(event) => {
                        for envelope in session.on_room_event(event) {
                            if let Err(e) = send_envelope(&mut ws_sink, &mut session, &envelope).await {
                                debug!(session_id = %session_id, error = %e, "WebSocket send failed");
                                break 'session;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(
                            session_id = %session_id,
                            lagged_count = n,
                            "Session lagged, skipping {} room events", n
                        );
                        // Continue - delta full-state fallback absorbs the gap
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(session_id = %session_id, "Room bus closed");
                        break 'session;
                    }
                }
            }

            maybe_event = security_rx.recv() => {
                if let Some(event) = maybe_event {
                    // Enforcement is external; the server's role ends at the signal
                    match event {
                        SecurityEvent::CheatDetected { player_id, reason, suspicion } => {
                            warn!(
                                session_id = %session_id,
                                player_id,
                                reason = %reason,
                                suspicion,
                                "cheat detected"
                            );
                        }
                        SecurityEvent::SecurityViolation { reason } => {
                            warn!(session_id = %session_id, reason = %reason, "security violation");
                        }
                    }
                }
            }

            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !limiter.check_envelope() {
                            warn!(session_id = %session_id, "Rate limited inbound envelope");
                            continue;
                        }
                        session.record_received(text.len());

                        match serde_json::from_str::<Envelope>(&text) {
                            Ok(envelope) => {
                                for reply in session.handle_inbound(envelope, &room) {
                                    if let Err(e) = send_envelope(&mut ws_sink, &mut session, &reply).await {
                                        debug!(session_id = %session_id, error = %e, "WebSocket send failed");
                                        break 'session;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(session_id = %session_id, error = %e, "Failed to parse envelope");
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!(session_id = %session_id, "Received binary message, ignoring");
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        debug!(session_id = %session_id, "WebSocket-level ping/pong");
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(session_id = %session_id, "Client initiated close");
                        break 'session;
                    }
                    Some(Err(e)) => {
                        error!(session_id = %session_id, error = %e, "WebSocket error");
                        break 'session;
                    }
                    None => {
                        break 'session;
                    }
                }
            }
        }
    }

    // Cleanup on disconnect: channel and security state die with the session
    session.forget_channels();
    state.battles.leave(claims.battle_id);

    info!(session_id = %session_id, "WebSocket connection closed");
}

/// Serialize and send one envelope, accounting its bytes
async fn send_envelope(
    sink: &mut SplitSink<WebSocket, Message>,
    session: &mut SyncSession,
    envelope: &Envelope,
) -> Result<(), String> {
    let json = serde_json::to_string(envelope).map_err(|e| e.to_string())?;
    session.record_sent(json.len());
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
