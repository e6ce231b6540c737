//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::time;

use waypoint_common::id::{prefix, prefixed_ulid};
use waypoint_common::wire::{Body, ConnectedPayload, Envelope, MemberEvent};

use crate::AppState;

use super::fanout::RoomFrame;
use super::registry::RoomPeer;

/// Interval of the liveness sweep. Connections that have not answered a ping
/// by the following sweep are evicted.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Application close code for heartbeat eviction.
const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4009;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let client_id = prefixed_ulid(prefix::CLIENT);
    state.registry.register(&client_id);
    tracing::info!(%client_id, total = state.registry.len(), "client connected");

    let (mut ws_tx, ws_rx) = socket.split();

    // Acknowledge with the generated identity before anything else.
    let ack = Envelope::now(Body::Connected(ConnectedPayload {
        client_id: client_id.clone(),
    }));
    if send_envelope(&mut ws_tx, &ack).await.is_err() {
        state.registry.remove(&client_id);
        return;
    }

    let broadcast_rx = state.broadcast.subscribe();
    run_client(&state, &client_id, ws_tx, ws_rx, broadcast_rx).await;

    // Close and eviction share the leave path: the room hears
    // `member-disconnected` exactly as if the client had sent `leave-trip`.
    if let Some(peer) = state.registry.remove(&client_id) {
        broadcast_member_event(&state, &client_id, &peer, member_disconnected(&client_id, &peer));
    }
    tracing::info!(%client_id, total = state.registry.len(), "client disconnected");
}

/// Main event loop: handle client frames, forward room broadcasts, enforce
/// the liveness sweep.
async fn run_client(
    state: &AppState,
    client_id: &str,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut ws_rx: SplitStream<WebSocket>,
    mut broadcast_rx: broadcast::Receiver<Arc<RoomFrame>>,
) {
    let mut sweep = time::interval(SWEEP_INTERVAL);
    sweep.tick().await; // First tick fires immediately; skip it.

    // Local mirror of the registry's membership, used to filter broadcasts
    // without locking. Only this loop mutates this client's membership.
    let mut joined: Option<String> = state.registry.current_room(client_id);

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let envelope: Envelope = match serde_json::from_str(&text) {
                            Ok(env) => env,
                            Err(e) => {
                                // Malformed frames are dropped; the connection stays up.
                                tracing::debug!(%client_id, error = %e, "unparseable frame");
                                continue;
                            }
                        };
                        if !handle_frame(state, client_id, &mut joined, envelope, &mut ws_tx).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        state.registry.mark_alive(client_id);
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // The socket layer answers pings for us.
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_))) => {
                        tracing::debug!(%client_id, "ignoring binary frame");
                    }
                    Some(Err(e)) => {
                        tracing::debug!(%client_id, error = %e, "ws read error");
                        break;
                    }
                }
            }

            result = broadcast_rx.recv() => {
                match result {
                    Ok(frame) => {
                        let in_room = joined.as_deref() == Some(frame.trip_id.as_str());
                        if !in_room || frame.sender == client_id {
                            continue;
                        }
                        if send_envelope(&mut ws_tx, &frame.envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(%client_id, skipped = n, "client lagged behind room broadcast");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = sweep.tick() => {
                if !state.registry.sweep_alive(client_id) {
                    tracing::info!(%client_id, "heartbeat timeout, evicting client");
                    let _ = send_close(&mut ws_tx, CLOSE_HEARTBEAT_TIMEOUT, "Heartbeat timeout").await;
                    break;
                }
                if ws_tx.send(Message::Ping(axum::body::Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Dispatch one parsed client frame. Returns `false` when the connection
/// should be torn down.
async fn handle_frame(
    state: &AppState,
    client_id: &str,
    joined: &mut Option<String>,
    envelope: Envelope,
    ws_tx: &mut SplitSink<WebSocket, Message>,
) -> bool {
    match envelope.body {
        Body::Ping(_) => {
            // Answered directly, never broadcast.
            send_envelope(ws_tx, &Envelope::now(Body::pong())).await.is_ok()
        }

        Body::JoinTrip(join) => {
            let Some(outcome) =
                state
                    .registry
                    .join(client_id, &join.trip_id, &join.user_id, join.user_name)
            else {
                return true;
            };
            // A join while joined elsewhere is an implicit move: the old
            // room hears `member-left` before the new room hears
            // `member-joined`.
            if let Some(old) = outcome.moved_from {
                broadcast_member_event(state, client_id, &old, member_left(client_id, &old));
            }
            *joined = Some(join.trip_id.clone());
            tracing::debug!(%client_id, trip_id = %join.trip_id, user_id = %join.user_id, "joined trip");
            state.broadcast.relay(RoomFrame {
                trip_id: join.trip_id,
                sender: client_id.to_string(),
                envelope: Envelope::now(Body::MemberJoined(MemberEvent {
                    user_id: Some(join.user_id),
                    client_id: client_id.to_string(),
                })),
            });
            true
        }

        Body::LeaveTrip(_) => {
            if let Some(peer) = state.registry.leave(client_id) {
                tracing::debug!(%client_id, trip_id = %peer.trip_id, "left trip");
                broadcast_member_event(state, client_id, &peer, member_left(client_id, &peer));
            }
            *joined = None;
            true
        }

        Body::PresenceUpdate(mut presence) => {
            // Pure relay: merge the sender's identity, store nothing.
            if let Some(peer) = state.registry.peer(client_id) {
                presence.user_id = Some(peer.user_id);
                state.broadcast.relay(RoomFrame {
                    trip_id: peer.trip_id,
                    sender: client_id.to_string(),
                    envelope: Envelope::now(Body::PresenceUpdate(presence)),
                });
            }
            true
        }

        body @ (Body::Vote(_)
        | Body::Comment(_)
        | Body::ItineraryUpdate(_)
        | Body::PollVote(_)
        | Body::TaskUpdate(_)) => {
            // Domain traffic is relayed verbatim, original timestamp and all.
            if let Some(trip_id) = joined.clone() {
                state.broadcast.relay(RoomFrame {
                    trip_id,
                    sender: client_id.to_string(),
                    envelope: Envelope {
                        body,
                        timestamp: envelope.timestamp,
                    },
                });
            }
            true
        }

        other => {
            tracing::debug!(%client_id, kind = %other.kind(), "unexpected frame from client");
            true
        }
    }
}

fn member_left(client_id: &str, peer: &RoomPeer) -> Envelope {
    Envelope::now(Body::MemberLeft(MemberEvent {
        user_id: Some(peer.user_id.clone()),
        client_id: client_id.to_string(),
    }))
}

fn member_disconnected(client_id: &str, peer: &RoomPeer) -> Envelope {
    Envelope::now(Body::MemberDisconnected(MemberEvent {
        user_id: Some(peer.user_id.clone()),
        client_id: client_id.to_string(),
    }))
}

fn broadcast_member_event(state: &AppState, client_id: &str, peer: &RoomPeer, envelope: Envelope) {
    state.broadcast.relay(RoomFrame {
        trip_id: peer.trip_id.clone(),
        sender: client_id.to_string(),
        envelope,
    });
}

async fn send_envelope(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    envelope: &Envelope,
) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(envelope) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize envelope");
            return Ok(());
        }
    };
    ws_tx.send(Message::Text(json.into())).await
}

async fn send_close(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
