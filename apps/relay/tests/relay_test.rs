use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::time;
use tokio_tungstenite::tungstenite;

use waypoint_relay::config::Config;
use waypoint_relay::AppState;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Helper: start an actual TCP server for WebSocket testing.
/// Returns the bound address; the server runs in the background.
async fn start_server() -> SocketAddr {
    let state = AppState::new(Config::default());
    let app = waypoint_relay::routes::router().with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

/// Helper: connect to `/ws` and consume the `connected` acknowledgement.
/// Returns the stream and the server-assigned client id.
async fn connect(addr: SocketAddr) -> (WsStream, String) {
    let url = format!("ws://{addr}/ws");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");

    let ack = recv_json(&mut ws).await;
    assert_eq!(ack["type"], "connected");
    let client_id = ack["payload"]["clientId"]
        .as_str()
        .expect("clientId present")
        .to_string();
    (ws, client_id)
}

async fn send_json(ws: &mut WsStream, value: serde_json::Value) {
    ws.send(tungstenite::Message::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

/// Read the next text frame as JSON, failing after 5 seconds.
async fn recv_json(ws: &mut WsStream) -> serde_json::Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for frame")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            tungstenite::Message::Text(text) => {
                return serde_json::from_str(&text).expect("parse frame");
            }
            // The server's liveness probes are protocol-level frames.
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Assert that no text frame arrives within the window.
async fn expect_silence(ws: &mut WsStream, window: Duration) {
    let outcome = time::timeout(window, async {
        loop {
            match ws.next().await {
                Some(Ok(tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_))) => continue,
                other => return other,
            }
        }
    })
    .await;
    if let Ok(frame) = outcome {
        panic!("expected silence, got {frame:?}");
    }
}

fn join_trip(trip_id: &str, user_id: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "join-trip",
        "payload": { "tripId": trip_id, "userId": user_id, "userName": user_id },
        "timestamp": "2026-08-30T12:00:00Z"
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connected_ack_carries_generated_client_id() {
    let addr = start_server().await;
    let (_ws, client_id) = connect(addr).await;
    assert!(client_id.starts_with("cli_"));
}

#[tokio::test]
async fn distinct_clients_get_distinct_ids() {
    let addr = start_server().await;
    let (_a, id_a) = connect(addr).await;
    let (_b, id_b) = connect(addr).await;
    assert_ne!(id_a, id_b);
}

#[tokio::test]
async fn ping_is_answered_with_pong_to_sender_only() {
    let addr = start_server().await;
    let (mut a, _) = connect(addr).await;
    let (mut b, _) = connect(addr).await;
    send_json(&mut a, join_trip("t1", "u1")).await;
    send_json(&mut b, join_trip("t1", "u2")).await;
    // Drain B's member-joined for A... A joined first, so only A sees B join.
    let joined = recv_json(&mut a).await;
    assert_eq!(joined["type"], "member-joined");

    send_json(
        &mut a,
        serde_json::json!({ "type": "ping", "payload": {}, "timestamp": "2026-08-30T12:00:00Z" }),
    )
    .await;

    let pong = recv_json(&mut a).await;
    assert_eq!(pong["type"], "pong");
    assert_eq!(pong["payload"], serde_json::json!({}));

    // B shares the room but never hears A's heartbeat.
    expect_silence(&mut b, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn join_fans_out_to_room_members_only() {
    let addr = start_server().await;
    let (mut a, _) = connect(addr).await;
    let (mut c, _) = connect(addr).await;
    send_json(&mut a, join_trip("t1", "u_a")).await;
    send_json(&mut c, join_trip("t2", "u_c")).await;

    let (mut b, b_id) = connect(addr).await;
    send_json(&mut b, join_trip("t1", "u_b")).await;

    let joined = recv_json(&mut a).await;
    assert_eq!(joined["type"], "member-joined");
    assert_eq!(joined["payload"]["userId"], "u_b");
    assert_eq!(joined["payload"]["clientId"], b_id.as_str());

    // The joiner doesn't hear its own announcement, and other rooms hear nothing.
    expect_silence(&mut b, Duration::from_millis(300)).await;
    expect_silence(&mut c, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn domain_frames_are_relayed_verbatim_excluding_sender() {
    let addr = start_server().await;
    let (mut a, _) = connect(addr).await;
    send_json(&mut a, join_trip("t1", "u_a")).await;
    let (mut b, _) = connect(addr).await;
    send_json(&mut b, join_trip("t1", "u_b")).await;
    recv_json(&mut a).await; // b's member-joined

    let vote = serde_json::json!({
        "type": "vote",
        "payload": {
            "activityId": "act_1",
            "memberId": "u_a",
            "voteType": "love"
        },
        "timestamp": "2026-08-30T12:00:00Z"
    });
    send_json(&mut a, vote.clone()).await;

    let relayed = recv_json(&mut b).await;
    assert_eq!(relayed["type"], "vote");
    assert_eq!(relayed["payload"], vote["payload"]);
    // Relay keeps the sender's timestamp rather than stamping its own.
    assert_eq!(relayed["timestamp"], vote["timestamp"]);

    expect_silence(&mut a, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn domain_frames_from_unjoined_clients_are_dropped() {
    let addr = start_server().await;
    let (mut a, _) = connect(addr).await;
    send_json(&mut a, join_trip("t1", "u_a")).await;

    let (mut loner, _) = connect(addr).await;
    send_json(
        &mut loner,
        serde_json::json!({
            "type": "comment",
            "payload": { "text": "hello" },
            "timestamp": "2026-08-30T12:00:00Z"
        }),
    )
    .await;

    expect_silence(&mut a, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn presence_update_merges_sender_user_id() {
    let addr = start_server().await;
    let (mut a, _) = connect(addr).await;
    send_json(&mut a, join_trip("t1", "u_a")).await;
    let (mut b, _) = connect(addr).await;
    send_json(&mut b, join_trip("t1", "u_b")).await;
    recv_json(&mut a).await; // b's member-joined

    send_json(
        &mut b,
        serde_json::json!({
            "type": "presence-update",
            "payload": {
                "userName": "Bea",
                "currentPage": "Itinerary",
                "isOnline": true
            },
            "timestamp": "2026-08-30T12:00:00Z"
        }),
    )
    .await;

    let update = recv_json(&mut a).await;
    assert_eq!(update["type"], "presence-update");
    assert_eq!(update["payload"]["userId"], "u_b");
    assert_eq!(update["payload"]["currentPage"], "Itinerary");
}

#[tokio::test]
async fn leave_trip_notifies_room_and_stops_future_delivery() {
    let addr = start_server().await;
    let (mut a, _) = connect(addr).await;
    send_json(&mut a, join_trip("t1", "u_a")).await;
    let (mut b, b_id) = connect(addr).await;
    send_json(&mut b, join_trip("t1", "u_b")).await;
    recv_json(&mut a).await; // b's member-joined

    send_json(
        &mut b,
        serde_json::json!({
            "type": "leave-trip",
            "payload": { "tripId": "t1", "userId": "u_b" },
            "timestamp": "2026-08-30T12:00:00Z"
        }),
    )
    .await;

    let left = recv_json(&mut a).await;
    assert_eq!(left["type"], "member-left");
    assert_eq!(left["payload"]["userId"], "u_b");
    assert_eq!(left["payload"]["clientId"], b_id.as_str());

    // B is out of the room: A's traffic no longer reaches it.
    send_json(
        &mut a,
        serde_json::json!({
            "type": "comment",
            "payload": { "text": "still here?" },
            "timestamp": "2026-08-30T12:00:00Z"
        }),
    )
    .await;
    expect_silence(&mut b, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn emptied_room_is_recreated_fresh() {
    let addr = start_server().await;
    let (mut a, _) = connect(addr).await;
    send_json(&mut a, join_trip("t1", "u_a")).await;
    send_json(
        &mut a,
        serde_json::json!({
            "type": "leave-trip",
            "payload": {},
            "timestamp": "2026-08-30T12:00:00Z"
        }),
    )
    .await;

    // The room died with its last member; a new pair starts from scratch.
    let (mut b, _) = connect(addr).await;
    send_json(&mut b, join_trip("t1", "u_b")).await;
    let (mut c, c_id) = connect(addr).await;
    send_json(&mut c, join_trip("t1", "u_c")).await;

    let joined = recv_json(&mut b).await;
    assert_eq!(joined["payload"]["userId"], "u_c");
    assert_eq!(joined["payload"]["clientId"], c_id.as_str());

    // A left before the room re-formed and hears none of it.
    expect_silence(&mut a, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn join_while_joined_moves_between_rooms() {
    let addr = start_server().await;
    let (mut old_peer, _) = connect(addr).await;
    send_json(&mut old_peer, join_trip("t1", "u_old")).await;
    let (mut new_peer, _) = connect(addr).await;
    send_json(&mut new_peer, join_trip("t2", "u_new")).await;

    let (mut mover, mover_id) = connect(addr).await;
    send_json(&mut mover, join_trip("t1", "u_m")).await;
    let joined = recv_json(&mut old_peer).await;
    assert_eq!(joined["type"], "member-joined");

    // Second join without leaving: implicit move.
    send_json(&mut mover, join_trip("t2", "u_m")).await;

    let left = recv_json(&mut old_peer).await;
    assert_eq!(left["type"], "member-left");
    assert_eq!(left["payload"]["clientId"], mover_id.as_str());

    let joined = recv_json(&mut new_peer).await;
    assert_eq!(joined["type"], "member-joined");
    assert_eq!(joined["payload"]["userId"], "u_m");
}

#[tokio::test]
async fn socket_close_broadcasts_member_disconnected() {
    let addr = start_server().await;
    let (mut a, _) = connect(addr).await;
    send_json(&mut a, join_trip("t1", "u_a")).await;
    let (mut b, b_id) = connect(addr).await;
    send_json(&mut b, join_trip("t1", "u_b")).await;
    recv_json(&mut a).await; // b's member-joined

    drop(b);

    let gone = recv_json(&mut a).await;
    assert_eq!(gone["type"], "member-disconnected");
    assert_eq!(gone["payload"]["userId"], "u_b");
    assert_eq!(gone["payload"]["clientId"], b_id.as_str());
}

#[tokio::test]
async fn malformed_frames_do_not_kill_the_connection() {
    let addr = start_server().await;
    let (mut a, _) = connect(addr).await;

    a.send(tungstenite::Message::Text("this is not json".into()))
        .await
        .expect("send garbage");
    a.send(tungstenite::Message::Text(
        r#"{"type":"mystery","payload":{},"timestamp":"2026-08-30T12:00:00Z"}"#.into(),
    ))
    .await
    .expect("send unknown type");

    // Still alive and answering.
    send_json(
        &mut a,
        serde_json::json!({ "type": "ping", "payload": {}, "timestamp": "2026-08-30T12:00:00Z" }),
    )
    .await;
    let pong = recv_json(&mut a).await;
    assert_eq!(pong["type"], "pong");
}

#[tokio::test]
async fn health_endpoint_responds() {
    let addr = start_server().await;
    let resp = reqwest::get(format!("http://{addr}/health"))
        .await
        .expect("health request");
    assert!(resp.status().is_success());
    let body: serde_json::Value = resp.json().await.expect("parse health body");
    assert_eq!(body["status"], "ok");
}
