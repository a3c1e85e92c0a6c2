use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use signal_relay::{
    build_router,
    config::Config,
    mock::{FailingStore, MockPeer, MockPeerFactory},
    session::SessionKey,
    storage::{InMemoryStore, NegotiationStore},
    websocket::RelayState,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Relay {
    addr: SocketAddr,
    factory: Arc<MockPeerFactory>,
    state: RelayState,
}

async fn spawn_relay(store: Arc<dyn NegotiationStore>) -> Relay {
    let factory = MockPeerFactory::new();
    let state = RelayState::new(Config::default(), factory.clone(), store);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Relay {
        addr,
        factory,
        state,
    }
}

async fn connect(relay: &Relay, path: &str) -> Client {
    let (ws, _) = connect_async(format!("ws://{}{}", relay.addr, path))
        .await
        .unwrap();
    ws
}

async fn send(ws: &mut Client, frame: Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

async fn recv(ws: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no frame from relay")
            .expect("connection ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Whether the relay ends the connection within a few seconds.
async fn closed_by_relay(ws: &mut Client) -> bool {
    let ended = async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), ended).await.is_ok()
}

fn offer(sdp: &str) -> Value {
    json!({"type": "offer", "data": sdp})
}

fn trickle(candidate: &str, target: u8) -> Value {
    let payload = json!({
        "candidates": {"candidate": candidate, "sdpMid": "0", "sdpMLineIndex": 0},
        "target": target,
    });
    json!({"type": "trickle", "data": payload.to_string()})
}

/// Offer and wait for the answer, which also proves every earlier frame on
/// this connection has been handled.
async fn negotiate(ws: &mut Client, sdp: &str) -> Value {
    send(ws, offer(sdp)).await;
    recv(ws).await
}

#[test_timeout::tokio_timeout_test]
async fn offer_gets_answer_and_answer_is_recorded() {
    let store = InMemoryStore::new();
    let relay = spawn_relay(store.clone()).await;
    let mut ws = connect(&relay, "/ws?room_id=room-id&peer_id=alice").await;

    let answer = negotiate(&mut ws, "v=0\r\no=alice").await;
    assert_eq!(answer["type"], "answer");
    assert_eq!(answer["sdp"], MockPeer::answer_for("v=0\r\no=alice"));

    let record = store.fetch("room-id:alice").await.unwrap().unwrap();
    assert_eq!(
        serde_json::to_value(record.answer.unwrap()).unwrap(),
        answer
    );
}

#[test_timeout::tokio_timeout_test]
async fn duplicate_trickle_is_recorded_once() {
    let store = InMemoryStore::new();
    let relay = spawn_relay(store.clone()).await;
    let mut ws = connect(&relay, "/ws/room-id/bob").await;

    let frame = trickle("candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host", 0);
    send(&mut ws, frame.clone()).await;
    send(&mut ws, frame).await;
    negotiate(&mut ws, "v=0").await;

    let record = store.fetch("room-id:bob").await.unwrap().unwrap();
    assert_eq!(record.ice_candidates.len(), 1);
    assert!(is_registered(&relay, "room-id", "bob"));
}

fn is_registered(relay: &Relay, room: &str, peer: &str) -> bool {
    relay
        .state
        .registry
        .get(&SessionKey::new(room, peer))
        .is_some()
}

#[test_timeout::tokio_timeout_test]
async fn reconnect_replays_trickled_candidates() {
    let relay = spawn_relay(InMemoryStore::new()).await;

    let mut first = connect(&relay, "/ws/room-id/carol").await;
    for n in 0..3 {
        send(&mut first, trickle(&format!("candidate:{n} 1 udp 1 10.0.0.{n} 9 typ host"), n % 2)).await;
    }
    negotiate(&mut first, "v=0").await;
    first.close(None).await.unwrap();
    drop(first);

    let mut second = connect(&relay, "/ws/room-id/carol").await;
    negotiate(&mut second, "v=0").await;

    let peers = relay.factory.peers();
    assert_eq!(peers.len(), 2);
    let replayed: Vec<String> = peers[1]
        .2
        .candidates()
        .into_iter()
        .map(|(candidate, _)| candidate.candidate)
        .collect();
    assert_eq!(
        replayed,
        vec![
            "candidate:0 1 udp 1 10.0.0.0 9 typ host",
            "candidate:1 1 udp 1 10.0.0.1 9 typ host",
            "candidate:2 1 udp 1 10.0.0.2 9 typ host",
        ]
    );
}

#[test_timeout::tokio_timeout_test]
async fn same_key_evicts_previous_connection() {
    let relay = spawn_relay(InMemoryStore::new()).await;

    let mut first = connect(&relay, "/ws/room-id/dave").await;
    negotiate(&mut first, "v=0").await;
    let mut second = connect(&relay, "/ws/room-id/dave").await;
    negotiate(&mut second, "v=0").await;

    assert!(closed_by_relay(&mut first).await);
    let peers = relay.factory.peers();
    assert_eq!(peers[0].2.close_count(), 1);
    assert_eq!(peers[1].2.close_count(), 0);
    assert_eq!(relay.state.registry.len(), 1);

    // The survivor still works.
    negotiate(&mut second, "v=0 again").await;
}

#[test_timeout::tokio_timeout_test]
async fn connections_without_peer_never_collide() {
    let relay = spawn_relay(InMemoryStore::new()).await;
    let mut a = connect(&relay, "/ws?room_id=lobby").await;
    let mut b = connect(&relay, "/ws/lobby").await;
    negotiate(&mut a, "v=0").await;
    negotiate(&mut b, "v=0").await;

    assert_eq!(relay.state.registry.len(), 2);
    let peers = relay.factory.peers();
    assert!(peers.iter().all(|(room, _, _)| room == "lobby"));
    assert_ne!(peers[0].1, peers[1].1);
}

#[test_timeout::tokio_timeout_test]
async fn unreachable_store_still_answers() {
    let relay = spawn_relay(Arc::new(FailingStore)).await;
    let mut ws = connect(&relay, "/ws").await;
    send(&mut ws, trickle("candidate:1", 0)).await;
    let answer = negotiate(&mut ws, "v=0").await;
    assert_eq!(answer["type"], "answer");
}

#[test_timeout::tokio_timeout_test]
async fn malformed_frame_closes_session() {
    let relay = spawn_relay(InMemoryStore::new()).await;
    let mut ws = connect(&relay, "/ws/room-id/erin").await;
    negotiate(&mut ws, "v=0").await;

    ws.send(Message::Text("{not json".into())).await.unwrap();
    assert!(closed_by_relay(&mut ws).await);
    let peers = relay.factory.peers();
    assert_eq!(peers[0].2.close_count(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn bad_payloads_are_tolerated() {
    let relay = spawn_relay(InMemoryStore::new()).await;
    let mut ws = connect(&relay, "/ws/room-id/frank").await;

    send(&mut ws, json!({"type": "trickle", "data": "garbage"})).await;
    send(&mut ws, trickle("candidate:1", 7)).await;
    send(&mut ws, json!({"type": "renegotiate", "data": ""})).await;
    let answer = negotiate(&mut ws, "v=0").await;
    assert_eq!(answer["type"], "answer");
}

#[test_timeout::tokio_timeout_test]
async fn engine_offer_reaches_client_and_is_recorded() {
    let store = InMemoryStore::new();
    let relay = spawn_relay(store.clone()).await;
    relay.factory.offer_on_join("v=0\r\ns=server");
    let mut ws = connect(&relay, "/ws/room-id/gina").await;

    let frame = recv(&mut ws).await;
    assert_eq!(frame, json!({"type": "offer", "sdp": "v=0\r\ns=server"}));

    send(&mut ws, json!({"type": "answer", "data": "v=0\r\ns=client"})).await;
    negotiate(&mut ws, "v=0").await;
    let record = store.fetch("room-id:gina").await.unwrap().unwrap();
    assert_eq!(record.offer.unwrap().sdp, "v=0\r\ns=server");
}
