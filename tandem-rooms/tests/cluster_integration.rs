//! Multi-node tests: several gateway nodes sharing one coordination store,
//! both in-process and through a TCP store server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tandem_rooms::{
    CoordinationStore, JwtClaimsDecoder, MemoryStore, RemoteStore, RoomServer, ServerConfig,
    ServerMessage, StoreServer,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_node(store: Arc<dyn CoordinationStore>) -> (RoomServer, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = RoomServer::with_store(ServerConfig::default(), store);
    server.start().await.unwrap();

    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, port)
}

/// Start a store server on a free port, return its address.
async fn start_store_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = StoreServer::new(Arc::new(MemoryStore::default()));
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    addr
}

/// Sits in front of a store server: acks the first subscribe and hangs up,
/// forwards every other connection untouched.
async fn start_flaky_front(upstream: String) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let dropped = Arc::new(AtomicBool::new(false));
    tokio::spawn(async move {
        loop {
            let (mut inbound, _) = listener.accept().await.unwrap();
            let upstream = upstream.clone();
            let dropped = dropped.clone();
            tokio::spawn(async move {
                // Clients send one request and wait, so nothing else is buffered
                let mut first = String::new();
                let mut reader = BufReader::new(&mut inbound);
                if reader.read_line(&mut first).await.unwrap_or(0) == 0 {
                    return;
                }
                drop(reader);

                if first.contains(r#""op":"subscribe""#) && !dropped.swap(true, Ordering::SeqCst) {
                    inbound.write_all(b"{\"ok\":null}\n").await.unwrap();
                    return;
                }
                let mut outbound = TcpStream::connect(&upstream).await.unwrap();
                outbound.write_all(first.as_bytes()).await.unwrap();
                let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
            });
        }
    });
    addr
}

async fn connect(port: u16, room_id: &str, uid: &str) -> Client {
    let token = JwtClaimsDecoder::unsigned_token(uid);
    let url = format!("ws://127.0.0.1:{port}/v7?roomId={room_id}&tok={token}");
    let (client, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    client
}

async fn next_message(client: &mut Client) -> ServerMessage {
    loop {
        match timeout(Duration::from_secs(2), client.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return ServerMessage::decode(text.as_str()).unwrap(),
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

/// Connect, check ROOM_STATE comes first, consume our own USER_JOINED.
async fn join(port: u16, room_id: &str, uid: &str) -> (Client, ServerMessage) {
    let mut client = connect(port, room_id, uid).await;
    let state = next_message(&mut client).await;
    assert!(matches!(state, ServerMessage::RoomState { .. }), "got {state:?}");
    assert_eq!(
        next_message(&mut client).await,
        ServerMessage::UserJoined {
            actor: state.actor(),
            user_id: uid.to_string()
        }
    );
    (client, state)
}

async fn assert_silent(client: &mut Client) {
    let next = timeout(Duration::from_millis(100), client.next()).await;
    assert!(next.is_err(), "expected silence, got {next:?}");
}

/// Alice on node 1, Bob on node 2, same room.
async fn two_node_scenario(store_1: Arc<dyn CoordinationStore>, store_2: Arc<dyn CoordinationStore>) {
    let (node_1, port_1) = start_node(store_1).await;
    let (node_2, port_2) = start_node(store_2).await;

    let (mut alice, _) = join(port_1, "r1", "u1").await;
    let (mut bob, state) = join(port_2, "r1", "u2").await;

    // Ids come from the shared counter; users only list local connections.
    match state {
        ServerMessage::RoomState { actor, users, .. } => {
            assert_eq!(actor, 2);
            assert_eq!(users.keys().copied().collect::<Vec<_>>(), vec![2]);
        }
        other => panic!("expected ROOM_STATE, got {other:?}"),
    }
    assert_eq!(
        next_message(&mut alice).await,
        ServerMessage::UserJoined {
            actor: 2,
            user_id: "u2".to_string()
        }
    );

    // Both nodes see the whole room through the mirror
    let members = node_1.rooms().cluster_members("r1").await.unwrap();
    assert_eq!(members.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(members[&2].user_id, "u2");

    alice.close(None).await.unwrap();
    assert_eq!(
        next_message(&mut bob).await,
        ServerMessage::UserLeft { actor: 1 }
    );

    // Local views diverge: node 1 dropped the room, node 2 still hosts bob
    assert!(!node_1.has_room("r1").await);
    assert!(node_2.has_room("r1").await);
    assert_eq!(node_2.local_connection_ids("r1").await, vec![2]);

    let members = node_2.rooms().cluster_members("r1").await.unwrap();
    assert_eq!(members.keys().copied().collect::<Vec<_>>(), vec![2]);
}

#[tokio::test]
async fn test_two_nodes_shared_memory_store() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::default());
    two_node_scenario(store.clone(), store).await;
}

#[tokio::test]
async fn test_two_nodes_through_store_server() {
    let addr = start_store_server().await;
    let store_1 = Arc::new(RemoteStore::connect(addr.clone()).await.unwrap());
    let store_2 = Arc::new(RemoteStore::connect(addr).await.unwrap());
    two_node_scenario(store_1, store_2).await;
}

#[tokio::test]
async fn test_ids_strictly_increase_across_nodes() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::default());
    let (_node_1, port_1) = start_node(store.clone()).await;
    let (_node_2, port_2) = start_node(store).await;

    let mut clients = Vec::new();
    let mut actors = Vec::new();
    for i in 0..6 {
        let port = if i % 2 == 0 { port_1 } else { port_2 };
        let (client, state) = join(port, "r1", &format!("u{i}")).await;
        actors.push(state.actor());
        clients.push(client);
    }
    assert_eq!(actors, vec![1, 2, 3, 4, 5, 6]);

    // A different room has its own counter
    let (_other, state) = join(port_2, "r2", "u9").await;
    assert_eq!(state.actor(), 1);
}

#[tokio::test]
async fn test_concurrent_joins_get_unique_ids() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::default());
    let (_node_1, port_1) = start_node(store.clone()).await;
    let (node_2, port_2) = start_node(store).await;

    let mut tasks = Vec::new();
    for i in 0..10 {
        let port = if i % 2 == 0 { port_1 } else { port_2 };
        tasks.push(tokio::spawn(async move {
            let mut client = connect(port, "busy", &format!("u{i}")).await;
            let state = next_message(&mut client).await;
            (state.actor(), client)
        }));
    }

    let mut actors = Vec::new();
    let mut clients = Vec::new();
    for task in tasks {
        let (actor, client) = task.await.unwrap();
        actors.push(actor);
        clients.push(client);
    }
    actors.sort();
    assert_eq!(actors, (1..=10).collect::<Vec<_>>());

    let members = node_2.rooms().cluster_members("busy").await.unwrap();
    assert_eq!(members.len(), 10);
}

#[tokio::test]
async fn test_events_stay_in_their_room() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::default());
    let (_node_1, port_1) = start_node(store.clone()).await;
    let (_node_2, port_2) = start_node(store).await;

    let (mut watcher, _) = join(port_1, "quiet", "u1").await;
    let (mut alice, _) = join(port_2, "loud", "u2").await;
    let (_bob, _) = join(port_1, "loud", "u3").await;
    next_message(&mut alice).await;

    alice.send(Message::text("ping")).await.unwrap();
    assert_silent(&mut watcher).await;
}

#[tokio::test]
async fn test_node_recovers_when_store_drops_subscriber() {
    let upstream = start_store_server().await;
    let front = start_flaky_front(upstream).await;
    let store = Arc::new(RemoteStore::connect(front).await.unwrap());
    let (node, port) = start_node(store).await;

    timeout(Duration::from_secs(2), async {
        while node.rooms().relay().stats().resubscribes == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("relay did not resubscribe");

    // Own USER_JOINED comes back through the new subscription
    let (mut alice, _) = join(port, "r1", "u1").await;
    let (_bob, _) = join(port, "r1", "u2").await;
    assert_eq!(
        next_message(&mut alice).await,
        ServerMessage::UserJoined {
            actor: 2,
            user_id: "u2".to_string()
        }
    );
}
