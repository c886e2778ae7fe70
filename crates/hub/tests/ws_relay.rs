//! Relay behaviour over real sockets.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use common::{CommandKind, MessageType, Role, WireMessage};
use hub::{router, Hub, HubConfig};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_hub(config: HubConfig) -> (Arc<Hub>, String) {
    let hub = Arc::new(Hub::new());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(hub.clone(), config);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (hub, format!("ws://{}/ws", addr))
}

async fn open(url: &str) -> Socket {
    let (socket, _) = connect_async(url).await.unwrap();
    socket
}

async fn send(socket: &mut Socket, msg: &WireMessage) {
    socket
        .send(Message::text(msg.to_json().unwrap()))
        .await
        .unwrap();
}

async fn recv(socket: &mut Socket) -> WireMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return WireMessage::from_json(text.as_str()).unwrap();
        }
    }
}

async fn join(url: &str, session: &str, party: &str) -> Socket {
    let mut socket = open(url).await;
    send(&mut socket, &WireMessage::hello(session, party, Role::Node)).await;
    socket
}

async fn wait_for_members(hub: &Hub, session: &str, count: usize) {
    for _ in 0..200 {
        let snap = hub.snapshot().await;
        let members = snap
            .iter()
            .find(|s| s.session == session)
            .map(|s| s.members.len())
            .unwrap_or(0);
        if members == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {session} never reached {count} members");
}

#[tokio::test]
async fn test_relay_routes_between_sockets() {
    let (hub, url) = start_hub(HubConfig::default()).await;
    let mut p1 = join(&url, "cluster", "P1").await;
    let mut p2 = join(&url, "cluster", "P2").await;
    wait_for_members(&hub, "cluster", 2).await;

    let wire = WireMessage::wire("cluster", "P1", vec!["P2".into()], false, "AAEC".into());
    send(&mut p1, &wire).await;
    let got = recv(&mut p2).await;
    assert_eq!(got.kind, MessageType::Send);
    assert_eq!(got.from, "P1");
    assert_eq!(got.payload_b64, "AAEC");

    send(&mut p2, &WireMessage::ping("cluster", "P2")).await;
    assert_eq!(recv(&mut p2).await.kind, MessageType::Pong);
}

#[tokio::test]
async fn test_connection_without_hello_never_joins() {
    let (hub, url) = start_hub(HubConfig::default()).await;
    let mut rogue = open(&url).await;
    send(&mut rogue, &WireMessage::ping("cluster", "P1")).await;

    // The hub hangs up on it.
    let end = tokio::time::timeout(Duration::from_secs(5), rogue.next())
        .await
        .unwrap();
    assert!(matches!(end, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
    assert!(hub.snapshot().await.is_empty());
}

#[tokio::test]
async fn test_hello_timeout_drops_silent_connection() {
    let (hub, url) = start_hub(HubConfig {
        hello_timeout: Duration::from_millis(100),
    })
    .await;
    let mut silent = open(&url).await;
    let end = tokio::time::timeout(Duration::from_secs(5), silent.next())
        .await
        .unwrap();
    assert!(matches!(end, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
    assert!(hub.snapshot().await.is_empty());
}

#[tokio::test]
async fn test_disconnect_purges_session_and_last_command() {
    let (hub, url) = start_hub(HubConfig::default()).await;
    let mut g = join(&url, "cluster", "G").await;
    wait_for_members(&hub, "cluster", 1).await;

    let cmd = WireMessage::command("cluster", "G", CommandKind::Keygen)
        .with_parties(vec!["P1".into()]);
    send(&mut g, &cmd).await;

    // Late joiner sees the remembered command.
    let mut p1 = join(&url, "cluster", "P1").await;
    assert!(recv(&mut p1).await.is_command(CommandKind::Keygen));

    g.close(None).await.unwrap();
    p1.close(None).await.unwrap();
    wait_for_members(&hub, "cluster", 0).await;
    assert!(hub.snapshot().await.is_empty());

    // Fresh join: nothing replayed.
    let mut p1 = join(&url, "cluster", "P1").await;
    wait_for_members(&hub, "cluster", 1).await;
    let quiet = tokio::time::timeout(Duration::from_millis(200), p1.next()).await;
    assert!(quiet.is_err());
}
