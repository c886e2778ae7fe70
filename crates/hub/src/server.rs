//! WebSocket front end for the [`Hub`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use common::WireMessage;

use crate::error::HubError;
use crate::hub::{Hub, SessionSnapshot, OUTBOX_CAPACITY};

/// Runtime settings of the relay.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How long a fresh connection may take to send its hello.
    pub hello_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            hello_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
struct AppState {
    hub: Arc<Hub>,
    config: HubConfig,
}

pub fn router(hub: Arc<Hub>, config: HubConfig) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .route("/sessions", get(list_sessions))
        .with_state(AppState { hub, config })
}

/// Serve the relay on `listener` until `shutdown` resolves, then let open
/// connections finish.
pub async fn serve<F>(
    listener: tokio::net::TcpListener,
    hub: Arc<Hub>,
    config: HubConfig,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(hub, config))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct SessionsResponse {
    sessions: Vec<SessionSnapshot>,
}

async fn list_sessions(State(state): State<AppState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: state.hub.snapshot().await,
    })
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Wait for the opening hello, skipping control frames.
async fn read_hello<S>(stream: &mut S, timeout: Duration) -> Result<WireMessage, HubError>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let first = async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return match WireMessage::from_json(text.as_str()) {
                        Ok(msg) if msg.hello_identity().is_some() => Ok(msg),
                        _ => Err(HubError::InvalidHello),
                    };
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Binary(_))) => return Err(HubError::InvalidHello),
                Some(Ok(Message::Close(_))) | None => return Err(HubError::ClosedBeforeHello),
                Some(Err(e)) => return Err(HubError::Socket(e)),
            }
        }
    };
    tokio::time::timeout(timeout, first)
        .await
        .map_err(|_| HubError::HelloTimeout(timeout))?
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    let hello = match read_hello(&mut stream, state.config.hello_timeout).await {
        Ok(hello) => hello,
        Err(e) => {
            debug!("Dropping connection: {}", e);
            return;
        }
    };
    let session = hello.session.clone();
    let party = hello.party.clone();

    let conn = state.hub.next_connection_id();
    let (outbox, mut rx) = mpsc::channel::<WireMessage>(OUTBOX_CAPACITY);
    state
        .hub
        .join(&session, &party, hello.role, conn, outbox)
        .await;

    // Single writer per socket; routing calls only touch the channel.
    let mut writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match msg.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Dropping unencodable frame: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        let frame = tokio::select! {
            _ = &mut writer => break,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => match WireMessage::from_json(text.as_str()) {
                Ok(msg) => {
                    state.hub.route(&session, &party, msg).await;
                }
                Err(e) => debug!(session = %session, party = %party, "Ignoring malformed frame: {}", e),
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(session = %session, party = %party, "Socket error: {}", e);
                break;
            }
        }
    }

    state.hub.leave(&session, &party, conn).await;
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn frames(items: Vec<Message>) -> impl Stream<Item = Result<Message, axum::Error>> + Unpin {
        stream::iter(items.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn test_serve_returns_on_shutdown_signal() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve(
            listener,
            Arc::new(Hub::new()),
            HubConfig::default(),
            async move {
                let _ = stopped.await;
            },
        ));

        // Up and accepting before the signal.
        tokio::net::TcpStream::connect(addr).await.unwrap();
        stop.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("serve did not stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_hello_accepted_after_control_frames() {
        let hello = WireMessage::hello("s", "P1", common::Role::Node)
            .to_json()
            .unwrap();
        let mut s = frames(vec![
            Message::Ping(Default::default()),
            Message::Text(hello.into()),
        ]);
        let msg = read_hello(&mut s, Duration::from_secs(1)).await.unwrap();
        assert_eq!(msg.hello_identity(), Some(("s", "P1")));
    }

    #[tokio::test]
    async fn test_non_hello_first_frame_rejected() {
        let ping = WireMessage::ping("s", "P1").to_json().unwrap();
        let mut s = frames(vec![Message::Text(ping.into())]);
        assert!(matches!(
            read_hello(&mut s, Duration::from_secs(1)).await,
            Err(HubError::InvalidHello)
        ));

        let mut s = frames(vec![Message::Text(r#"{"type":"hello","party":"P1"}"#.into())]);
        assert!(matches!(
            read_hello(&mut s, Duration::from_secs(1)).await,
            Err(HubError::InvalidHello)
        ));

        let mut s = frames(vec![Message::Text("garbage".into())]);
        assert!(matches!(
            read_hello(&mut s, Duration::from_secs(1)).await,
            Err(HubError::InvalidHello)
        ));

        let mut s = frames(vec![]);
        assert!(matches!(
            read_hello(&mut s, Duration::from_secs(1)).await,
            Err(HubError::ClosedBeforeHello)
        ));
    }

    #[tokio::test]
    async fn test_silent_connection_times_out() {
        let mut s = stream::pending::<Result<Message, axum::Error>>();
        let result = read_hello(&mut s, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(HubError::HelloTimeout(_))));
    }
}
