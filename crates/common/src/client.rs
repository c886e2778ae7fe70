//! WebSocket client for the hub.
//!
//! [`connect`] opens the socket, sends the hello frame, then spawns two
//! background tasks: a writer draining an outbound channel into the socket
//! and a reader decoding text frames into [`WireMessage`]s. Callers only see
//! channels, so a node agent or the gateway never touches the socket itself.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::wire::WireMessage;

/// Capacity of the inbound channel between the reader task and the consumer.
pub const INBOUND_CAPACITY: usize = 1024;

/// Cloneable handle for sending frames to the hub.
#[derive(Debug, Clone)]
pub struct HubSender {
    tx: mpsc::UnboundedSender<WireMessage>,
}

impl HubSender {
    /// A sender backed by a plain channel instead of a socket.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WireMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a frame for the writer task.
    pub fn send(&self, msg: WireMessage) -> Result<(), TransportError> {
        self.tx.send(msg).map_err(|_| TransportError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An established hub connection.
pub struct HubConnection {
    pub sender: HubSender,
    /// Decoded frames from the hub. Yields `None` once the socket is gone.
    pub inbound: mpsc::Receiver<WireMessage>,
    closer: CancellationToken,
}

impl HubConnection {
    /// Token that tears the connection down when cancelled.
    pub fn closer(&self) -> CancellationToken {
        self.closer.clone()
    }

    pub fn into_parts(self) -> (HubSender, mpsc::Receiver<WireMessage>, CancellationToken) {
        (self.sender, self.inbound, self.closer)
    }
}

/// Connect to the hub at `url` and announce ourselves with `hello`.
pub async fn connect(url: &str, hello: WireMessage) -> Result<HubConnection, TransportError> {
    let (socket, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| TransportError::ConnectionFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    let (mut sink, mut stream) = socket.split();

    let hello_json = hello.to_json()?;
    sink.send(Message::text(hello_json))
        .await
        .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;
    info!(
        "Connected to hub {} as {}/{}",
        url, hello.session, hello.party
    );

    let closer = CancellationToken::new();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WireMessage>();
    let (in_tx, in_rx) = mpsc::channel::<WireMessage>(INBOUND_CAPACITY);

    let writer_cancel = closer.clone();
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = writer_cancel.cancelled() => break,
                msg = out_rx.recv() => match msg {
                    Some(m) => m,
                    None => break,
                },
            };
            let text = match msg.to_json() {
                Ok(t) => t,
                Err(e) => {
                    warn!("Dropping unencodable frame: {}", e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::text(text)).await {
                warn!("Hub write failed: {}", e);
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
        writer_cancel.cancel();
        debug!("Hub writer stopped");
    });

    let reader_cancel = closer.clone();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = reader_cancel.cancelled() => break,
                frame = stream.next() => frame,
            };
            match frame {
                Some(Ok(Message::Text(text))) => match WireMessage::from_json(text.as_str()) {
                    Ok(msg) => {
                        if in_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring malformed frame from hub: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Hub read failed: {}", e);
                    break;
                }
            }
        }
        reader_cancel.cancel();
        debug!("Hub reader stopped");
    });

    Ok(HubConnection {
        sender: HubSender { tx: out_tx },
        inbound: in_rx,
        closer,
    })
}
