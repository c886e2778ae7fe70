//! round-based delivery over the engine channels.
//!
//! Bridges `round_based`'s `Stream`/`Sink` interface to the agent's
//! [`InboundWire`]/[`OutboundWire`] channels. Payloads are the JSON encoding
//! of the protocol message; indices are 1-based on the wire and 0-based
//! inside round-based.
//!
//! A protocol made of several sub-protocols (keygen followed by aux-info
//! generation) shares one wire channel: each phase prefixes its payloads
//! with a phase byte and [`split_phases`] routes inbound payloads to the
//! matching phase, so early messages for a later phase wait in its queue.
//!
//! Signing with a subset of the keygen parties renumbers them: protocol index
//! `k` is the `k`-th entry of the signer roster, while the wire keeps keygen
//! indices. [`roster_delivery`] translates in both directions.

use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Sink, Stream};
use round_based::{Incoming, MessageDestination, MessageType, Outgoing};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Destination, InboundWire, OutboundWire};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("failed to encode protocol message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("outbound channel closed")]
    Closed,

    #[error("no party at protocol index {0}")]
    UnknownRecipient(u16),
}

/// Stream of decoded protocol messages.
pub struct IncomingStream<M> {
    rx: mpsc::UnboundedReceiver<InboundWire>,
    roster: Option<Vec<u16>>,
    next_id: u64,
    _msg: PhantomData<fn() -> M>,
}

/// Sink of protocol messages, optionally tagged with a phase byte.
pub struct OutgoingSink<M> {
    tx: mpsc::UnboundedSender<OutboundWire>,
    phase: Option<u8>,
    roster: Option<Vec<u16>>,
    _msg: PhantomData<fn(M)>,
}

/// Build a `(Stream, Sink)` pair accepted by `round_based::MpcParty::connected`.
pub fn channel_delivery<M>(
    rx: mpsc::UnboundedReceiver<InboundWire>,
    tx: mpsc::UnboundedSender<OutboundWire>,
    phase: Option<u8>,
) -> (IncomingStream<M>, OutgoingSink<M>) {
    build(rx, tx, phase, None)
}

/// Like [`channel_delivery`] for a run among `roster` (1-based keygen
/// indices, ascending) only. Traffic from parties outside the roster is
/// dropped.
pub fn roster_delivery<M>(
    rx: mpsc::UnboundedReceiver<InboundWire>,
    tx: mpsc::UnboundedSender<OutboundWire>,
    roster: Vec<u16>,
) -> (IncomingStream<M>, OutgoingSink<M>) {
    build(rx, tx, None, Some(roster))
}

fn build<M>(
    rx: mpsc::UnboundedReceiver<InboundWire>,
    tx: mpsc::UnboundedSender<OutboundWire>,
    phase: Option<u8>,
    roster: Option<Vec<u16>>,
) -> (IncomingStream<M>, OutgoingSink<M>) {
    (
        IncomingStream {
            rx,
            roster: roster.clone(),
            next_id: 0,
            _msg: PhantomData,
        },
        OutgoingSink {
            tx,
            phase,
            roster,
            _msg: PhantomData,
        },
    )
}

impl<M: DeserializeOwned> Stream for IncomingStream<M> {
    type Item = Result<Incoming<M>, DeliveryError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let wire = match this.rx.poll_recv(cx) {
                Poll::Ready(Some(wire)) => wire,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            };
            if wire.from == 0 {
                warn!("Dropping protocol message with sender index 0");
                continue;
            }
            let sender = match &this.roster {
                None => wire.from - 1,
                Some(roster) => match roster.iter().position(|&i| i == wire.from) {
                    Some(pos) => pos as u16,
                    None => {
                        debug!("Dropping message from non-signer {}", wire.from);
                        continue;
                    }
                },
            };
            let msg: M = match serde_json::from_slice(&wire.payload) {
                Ok(m) => m,
                Err(e) => {
                    warn!("Dropping undecodable message from party {}: {}", wire.from, e);
                    continue;
                }
            };
            let msg_type = if wire.broadcast {
                MessageType::Broadcast
            } else {
                MessageType::P2P
            };
            let id = this.next_id;
            this.next_id += 1;
            return Poll::Ready(Some(Ok(Incoming {
                id,
                sender,
                msg_type,
                msg,
            })));
        }
    }
}

impl<M: Serialize> Sink<Outgoing<M>> for OutgoingSink<M> {
    type Error = DeliveryError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Outgoing<M>) -> Result<(), Self::Error> {
        let mut payload = Vec::new();
        if let Some(phase) = self.phase {
            payload.push(phase);
        }
        serde_json::to_writer(&mut payload, &item.msg)?;

        let destination = match item.recipient {
            MessageDestination::AllParties => Destination::Broadcast,
            MessageDestination::OneParty(i) => match &self.roster {
                None => Destination::Party(i + 1),
                Some(roster) => Destination::Party(
                    *roster
                        .get(usize::from(i))
                        .ok_or(DeliveryError::UnknownRecipient(i))?,
                ),
            },
        };
        self.tx
            .send(OutboundWire {
                destination,
                payload,
            })
            .map_err(|_| DeliveryError::Closed)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

/// Route phase-tagged payloads from `rx` into `phases` queues, stripping the
/// tag. Untagged or out-of-range payloads are dropped.
pub fn split_phases(
    mut rx: mpsc::UnboundedReceiver<InboundWire>,
    phases: usize,
) -> Vec<mpsc::UnboundedReceiver<InboundWire>> {
    let (senders, receivers): (Vec<_>, Vec<_>) =
        (0..phases).map(|_| mpsc::unbounded_channel::<InboundWire>()).unzip();

    tokio::spawn(async move {
        while let Some(mut wire) = rx.recv().await {
            let Some(&tag) = wire.payload.first() else {
                warn!("Dropping empty payload from party {}", wire.from);
                continue;
            };
            let Some(tx) = senders.get(usize::from(tag)) else {
                warn!("Dropping payload for unknown phase {} from party {}", tag, wire.from);
                continue;
            };
            wire.payload.remove(0);
            if tx.send(wire).is_err() {
                debug!("Phase {} finished; dropping late message", tag);
            }
        }
    });

    receivers
}
