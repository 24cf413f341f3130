//! WebSocket transport to the realtime service
//!
//! A connection is two tasks: a writer that drains the outbound queue in
//! order and a reader that decodes inbound frames and posts them to the
//! engine mailbox. Neither task touches engine state. Closing aborts the
//! reader and signals the writer out of band.

use std::fmt::Display;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;

use super::protocol::{ClientEvent, ServerEvent};
use crate::config::Config;
use crate::engine::{ControlEvent, Mailbox};
use crate::{Error, Result};

/// Outbound queue depth (about ten seconds of 40 ms frames)
pub const OUTBOUND_CAPACITY: usize = 256;

/// Non-blocking sender feeding a connection's writer
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    tx: mpsc::Sender<ClientEvent>,
}

impl OutboundQueue {
    /// Create a bounded queue and its receiving end
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue an event without waiting
    ///
    /// # Errors
    ///
    /// Returns `Error::Send` if the queue is full or the writer is gone
    pub fn send(&self, event: ClientEvent) -> Result<()> {
        let kind = event.kind();
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => Error::Send(format!("outbound queue full, dropped {kind}")),
            TrySendError::Closed(_) => Error::Send(format!("connection closed, dropped {kind}")),
        })
    }

    /// Whether the writer has stopped
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An open session transport
#[derive(Debug)]
pub struct Connection {
    outbound: OutboundQueue,
    reader: Option<JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Connection {
    /// Assemble a connection from its queue, reader task and writer
    /// shutdown signal
    ///
    /// The writer owns the receiving ends of `outbound` and `shutdown`.
    #[must_use]
    pub const fn from_parts(
        outbound: OutboundQueue,
        reader: Option<JoinHandle<()>>,
        shutdown: oneshot::Sender<()>,
    ) -> Self {
        Self {
            outbound,
            reader,
            shutdown: Some(shutdown),
        }
    }

    /// Queue an event for the writer
    ///
    /// # Errors
    ///
    /// Returns `Error::Send` if the event cannot be queued
    pub fn send(&self, event: ClientEvent) -> Result<()> {
        self.outbound.send(event)
    }

    /// Handle for producers outside the engine (the capture callback)
    #[must_use]
    pub const fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    /// Stop reading and tell the writer to close the socket
    ///
    /// Idempotent. The shutdown signal bypasses the outbound queue, so
    /// frames still queued are discarded rather than written.
    pub fn close(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        let _ = shutdown.send(());
        tracing::debug!("connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens transports to the realtime service
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and start the reader/writer tasks, posting to `mailbox`
    ///
    /// # Errors
    ///
    /// Returns error if the handshake fails
    async fn open(&self, config: &Config, mailbox: Mailbox) -> Result<Connection>;
}

/// Connector for the real service over TLS WebSocket
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, config: &Config, mailbox: Mailbox) -> Result<Connection> {
        let url = config.realtime_url()?;

        let mut request = url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&config.bearer_token()?)
            .map_err(|e| Error::Config(format!("invalid API key: {e}")))?;
        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION, bearer);
        headers.insert("openai-beta", HeaderValue::from_static("realtime=v1"));

        tracing::info!(
            host = url.host_str().unwrap_or_default(),
            model = %config.model,
            "connecting to realtime service"
        );

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| Error::Transport(format!("connect failed: {e}")))?;

        tracing::debug!(
            status = %response.status(),
            session = mailbox.session(),
            "websocket established"
        );

        let (sink, source) = stream.split();
        let (outbound, rx) = OutboundQueue::channel(OUTBOUND_CAPACITY);
        let (shutdown, shutdown_rx) = oneshot::channel();

        tokio::spawn(write_loop(sink, rx, shutdown_rx, mailbox.clone()));
        let reader = tokio::spawn(receive_loop(source, mailbox));

        Ok(Connection::from_parts(outbound, Some(reader), shutdown))
    }
}

/// Serialize queued events onto the socket in order
///
/// A failed write is reported to the engine and the next event is still
/// attempted; a socket that is really gone shows up on the reader side.
/// Reports are rate-limited to power-of-two failure counts. The loop ends
/// when `shutdown` fires (or its sender is dropped), sending a close frame
/// without draining what is left in the queue.
pub async fn write_loop<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<ClientEvent>,
    mut shutdown: oneshot::Receiver<()>,
    mailbox: Mailbox,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut failures: u64 = 0;
    loop {
        let event = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let kind = event.kind();
        let result = match serde_json::to_string(&event) {
            Ok(text) => sink.send(Message::Text(text)).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(reason) = result {
            failures += 1;
            if failures.is_power_of_two() {
                tracing::warn!(error = %reason, kind, failures, "websocket write failed");
                mailbox.post(ControlEvent::SendFailed {
                    reason: format!("{kind}: {reason}"),
                });
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
    tracing::debug!(session = mailbox.session(), failures, "writer stopped");
}

/// Decode inbound frames and post them to the engine until the socket ends
///
/// Exactly one [`ControlEvent::TransportClosed`] is posted when the loop
/// exits on its own.
pub async fn receive_loop<St, E>(mut source: St, mailbox: Mailbox)
where
    St: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: Display,
{
    let reason = loop {
        let text = match source.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    mailbox.post(ControlEvent::Malformed {
                        reason: "binary frame is not UTF-8".to_string(),
                    });
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                break Some(frame.map_or_else(
                    || "closed by remote".to_string(),
                    |f| format!("closed by remote ({}): {}", u16::from(f.code), f.reason),
                ));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => break Some(e.to_string()),
            None => break None,
        };

        let posted = match ServerEvent::decode(&text) {
            Ok(event) => mailbox.post(ControlEvent::Server(event)),
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed frame");
                mailbox.post(ControlEvent::Malformed {
                    reason: e.to_string(),
                })
            }
        };
        if !posted {
            tracing::debug!("engine gone, reader stopping");
            return;
        }
    };

    tracing::debug!(session = mailbox.session(), reason = ?reason, "reader stopped");
    mailbox.post(ControlEvent::TransportClosed { reason });
}
