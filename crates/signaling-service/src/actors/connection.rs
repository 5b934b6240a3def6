//! `ConnectionActor` - per-client outbound actor.
//!
//! Each `ConnectionActor`:
//! - Owns the write half of exactly one client transport
//! - Serializes every outbound signaling message for that client
//! - Stops when the client goes away or when its token is cancelled
//!
//! The transport itself is abstracted behind [`SignalSink`], so the same actor
//! drives a WebSocket in production and an in-memory channel in tests.

use crate::errors::SignalingError;
use crate::protocol::ServerMessage;

use super::mailbox::MailboxMonitor;
use super::messages::ConnectionMessage;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the connection mailbox.
const CONNECTION_CHANNEL_BUFFER: usize = 200;

/// Write side of a client transport.
#[async_trait]
pub trait SignalSink: Send + 'static {
    /// Deliver one message to the client.
    async fn deliver(&mut self, message: &ServerMessage) -> Result<(), SignalingError>;

    /// Close the transport. Called at most once.
    async fn close(&mut self, _reason: &str) {}
}

/// In-memory sink used by tests and by embedders that do their own framing.
#[async_trait]
impl SignalSink for mpsc::UnboundedSender<ServerMessage> {
    async fn deliver(&mut self, message: &ServerMessage) -> Result<(), SignalingError> {
        self.send(message.clone())
            .map_err(|_| SignalingError::ConnectionClosed("receiver dropped".to_string()))
    }
}

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    connection_id: String,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionHandle {
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Queue a signaling message for the client.
    ///
    /// Waits for mailbox space, so a stalled client slows only its own senders.
    pub async fn send(&self, message: ServerMessage) -> Result<(), SignalingError> {
        self.sender
            .send(ConnectionMessage::Send { message })
            .await
            .map_err(|_| SignalingError::ConnectionClosed(self.connection_id.clone()))?;
        self.mailbox.record_enqueue();
        Ok(())
    }

    /// Queue a signaling message without waiting for mailbox space.
    ///
    /// Fails with `MailboxFull` when the client is not draining its mailbox.
    pub fn try_send(&self, message: ServerMessage) -> Result<(), SignalingError> {
        self.sender
            .try_send(ConnectionMessage::Send { message })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    SignalingError::MailboxFull(self.connection_id.clone())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    SignalingError::ConnectionClosed(self.connection_id.clone())
                }
            })?;
        self.mailbox.record_enqueue();
        Ok(())
    }

    /// Cancel the connection actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    connection_id: String,
    receiver: mpsc::Receiver<ConnectionMessage>,
    sink: Box<dyn SignalSink>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
    is_closing: bool,
}

impl ConnectionActor {
    /// Spawn a new connection actor writing to `sink`.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        connection_id: String,
        sink: impl SignalSink,
        cancel_token: CancellationToken,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);
        let mailbox = Arc::new(MailboxMonitor::new(connection_id.clone()));

        let actor = Self {
            connection_id: connection_id.clone(),
            receiver,
            sink: Box::new(sink),
            cancel_token: cancel_token.clone(),
            mailbox: Arc::clone(&mailbox),
            is_closing: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionHandle {
            sender,
            cancel_token,
            connection_id,
            mailbox,
        };

        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "signaling.actor.connection",
        fields(connection_id = %self.connection_id)
    )]
    async fn run(mut self) {
        debug!(
            target: "signaling.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "signaling.actor.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    self.graceful_close("cancelled").await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            let should_exit = self.handle_message(message).await;
                            self.mailbox.record_dequeue();

                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "signaling.actor.connection",
                                connection_id = %self.connection_id,
                                "ConnectionActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "signaling.actor.connection",
            connection_id = %self.connection_id,
            messages_processed = self.mailbox.messages_processed(),
            peak_depth = self.mailbox.peak_depth(),
            "ConnectionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Send { message } => self.handle_send(message).await,
        }
    }

    /// Write one message to the client. Returns true if the transport is gone.
    async fn handle_send(&mut self, message: ServerMessage) -> bool {
        if self.is_closing {
            warn!(
                target: "signaling.actor.connection",
                connection_id = %self.connection_id,
                kind = message.kind(),
                "Attempted to send message while closing"
            );
            return false;
        }

        debug!(
            target: "signaling.actor.connection",
            connection_id = %self.connection_id,
            kind = message.kind(),
            "Sending message to client"
        );

        match self.sink.deliver(&message).await {
            Ok(()) => false,
            Err(e) => {
                warn!(
                    target: "signaling.actor.connection",
                    connection_id = %self.connection_id,
                    kind = message.kind(),
                    error = %e,
                    "Client transport rejected message, stopping"
                );
                self.is_closing = true;
                true
            }
        }
    }

    async fn graceful_close(&mut self, reason: &str) {
        if self.is_closing {
            return;
        }

        self.is_closing = true;

        debug!(
            target: "signaling.actor.connection",
            connection_id = %self.connection_id,
            reason = %reason,
            "Closing connection"
        );

        self.sink.close(reason).await;
    }
}
