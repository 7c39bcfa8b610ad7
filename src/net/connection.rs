//! Participant connections
//!
//! A connection is a bounded outbound mailbox owned by the session actor plus
//! two pump tasks on the transport side. The actor never waits on a slow
//! client: a full mailbox drops the message.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::game::constants::net as limits;
use crate::game::state::{Action, ParticipantId};
use crate::lobby::actor::{MatchHandle, SubmitError};
use crate::metrics::Metrics;
use crate::net::framing::{read_frame, write_frame, FramingError};
use crate::net::protocol::{decode, encode, ClientMessage, ErrorKind, ServerMessage, WireError};

/// Process-unique connection identifier
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Result of a non-blocking delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Mailbox full, message discarded
    Dropped,
    /// Pumps are gone
    Closed,
}

/// Actor-side end of a connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    participant_id: ParticipantId,
    outbox: mpsc::Sender<Arc<ServerMessage>>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    /// Queue a message without ever blocking
    pub fn deliver(&self, message: Arc<ServerMessage>) -> Delivery {
        match self.outbox.try_send(message) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.outbox.is_closed()
    }
}

/// Create a connection mailbox for `participant_id`.
///
/// The handle goes to the session actor inside a join event; the receiver
/// feeds the outbound pump. Once the actor drops the handle the pump sees the
/// mailbox close and shuts the connection down.
pub fn channel(
    participant_id: ParticipantId,
    capacity: usize,
) -> (ConnectionHandle, mpsc::Receiver<Arc<ServerMessage>>) {
    let (outbox, receiver) = mpsc::channel(capacity.max(1));
    let handle = ConnectionHandle {
        id: next_connection_id(),
        participant_id,
        outbox,
    };
    (handle, receiver)
}

/// Keepalive and write deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Liveness {
    /// Interval between ping probes; must be shorter than `pong_wait`
    pub ping_period: Duration,
    /// Longest silence tolerated from the client
    pub pong_wait: Duration,
    pub write_wait: Duration,
}

impl Default for Liveness {
    fn default() -> Self {
        Self {
            ping_period: limits::PING_PERIOD,
            pong_wait: limits::PONG_WAIT,
            write_wait: limits::WRITE_WAIT,
        }
    }
}

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    ClientClosed,
    ReadTimeout,
    ProtocolError,
    ReadFailed,
    WriteFailed,
    WriteTimeout,
    SessionClosed,
}

/// Transport-side driver for one participant's stream pair
pub struct Connection {
    session: MatchHandle,
    participant_id: ParticipantId,
    connection_id: ConnectionId,
    /// Lets the inbound pump answer the client directly. Weak, so the
    /// mailbox still closes once the actor releases its handle.
    outbox: mpsc::WeakSender<Arc<ServerMessage>>,
    liveness: Liveness,
    metrics: Arc<Metrics>,
}

impl Connection {
    pub fn new(
        session: MatchHandle,
        handle: &ConnectionHandle,
        liveness: Liveness,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            session,
            participant_id: handle.participant_id(),
            connection_id: handle.id(),
            outbox: handle.outbox.downgrade(),
            liveness,
            metrics,
        }
    }

    /// Run both pumps until either ends, then leave the session exactly once
    pub async fn serve<R, W>(
        self,
        mut reader: R,
        mut writer: W,
        mut outbox: mpsc::Receiver<Arc<ServerMessage>>,
    ) -> Departure
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.metrics.connection_opened();

        let departure = tokio::select! {
            d = self.inbound(&mut reader) => d,
            d = self.outbound(&mut writer, &mut outbox) => d,
        };

        let _ = timeout(self.liveness.write_wait, writer.shutdown()).await;
        self.session.leave(self.participant_id, self.connection_id);
        self.metrics.connection_closed();

        info!(
            session_id = %self.session.id(),
            participant_id = %self.participant_id,
            connection_id = self.connection_id,
            reason = ?departure,
            "Connection closed"
        );
        departure
    }

    async fn inbound<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Departure {
        loop {
            let read = read_frame(reader, limits::MAX_INBOUND_FRAME);
            let frame = match timeout(self.liveness.pong_wait, read).await {
                Err(_) => return Departure::ReadTimeout,
                Ok(Err(FramingError::ConnectionClosed)) => return Departure::ClientClosed,
                Ok(Err(FramingError::FrameTooLarge(len, max))) => {
                    warn!(
                        participant_id = %self.participant_id,
                        "Rejected oversized frame: {} bytes (max {})", len, max
                    );
                    return Departure::ProtocolError;
                }
                Ok(Err(FramingError::Io(e))) => {
                    debug!(participant_id = %self.participant_id, "Stream read error: {}", e);
                    return Departure::ReadFailed;
                }
                Ok(Ok(frame)) => frame,
            };

            let message: ClientMessage = match decode(&frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!(participant_id = %self.participant_id, "{}", e);
                    return Departure::ProtocolError;
                }
            };

            let Some(action) = message.action() else {
                continue;
            };

            match self.session.act(self.participant_id, action) {
                Ok(()) => {}
                Err(SubmitError::Busy) => {
                    self.metrics.actions_busy.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        session_id = %self.session.id(),
                        participant_id = %self.participant_id,
                        "Session mailbox full, dropped {:?}", action
                    );
                    self.reply_busy(action);
                }
                Err(SubmitError::Closed) => return Departure::SessionClosed,
            }
        }
    }

    /// Tell the client its action was not admitted; resubmitting is its call
    fn reply_busy(&self, action: Action) {
        let Some(outbox) = self.outbox.upgrade() else {
            return;
        };
        let error = WireError::new(
            ErrorKind::Busy,
            format!("session is busy, {:?} was not applied", action).to_lowercase(),
        );
        if outbox.try_send(Arc::new(ServerMessage::error(error))).is_err() {
            self.metrics.messages_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn outbound<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        outbox: &mut mpsc::Receiver<Arc<ServerMessage>>,
    ) -> Departure {
        let period = self.liveness.ping_period;
        let mut ping = interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let message = tokio::select! {
                message = outbox.recv() => match message {
                    Some(message) => message,
                    None => return Departure::SessionClosed,
                },
                _ = ping.tick() => Arc::new(ServerMessage::ping()),
            };

            let data = match encode(message.as_ref()) {
                Ok(data) => data,
                Err(e) => {
                    warn!("Failed to encode outbound message: {}", e);
                    continue;
                }
            };

            let write = write_frame(writer, &data, limits::MAX_OUTBOUND_FRAME);
            match timeout(self.liveness.write_wait, write).await {
                Err(_) => return Departure::WriteTimeout,
                Ok(Err(e)) => {
                    debug!(participant_id = %self.participant_id, "Stream write error: {}", e);
                    return Departure::WriteFailed;
                }
                Ok(Ok(())) => {}
            }
        }
    }
}
