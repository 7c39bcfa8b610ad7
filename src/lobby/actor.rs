//! Per-session actor
//!
//! Each session runs as one tokio task that exclusively owns its
//! `SessionState` and connection map. Join, leave and action events share a
//! single FIFO mailbox so they are applied in arrival order; a periodic tick
//! retires the actor once it has sat without connections for the idle grace.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::game::constants::lifecycle;
use crate::game::dice::DieRoller;
use crate::game::state::{Action, ParticipantId, Rules, SessionId, SessionSnapshot, SessionState};
use crate::metrics::Metrics;
use crate::net::connection::{ConnectionHandle, ConnectionId, Delivery};
use crate::net::protocol::{Outcome, ServerMessage, WireError};

/// Events accepted by a session actor
#[derive(Debug)]
pub enum MatchEvent {
    Join {
        connection: ConnectionHandle,
        name: String,
    },
    Leave {
        participant_id: ParticipantId,
        connection_id: ConnectionId,
    },
    Action {
        participant_id: ParticipantId,
        action: Action,
    },
}

/// Why an event could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("session is busy, try again")]
    Busy,
    #[error("session is closed")]
    Closed,
}

/// What the actor publishes after every event
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub snapshot: SessionSnapshot,
    /// Participants with a registered connection
    pub connections: usize,
}

/// Actor tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorSettings {
    pub mailbox_capacity: usize,
    pub tick_interval: Duration,
    pub idle_grace: Duration,
}

impl Default for ActorSettings {
    fn default() -> Self {
        Self {
            mailbox_capacity: lifecycle::ACTOR_MAILBOX_CAPACITY,
            tick_interval: lifecycle::ACTOR_TICK_INTERVAL,
            idle_grace: lifecycle::IDLE_GRACE,
        }
    }
}

/// Cloneable handle to a running session actor
#[derive(Debug, Clone)]
pub struct MatchHandle {
    id: SessionId,
    events: mpsc::Sender<MatchEvent>,
    summary: watch::Receiver<SessionSummary>,
}

impl MatchHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Latest published summary
    pub fn summary(&self) -> SessionSummary {
        self.summary.borrow().clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.summary.borrow().snapshot.clone()
    }

    /// False once the actor loop has exited
    pub fn is_running(&self) -> bool {
        !self.events.is_closed()
    }

    /// Register a connection under its participant id
    pub fn join(&self, connection: ConnectionHandle, name: String) -> Result<(), SubmitError> {
        self.submit(MatchEvent::Join { connection, name })
    }

    pub fn act(&self, participant_id: ParticipantId, action: Action) -> Result<(), SubmitError> {
        self.submit(MatchEvent::Action {
            participant_id,
            action,
        })
    }

    /// Queue a departure. Never lost: a full mailbox hands it to a task that
    /// waits for room.
    pub fn leave(&self, participant_id: ParticipantId, connection_id: ConnectionId) {
        let event = MatchEvent::Leave {
            participant_id,
            connection_id,
        };
        match self.events.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                let events = self.events.clone();
                tokio::spawn(async move {
                    let _ = events.send(event).await;
                });
            }
        }
    }

    /// Wait until the published summary satisfies `predicate`.
    /// Returns `None` if the actor exits first.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Option<SessionSummary>
    where
        F: FnMut(&SessionSummary) -> bool,
    {
        let mut summary = self.summary.clone();
        let result = summary.wait_for(|s| predicate(s)).await;
        result.ok().map(|s| s.clone())
    }

    fn submit(&self, event: MatchEvent) -> Result<(), SubmitError> {
        self.events.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => SubmitError::Busy,
            TrySendError::Closed(_) => SubmitError::Closed,
        })
    }
}

/// The actor itself; consumed by `run`
pub struct MatchActor {
    state: SessionState,
    connections: HashMap<ParticipantId, ConnectionHandle>,
    events: mpsc::Receiver<MatchEvent>,
    summary: watch::Sender<SessionSummary>,
    die: Box<dyn DieRoller>,
    settings: ActorSettings,
    metrics: Arc<Metrics>,
    idle_since: Option<Instant>,
}

impl MatchActor {
    pub fn new(
        id: SessionId,
        rules: Rules,
        settings: ActorSettings,
        die: Box<dyn DieRoller>,
        metrics: Arc<Metrics>,
    ) -> (Self, MatchHandle) {
        let state = SessionState::new(id, rules);
        let (event_tx, event_rx) = mpsc::channel(settings.mailbox_capacity.max(1));
        let (summary_tx, summary_rx) = watch::channel(SessionSummary {
            snapshot: state.snapshot(),
            connections: 0,
        });

        let actor = Self {
            state,
            connections: HashMap::new(),
            events: event_rx,
            summary: summary_tx,
            die,
            settings,
            metrics,
            idle_since: Some(Instant::now()),
        };
        let handle = MatchHandle {
            id,
            events: event_tx,
            summary: summary_rx,
        };
        (actor, handle)
    }

    /// Event loop; returns when idle, on an invariant breach, or when every
    /// handle is gone
    pub async fn run(mut self) {
        let id = self.state.id();
        let period = self.settings.tick_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(session_id = %id, target = self.state.rules().target_score, "Session actor started");

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else {
                        debug!(session_id = %id, "All handles dropped");
                        break;
                    };

                    let started = std::time::Instant::now();
                    self.handle_event(event);
                    self.metrics.record_event_time(started.elapsed());

                    if let Err(e) = self.state.check_invariants() {
                        error!(session_id = %id, "Terminating session: {}", e);
                        break;
                    }
                    self.publish();
                }
                _ = ticker.tick() => {
                    if self.idle_expired() {
                        info!(session_id = %id, "Session idle, shutting down");
                        break;
                    }
                }
            }
        }

        // Dropping the connection handles closes every outbound pump
        self.connections.clear();
        info!(session_id = %id, "Session actor stopped");
    }

    fn handle_event(&mut self, event: MatchEvent) {
        match event {
            MatchEvent::Join { connection, name } => self.handle_join(connection, name),
            MatchEvent::Leave {
                participant_id,
                connection_id,
            } => self.handle_leave(participant_id, connection_id),
            MatchEvent::Action {
                participant_id,
                action,
            } => self.handle_action(participant_id, action),
        }
    }

    fn handle_join(&mut self, connection: ConnectionHandle, name: String) {
        let pid = connection.participant_id();

        if let Err(e) = self.state.add_participant(pid, name.clone()) {
            debug!(session_id = %self.state.id(), participant_id = %pid, "Join rejected: {}", e);
            self.send_to(&connection, ServerMessage::error(WireError::from(&e)));
            return;
        }

        info!(session_id = %self.state.id(), participant_id = %pid, "{} joined", name);
        self.connections.insert(pid, connection.clone());
        self.idle_since = None;

        self.send_to(&connection, ServerMessage::joined(pid, self.state.snapshot()));
        self.broadcast(ServerMessage::updated(
            pid,
            Outcome::ParticipantJoined { name },
            self.state.snapshot(),
        ));

        if self.state.can_start() {
            match self.state.start() {
                Ok(true) => {
                    info!(session_id = %self.state.id(), "Game started");
                    self.broadcast(ServerMessage::started(self.state.snapshot()));
                }
                Ok(false) => {}
                Err(e) => warn!(session_id = %self.state.id(), "Could not start game: {}", e),
            }
        }
    }

    fn handle_leave(&mut self, pid: ParticipantId, connection_id: ConnectionId) {
        match self.connections.get(&pid) {
            Some(connection) if connection.id() == connection_id => {}
            _ => {
                debug!(session_id = %self.state.id(), participant_id = %pid, "Ignoring stale leave");
                return;
            }
        }
        self.connections.remove(&pid);

        let was_over = self.state.is_over();
        if let Err(e) = self.state.mark_departed(pid) {
            warn!(session_id = %self.state.id(), participant_id = %pid, "Departure failed: {}", e);
        }
        info!(session_id = %self.state.id(), participant_id = %pid, "Participant left");

        self.broadcast(ServerMessage::left(pid, self.state.snapshot()));
        if self.state.is_over() {
            if !was_over {
                self.metrics.games_completed.fetch_add(1, Ordering::Relaxed);
            }
            self.broadcast(ServerMessage::over(pid, None, self.state.snapshot()));
        }

        if self.connections.is_empty() {
            self.idle_since = Some(Instant::now());
        }
        self.state.touch();
    }

    fn handle_action(&mut self, pid: ParticipantId, action: Action) {
        let forfeit_face = self.state.rules().forfeit_face;
        let result = match action {
            Action::Roll => self
                .state
                .apply_roll(pid, self.die.as_mut())
                .map(|value| Outcome::Rolled {
                    value,
                    forfeited: value == forfeit_face,
                }),
            Action::Hold => self
                .state
                .apply_hold(pid)
                .map(|banked| Outcome::Held { banked }),
        };

        match result {
            Ok(outcome) => {
                self.metrics.actions_committed.fetch_add(1, Ordering::Relaxed);
                let snapshot = self.state.snapshot();
                if self.state.is_over() {
                    info!(session_id = %self.state.id(), winner = ?self.state.winner(), "Game over");
                    self.metrics.games_completed.fetch_add(1, Ordering::Relaxed);
                    self.broadcast(ServerMessage::over(pid, Some(outcome), snapshot));
                } else {
                    self.broadcast(ServerMessage::updated(pid, outcome, snapshot));
                }
            }
            Err(e) => {
                self.metrics.actions_rejected.fetch_add(1, Ordering::Relaxed);
                debug!(session_id = %self.state.id(), participant_id = %pid, "{:?} rejected: {}", action, e);
                if let Some(connection) = self.connections.get(&pid) {
                    self.send_to(connection, ServerMessage::error(WireError::from(&e)));
                }
            }
        }
    }

    fn send_to(&self, connection: &ConnectionHandle, message: ServerMessage) {
        self.record_delivery(connection, connection.deliver(Arc::new(message)));
    }

    /// Fan a message out to every registered connection without blocking
    fn broadcast(&self, message: ServerMessage) {
        let message = Arc::new(message);
        for connection in self.connections.values() {
            self.record_delivery(connection, connection.deliver(message.clone()));
        }
    }

    fn record_delivery(&self, connection: &ConnectionHandle, delivery: Delivery) {
        match delivery {
            Delivery::Queued => {
                self.metrics.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
            Delivery::Dropped => {
                self.metrics.messages_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    session_id = %self.state.id(),
                    participant_id = %connection.participant_id(),
                    "Outbound mailbox full, message dropped"
                );
            }
            Delivery::Closed => {
                debug!(
                    session_id = %self.state.id(),
                    participant_id = %connection.participant_id(),
                    "Outbound mailbox closed"
                );
            }
        }
    }

    fn publish(&self) {
        self.summary.send_replace(SessionSummary {
            snapshot: self.state.snapshot(),
            connections: self.connections.len(),
        });
    }

    fn idle_expired(&self) -> bool {
        self.connections.is_empty()
            && self
                .idle_since
                .map_or(false, |since| since.elapsed() >= self.settings.idle_grace)
    }
}

/// Spawn a session actor and return its handle
pub fn spawn_match(
    id: SessionId,
    rules: Rules,
    settings: ActorSettings,
    die: Box<dyn DieRoller>,
    metrics: Arc<Metrics>,
) -> MatchHandle {
    let (actor, handle) = MatchActor::new(id, rules, settings, die, metrics);
    tokio::spawn(actor.run());
    handle
}
