//! Session directory
//!
//! Registry of running session actors plus the single "open" session used
//! for undirected matchmaking. The lock guards only the map and the open
//! pointer; it is never held across an await or while waiting on an actor.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::game::constants::{lifecycle, rules};
use crate::game::dice::{DieRoller, RandomDie};
use crate::game::state::{Rules, SessionId, SessionSnapshot};
use crate::lobby::actor::{spawn_match, ActorSettings, MatchHandle};
use crate::metrics::Metrics;
use crate::net::protocol::SessionInfo;

/// Builds the die each new session rolls with
pub type DieFactory = Arc<dyn Fn() -> Box<dyn DieRoller> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectorySettings {
    pub actor: ActorSettings,
    pub max_sessions: usize,
    /// Target used when a caller passes zero
    pub default_target: u32,
    pub max_participants: usize,
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            actor: ActorSettings::default(),
            max_sessions: lifecycle::MAX_SESSIONS,
            default_target: rules::DEFAULT_TARGET_SCORE,
            max_participants: rules::MAX_PARTICIPANTS,
        }
    }
}

/// Directory errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("Too many sessions (max {0})")]
    TooManySessions(usize),
}

struct Registry {
    sessions: HashMap<SessionId, MatchHandle>,
    open: Option<MatchHandle>,
}

pub struct SessionDirectory {
    inner: Mutex<Registry>,
    settings: DirectorySettings,
    metrics: Arc<Metrics>,
    die_factory: DieFactory,
}

impl SessionDirectory {
    pub fn new(settings: DirectorySettings, metrics: Arc<Metrics>) -> Self {
        Self::with_die_factory(settings, metrics, Arc::new(|| {
            Box::new(RandomDie::new()) as Box<dyn DieRoller>
        }))
    }

    /// Directory whose sessions roll with dice from `die_factory`
    pub fn with_die_factory(
        settings: DirectorySettings,
        metrics: Arc<Metrics>,
        die_factory: DieFactory,
    ) -> Self {
        Self {
            inner: Mutex::new(Registry {
                sessions: HashMap::new(),
                open: None,
            }),
            settings,
            metrics,
            die_factory,
        }
    }

    pub fn settings(&self) -> &DirectorySettings {
        &self.settings
    }

    /// Always spawn a fresh session
    pub fn create_new(&self, target: u32) -> Result<MatchHandle, DirectoryError> {
        let mut registry = self.inner.lock();
        self.spawn_locked(&mut registry, target)
    }

    /// Return the open session if it can still take a participant, otherwise
    /// spawn a new one and make it the open session
    pub fn find_or_create(&self, target: u32) -> Result<MatchHandle, DirectoryError> {
        let mut registry = self.inner.lock();

        if let Some(open) = registry.open.as_ref() {
            if Self::accepts_participants(open) {
                return Ok(open.clone());
            }
            debug!(session_id = %open.id(), "Open session no longer joinable");
        }

        let handle = self.spawn_locked(&mut registry, target)?;
        registry.open = Some(handle.clone());
        Ok(handle)
    }

    pub fn get(&self, id: SessionId) -> Option<MatchHandle> {
        self.inner.lock().sessions.get(&id).cloned()
    }

    /// Latest snapshot of one session
    pub fn detail(&self, id: SessionId) -> Option<SessionSnapshot> {
        self.get(id).map(|handle| handle.snapshot())
    }

    /// Listing of every registered session, oldest first
    pub fn list(&self) -> Vec<SessionInfo> {
        let handles: Vec<MatchHandle> = self.inner.lock().sessions.values().cloned().collect();
        let mut sessions: Vec<SessionInfo> = handles
            .iter()
            .map(|handle| {
                let summary = handle.summary();
                SessionInfo::from_snapshot(&summary.snapshot, summary.connections)
            })
            .collect();
        sessions.sort_by_key(|info| info.created_at);
        sessions
    }

    /// Drop the directory's reference to a session
    pub fn remove(&self, id: SessionId) -> Option<MatchHandle> {
        let removed = {
            let mut registry = self.inner.lock();
            let removed = registry.sessions.remove(&id);
            if registry.open.as_ref().is_some_and(|open| open.id() == id) {
                registry.open = None;
            }
            removed
        };
        self.update_gauge();
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn open_session_id(&self) -> Option<SessionId> {
        self.inner.lock().open.as_ref().map(|open| open.id())
    }

    /// Remove sessions that went quiet for longer than `timeout`, finished
    /// with nobody connected, or whose actor has exited. Returns their ids.
    pub fn sweep(&self, timeout: Duration) -> Vec<SessionId> {
        let now = Utc::now();
        let removed: Vec<SessionId> = {
            let mut registry = self.inner.lock();
            let stale: Vec<SessionId> = registry
                .sessions
                .values()
                .filter(|handle| {
                    let summary = handle.summary();
                    let idle = (now - summary.snapshot.last_activity)
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    idle > timeout
                        || (summary.snapshot.over && summary.connections == 0)
                        || !handle.is_running()
                })
                .map(|handle| handle.id())
                .collect();

            for id in &stale {
                registry.sessions.remove(id);
            }
            if registry
                .open
                .as_ref()
                .is_some_and(|open| stale.contains(&open.id()))
            {
                registry.open = None;
            }
            stale
        };

        if !removed.is_empty() {
            self.metrics
                .sessions_evicted
                .fetch_add(removed.len() as u64, Ordering::Relaxed);
            info!("Evicted {} sessions, {} remaining", removed.len(), self.len());
        }
        self.update_gauge();
        removed
    }

    /// Forget every session; actors exit once their last handle is gone
    pub fn shutdown(&self) {
        let count = {
            let mut registry = self.inner.lock();
            registry.open = None;
            let count = registry.sessions.len();
            registry.sessions.clear();
            count
        };
        self.update_gauge();
        info!("Directory shut down, released {} sessions", count);
    }

    fn spawn_locked(
        &self,
        registry: &mut Registry,
        target: u32,
    ) -> Result<MatchHandle, DirectoryError> {
        if registry.sessions.len() >= self.settings.max_sessions {
            return Err(DirectoryError::TooManySessions(self.settings.max_sessions));
        }

        let target = if target == 0 {
            self.settings.default_target
        } else {
            target
        };
        let rules = Rules {
            max_participants: self.settings.max_participants,
            ..Rules::with_target(target)
        };

        let handle = spawn_match(
            Uuid::new_v4(),
            rules,
            self.settings.actor,
            (self.die_factory)(),
            self.metrics.clone(),
        );
        registry.sessions.insert(handle.id(), handle.clone());

        self.metrics.sessions_created.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .sessions_active
            .store(registry.sessions.len() as u64, Ordering::Relaxed);
        info!(session_id = %handle.id(), target, "Session created");
        Ok(handle)
    }

    fn accepts_participants(handle: &MatchHandle) -> bool {
        let snapshot = handle.snapshot();
        handle.is_running()
            && !snapshot.started
            && !snapshot.over
            && snapshot.participants.len() < snapshot.capacity
    }

    fn update_gauge(&self) {
        let len = self.len();
        self.metrics.sessions_active.store(len as u64, Ordering::Relaxed);
    }
}

/// Run `sweep` every `interval` until the returned task is aborted
pub fn spawn_sweeper(
    directory: Arc<SessionDirectory>,
    interval: Duration,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Session sweeper started (every {:?}, timeout {:?})", interval, timeout);
        loop {
            ticker.tick().await;
            let removed = directory.sweep(timeout);
            debug!("Sweep removed {} sessions", removed.len());
        }
    })
}
