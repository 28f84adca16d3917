//! Client-side expiry for backends without server-side sandbox timeouts.
//!
//! Every registered sandbox gets an entry with an absolute deadline and an
//! armed timer task. When the timer fires, or the backstop sweep finds the
//! entry overdue, or a client deletes the sandbox explicitly, the registry
//! tears the resource down through the backend's `ResourceReaper`.
//!
//! Per entry: `Armed -> TearingDown -> (removed)`. The status flip happens
//! under the registry lock, so concurrent triggers for the same id collapse
//! into one teardown. Each registration bumps a generation number; a timer
//! from an older registration is ignored when it fires. The lock is a
//! `std::sync::Mutex` and is never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::sandbox::error::SandboxError;
use crate::sandbox::reaper::ResourceReaper;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub sweep_interval: Duration,
    pub stop_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            stop_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Armed,
    TearingDown,
}

/// Snapshot of one registry entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedSandbox {
    pub id: String,
    pub expires_at: DateTime<Utc>,
    pub status: EntryStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// The resource was stopped and removed.
    Removed,
    /// The resource no longer existed; bookkeeping was dropped.
    AlreadyGone,
    /// Another trigger is already tearing this sandbox down.
    Coalesced,
    /// The trigger was superseded: a newer registration or an extension.
    Stale,
    /// Timer or sweep fired for an id the registry no longer tracks.
    NotTracked,
    /// A backend step failed; the entry is armed again for a retry.
    Failed(String),
}

impl TeardownOutcome {
    pub fn is_reclaimed(&self) -> bool {
        matches!(self, TeardownOutcome::Removed | TeardownOutcome::AlreadyGone)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Manual,
    Timer(u64),
    Sweep,
}

struct Entry {
    expires_at: Instant,
    expires_at_wall: DateTime<Utc>,
    status: EntryStatus,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    next_generation: u64,
    closed: bool,
    sweep: Option<JoinHandle<()>>,
}

struct Inner {
    me: Weak<Inner>,
    reaper: Arc<dyn ResourceReaper>,
    config: RegistryConfig,
    state: Mutex<State>,
}

/// Registry of sandbox deadlines. Cheap to clone.
#[derive(Clone)]
pub struct TimeoutRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TimeoutRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutRegistry")
            .field("tracked", &self.inner.lock().entries.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl TimeoutRegistry {
    /// Create the registry and start its sweep. Must run inside a tokio runtime.
    pub fn start(reaper: Arc<dyn ResourceReaper>, config: RegistryConfig) -> Self {
        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            reaper,
            config,
            state: Mutex::new(State::default()),
        });

        let sweep = tokio::spawn(run_sweep(
            Arc::downgrade(&inner),
            inner.config.sweep_interval,
        ));
        inner.lock().sweep = Some(sweep);

        tracing::info!(
            sweep_interval_ms = inner.config.sweep_interval.as_millis() as u64,
            stop_grace_secs = inner.config.stop_grace.as_secs(),
            "timeout registry started"
        );
        Self { inner }
    }

    /// Arm (or re-arm) the deadline of `id` to `now + duration`.
    pub fn register(&self, id: &str, duration: Duration) {
        self.inner.arm(id, duration);
    }

    /// Push the deadline of `id` out to `now + duration`, registering it when
    /// unknown.
    pub fn extend(&self, id: &str, duration: Duration) {
        self.inner.arm(id, duration);
    }

    /// Tear `id` down now. Also runs the backend calls for ids the registry
    /// does not track.
    pub async fn teardown(&self, id: &str) -> TeardownOutcome {
        self.inner.teardown(id, Trigger::Manual).await
    }

    pub fn tracked(&self) -> Vec<TrackedSandbox> {
        let state = self.inner.lock();
        let mut out: Vec<TrackedSandbox> = state
            .entries
            .iter()
            .map(|(id, e)| TrackedSandbox {
                id: id.clone(),
                expires_at: e.expires_at_wall,
                status: e.status,
            })
            .collect();
        out.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    #[cfg(test)]
    pub(crate) fn is_tracked(&self, id: &str) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    /// Stop the sweep and all timers and forget every entry. Backing
    /// resources are left alone.
    pub fn shutdown(&self) {
        let mut state = self.inner.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        if let Some(sweep) = state.sweep.take() {
            sweep.abort();
        }
        let count = state.entries.len();
        for (_, entry) in state.entries.drain() {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
        tracing::info!(dropped_entries = count, "timeout registry shut down");
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Cancel the timer of `id` but keep the entry, leaving it to the sweep.
    #[cfg(test)]
    fn suppress_timer(&self, id: &str) {
        if let Some(entry) = self.inner.lock().entries.get_mut(id) {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn arm(&self, id: &str, duration: Duration) {
        let mut state = self.lock();
        if state.closed {
            tracing::warn!(sandbox_id = %id, "timeout registry is shut down, ignoring registration");
            return;
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let expires_at = deadline_after(duration);
        let expires_at_wall = wall_clock_after(duration);
        let timer = self.spawn_timer(id, generation, expires_at);

        match state.entries.get_mut(id) {
            Some(entry) => {
                if let Some(old) = entry.timer.replace(timer) {
                    old.abort();
                }
                entry.expires_at = expires_at;
                entry.expires_at_wall = expires_at_wall;
                entry.generation = generation;
                tracing::info!(sandbox_id = %id, expires_at = %expires_at_wall, "sandbox timeout extended");
            }
            None => {
                state.entries.insert(
                    id.to_string(),
                    Entry {
                        expires_at,
                        expires_at_wall,
                        status: EntryStatus::Armed,
                        generation,
                        timer: Some(timer),
                    },
                );
                tracing::info!(sandbox_id = %id, expires_at = %expires_at_wall, "sandbox timeout registered");
            }
        }
    }

    fn spawn_timer(&self, id: &str, generation: u64, deadline: Instant) -> JoinHandle<()> {
        let weak = self.me.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            tracing::info!(sandbox_id = %id, "sandbox timeout reached");
            inner.teardown(&id, Trigger::Timer(generation)).await;
        })
    }

    async fn teardown(&self, id: &str, trigger: Trigger) -> TeardownOutcome {
        // Claim the entry.
        let tracked = {
            let mut state = self.lock();
            match state.entries.get_mut(id) {
                Some(entry) => {
                    if let Trigger::Timer(generation) = trigger {
                        if generation != entry.generation {
                            return TeardownOutcome::Stale;
                        }
                    }
                    if entry.status == EntryStatus::TearingDown {
                        tracing::debug!(sandbox_id = %id, ?trigger, "teardown already in progress");
                        return TeardownOutcome::Coalesced;
                    }
                    if trigger == Trigger::Sweep && entry.expires_at > Instant::now() {
                        return TeardownOutcome::Stale;
                    }
                    entry.status = EntryStatus::TearingDown;
                    if let Some(timer) = entry.timer.take() {
                        // A firing timer must not abort its own task.
                        if !matches!(trigger, Trigger::Timer(_)) {
                            timer.abort();
                        }
                    }
                    true
                }
                None if trigger == Trigger::Manual => false,
                None => return TeardownOutcome::NotTracked,
            }
        };

        let result = self.reclaim(id).await;

        let mut state = self.lock();
        match result {
            Ok(outcome) => {
                if let Some(entry) = state.entries.remove(id) {
                    if let Some(timer) = entry.timer {
                        timer.abort();
                    }
                }
                drop(state);
                self.reaper.on_reclaimed(id);
                tracing::info!(sandbox_id = %id, ?trigger, ?outcome, tracked, "sandbox reclaimed");
                outcome
            }
            Err(e) => {
                tracing::error!(sandbox_id = %id, ?trigger, error = %e, "sandbox teardown failed");
                let rearm = match state.entries.get_mut(id) {
                    Some(entry) => {
                        entry.status = EntryStatus::Armed;
                        (entry.timer.is_none() && entry.expires_at > Instant::now())
                            .then_some(entry.expires_at)
                    }
                    None => None,
                };
                if let Some(deadline) = rearm {
                    state.next_generation += 1;
                    let generation = state.next_generation;
                    let timer = self.spawn_timer(id, generation, deadline);
                    if let Some(entry) = state.entries.get_mut(id) {
                        entry.generation = generation;
                        entry.timer = Some(timer);
                    }
                }
                TeardownOutcome::Failed(e.to_string())
            }
        }
    }

    /// Inspect, stop with grace, remove. Absence at any step counts as done.
    async fn reclaim(&self, id: &str) -> Result<TeardownOutcome, SandboxError> {
        let state = match self.reaper.inspect(id).await {
            Ok(Some(state)) => state,
            Ok(None) | Err(SandboxError::NotFound(_)) => {
                tracing::info!(sandbox_id = %id, "sandbox already gone");
                return Ok(TeardownOutcome::AlreadyGone);
            }
            Err(e) => return Err(e),
        };

        if state.running {
            match self.reaper.stop(id, self.config.stop_grace).await {
                Ok(()) => {}
                Err(SandboxError::NotRunning(_)) => {
                    tracing::debug!(sandbox_id = %id, "sandbox already stopped");
                }
                Err(SandboxError::NotFound(_)) => return Ok(TeardownOutcome::AlreadyGone),
                Err(e) => return Err(e),
            }
        }

        match self.reaper.remove(id).await {
            Ok(()) => Ok(TeardownOutcome::Removed),
            Err(SandboxError::NotFound(_)) => Ok(TeardownOutcome::AlreadyGone),
            Err(e) => Err(e),
        }
    }

    async fn sweep_once(&self) -> usize {
        let due: Vec<String> = {
            let state = self.lock();
            let now = Instant::now();
            state
                .entries
                .iter()
                .filter(|(_, e)| e.status == EntryStatus::Armed && e.expires_at <= now)
                .map(|(id, _)| id.clone())
                .collect()
        };
        if due.is_empty() {
            return 0;
        }

        tracing::info!(count = due.len(), "sweeping expired sandboxes");
        let mut reclaimed = 0;
        for id in due {
            if self.teardown(&id, Trigger::Sweep).await.is_reclaimed() {
                reclaimed += 1;
            }
        }
        reclaimed
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(sweep) = state.sweep.take() {
            sweep.abort();
        }
        for entry in state.entries.values_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
    }
}

async fn run_sweep(weak: Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        inner.sweep_once().await;
    }
}

fn deadline_after(duration: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(duration)
        .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 3600))
}

fn wall_clock_after(duration: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
