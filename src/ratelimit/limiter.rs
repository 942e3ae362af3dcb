//! Admission control over a single sliding window.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::counter::{WindowCounter, WindowSettings};
use super::persistence::{CounterSnapshot, Persistable};
use crate::error::Result;
use crate::lifetime::Lifetime;

/// On-disk representation of a limiter: its counter plus the ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterSnapshot {
    #[serde(flatten)]
    pub counter: CounterSnapshot,
    pub limit: i64,
}

/// Admits at most `limit` events per window.
///
/// Safe to share between any number of request handlers.
pub struct Limiter {
    /// Serializes check-then-increase; separate from the counter's own lock
    gate: Mutex<()>,
    counter: Arc<WindowCounter>,
    limit: i64,
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("limit", &self.limit)
            .field("counter", &self.counter)
            .finish()
    }
}

impl Limiter {
    /// Create a limiter and start its counter inside `lifetime`.
    pub fn new(settings: WindowSettings, limit: i64, lifetime: &Lifetime) -> Self {
        Self::with_counter(WindowCounter::with_settings(settings, None), limit, lifetime)
    }

    /// Rebuild a limiter from a snapshot, replaying missed ticks, and start
    /// its counter inside `lifetime`.
    pub fn from_snapshot(snapshot: LimiterSnapshot, lifetime: &Lifetime) -> Result<Self> {
        let counter = WindowCounter::from_snapshot(snapshot.counter, None)?;
        Ok(Self::with_counter(counter, snapshot.limit, lifetime))
    }

    fn with_counter(counter: WindowCounter, limit: i64, lifetime: &Lifetime) -> Self {
        let counter = Arc::new(counter);
        counter.start(lifetime);
        Self {
            gate: Mutex::new(()),
            counter,
            limit,
        }
    }

    /// Admit one event if the window has room for it.
    ///
    /// Returns `false` without recording anything once `limit` events have
    /// been admitted in the trailing window.
    pub fn is_allowed(&self) -> bool {
        let _gate = self.gate.lock();

        let current = self.counter.value();
        if current >= self.limit {
            trace!(current, limit = self.limit, "Limiter rejected event");
            return false;
        }

        self.counter.increase();
        true
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    /// Events admitted in the trailing window.
    pub fn value(&self) -> i64 {
        self.counter.value()
    }

    pub fn counter(&self) -> &Arc<WindowCounter> {
        &self.counter
    }

    /// Copy the current state.
    pub fn snapshot(&self) -> LimiterSnapshot {
        self.capture(Utc::now())
    }

    pub(crate) fn capture(&self, at: DateTime<Utc>) -> LimiterSnapshot {
        LimiterSnapshot {
            counter: self.counter.capture(at),
            limit: self.limit,
        }
    }
}
