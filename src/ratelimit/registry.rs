//! Lazily populated map of per-client limiters.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::counter::{WindowSettings, DEFAULT_RESOLUTION};
use super::limiter::{Limiter, LimiterSnapshot};
use super::persistence::{self, duration_nanos, Persistable, PersistenceOptions};
use crate::error::{RatewatchError, Result};
use crate::lifetime::Lifetime;

/// On-disk representation of a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub key_to_limiter: HashMap<String, LimiterSnapshot>,
    /// Window applied to limiters created after the reload
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    pub limit: i64,
    #[serde(default = "default_resolution")]
    pub resolution: u64,
}

fn default_resolution() -> u64 {
    DEFAULT_RESOLUTION
}

/// Hands out one [`Limiter`] per client key, creating it on first use.
///
/// Limiters live as long as the registry; their counters tick inside the
/// registry's [`Lifetime`].
pub struct LimiterRegistry {
    /// Limiters indexed by client key
    limiters: Mutex<HashMap<String, Arc<Limiter>>>,
    /// Window used for new limiters
    settings: WindowSettings,
    /// Ceiling used for new limiters
    limit: i64,
    persistence: Option<PersistenceOptions>,
    lifetime: Lifetime,
}

impl std::fmt::Debug for LimiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterRegistry")
            .field("settings", &self.settings)
            .field("limit", &self.limit)
            .field("keys", &self.len())
            .field("persistence", &self.persistence)
            .finish()
    }
}

impl LimiterRegistry {
    /// Create an empty registry.
    pub fn new(
        settings: WindowSettings,
        limit: i64,
        persistence: Option<PersistenceOptions>,
        lifetime: Lifetime,
    ) -> Self {
        Self {
            limiters: Mutex::new(HashMap::new()),
            settings,
            limit,
            persistence,
            lifetime,
        }
    }

    /// Rebuild a registry from a snapshot.
    ///
    /// Every limiter replays its own missed ticks and is restarted inside
    /// `lifetime` before the registry is returned.
    pub fn from_snapshot(
        snapshot: RegistrySnapshot,
        persistence: Option<PersistenceOptions>,
        lifetime: Lifetime,
    ) -> Result<Self> {
        let settings = WindowSettings::new(snapshot.duration, snapshot.resolution)
            .map_err(|e| RatewatchError::Decode(e.to_string()))?;

        let mut limiters = HashMap::with_capacity(snapshot.key_to_limiter.len());
        for (key, limiter) in snapshot.key_to_limiter {
            let limiter = Limiter::from_snapshot(limiter, &lifetime)
                .map_err(|e| RatewatchError::Decode(format!("limiter for key {key:?}: {e}")))?;
            limiters.insert(key, Arc::new(limiter));
        }

        debug!(
            keys = limiters.len(),
            duration = ?settings.window(),
            limit = snapshot.limit,
            "Restored limiter registry"
        );

        Ok(Self {
            limiters: Mutex::new(limiters),
            settings,
            limit: snapshot.limit,
            persistence,
            lifetime,
        })
    }

    pub fn from_json(
        bytes: &[u8],
        persistence: Option<PersistenceOptions>,
        lifetime: Lifetime,
    ) -> Result<Self> {
        let snapshot = persistence::decode_snapshot(bytes)?;
        Self::from_snapshot(snapshot, persistence, lifetime)
    }

    pub fn from_file(
        path: &Path,
        persistence: Option<PersistenceOptions>,
        lifetime: Lifetime,
    ) -> Result<Self> {
        let snapshot = persistence::read_snapshot(path)?;
        Self::from_snapshot(snapshot, persistence, lifetime)
    }

    /// Restore from `persistence.path` when that file exists, otherwise
    /// start empty.
    pub fn restore_or_new(
        settings: WindowSettings,
        limit: i64,
        persistence: Option<PersistenceOptions>,
        lifetime: Lifetime,
    ) -> Result<Self> {
        let path = match &persistence {
            Some(options) if persistence::snapshot_exists(&options.path)? => options.path.clone(),
            _ => return Ok(Self::new(settings, limit, persistence, lifetime)),
        };

        let registry = Self::from_file(&path, persistence, lifetime)?;
        if registry.limit != limit || registry.settings != settings {
            warn!(
                path = %path.display(),
                limit = registry.limit,
                duration = ?registry.settings.window(),
                "Snapshot limits differ from configuration, keeping the snapshot's"
            );
        }
        Ok(registry)
    }

    /// Get the limiter for `key`, creating and starting it on first use.
    pub fn get(&self, key: &str) -> Arc<Limiter> {
        let mut limiters = self.limiters.lock();

        if let Some(limiter) = limiters.get(key) {
            return Arc::clone(limiter);
        }

        debug!(
            key = %key,
            limit = self.limit,
            window = ?self.settings.window(),
            "Creating new limiter"
        );
        let limiter = Arc::new(Limiter::new(self.settings, self.limit, &self.lifetime));
        limiters.insert(key.to_string(), Arc::clone(&limiter));
        limiter
    }

    /// Number of keys seen so far.
    pub fn len(&self) -> usize {
        self.limiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn settings(&self) -> WindowSettings {
        self.settings
    }

    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    /// Copy the state of every limiter.
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.capture(Utc::now())
    }

    /// Save the registry periodically until its lifetime is cancelled.
    ///
    /// Returns immediately when persistence is disabled.
    pub async fn run(&self) -> Result<()> {
        let Some(options) = &self.persistence else {
            return Ok(());
        };

        info!(
            path = %options.path.display(),
            save_period = ?options.save_period,
            "Starting limiter registry persistence"
        );
        persistence::run_save_loop(self, options, &self.lifetime).await
    }

    /// Spawn [`LimiterRegistry::run`] inside the registry's lifetime.
    pub fn start(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        let registry = Arc::clone(self);
        self.lifetime.spawn(async move { registry.run().await })
    }
}

impl Persistable for LimiterRegistry {
    type Snapshot = RegistrySnapshot;

    fn capture(&self, at: DateTime<Utc>) -> RegistrySnapshot {
        // Only the map copy happens under the registry lock.
        let limiters: Vec<(String, Arc<Limiter>)> = self
            .limiters
            .lock()
            .iter()
            .map(|(key, limiter)| (key.clone(), Arc::clone(limiter)))
            .collect();

        RegistrySnapshot {
            key_to_limiter: limiters
                .into_iter()
                .map(|(key, limiter)| (key, limiter.capture(at)))
                .collect(),
            duration: self.settings.window(),
            limit: self.limit,
            resolution: self.settings.resolution(),
        }
    }

    fn record_save(&self, at: DateTime<Utc>) {
        let limiters: Vec<Arc<Limiter>> = self.limiters.lock().values().cloned().collect();
        for limiter in limiters {
            limiter.counter().record_save(at);
        }
    }
}
