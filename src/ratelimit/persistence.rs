//! Snapshot persistence for counters and limiter registries.
//!
//! Snapshots are plain JSON documents that are overwritten wholesale on every
//! save. Serialization always works on an owned copy of the state, so no lock
//! is held while touching the file system.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{error, trace};

use crate::error::{RatewatchError, Result};
use crate::lifetime::Lifetime;

/// Where and how often a component writes its snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceOptions {
    /// Snapshot file, overwritten on every save
    pub path: PathBuf,
    /// Interval between two saves
    pub save_period: Duration,
}

impl PersistenceOptions {
    /// Fails with [`RatewatchError::Construction`] on a zero save period.
    pub fn new(path: impl Into<PathBuf>, save_period: Duration) -> Result<Self> {
        if save_period.is_zero() {
            return Err(RatewatchError::Construction(
                "save period must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            path: path.into(),
            save_period,
        })
    }
}

/// On-disk representation of a window counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    /// Window span, in nanoseconds
    #[serde(rename = "windowDuration", with = "duration_nanos")]
    pub window: Duration,
    /// Events counted in the trailing window
    pub counter: i64,
    /// Value of `counter` at the last tick
    pub prev_counter: i64,
    /// Number of ticks per window
    pub resolution: u64,
    /// Per-tick deltas, managed as a ring
    pub counters: Vec<i64>,
    pub head: usize,
    pub tail: usize,
    /// When this state was captured for persistence
    pub saved_at: DateTime<Utc>,
}

/// A component whose state can be written out periodically.
pub trait Persistable {
    type Snapshot: Serialize;

    /// Copy the current state, stamped with `at`.
    fn capture(&self, at: DateTime<Utc>) -> Self::Snapshot;

    /// Called after the snapshot captured at `at` reached the disk.
    fn record_save(&self, _at: DateTime<Utc>) {}
}

/// Serde adapter storing a [`Duration`] as integer nanoseconds.
pub(crate) mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        serializer.serialize_u64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_nanos)
    }
}

/// Check whether a snapshot file is present.
///
/// A missing file is not an error; any other stat failure is.
pub fn snapshot_exists(path: &Path) -> Result<bool> {
    match std::fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(RatewatchError::PersistenceRead {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Read and decode a snapshot file.
pub fn read_snapshot<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read(path).map_err(|source| RatewatchError::PersistenceRead {
        path: path.to_path_buf(),
        source,
    })?;
    decode_snapshot(&contents)
}

/// Decode a snapshot from raw JSON bytes.
pub fn decode_snapshot<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| RatewatchError::Decode(e.to_string()))
}

/// Serialize `snapshot` and replace `path` with it.
///
/// The bytes go to a sibling temporary file first, which is then renamed
/// over `path`, so readers see either the previous snapshot or the new one.
pub async fn write_snapshot<T: Serialize>(path: &Path, snapshot: &T) -> Result<()> {
    let bytes = serde_json::to_vec(snapshot)?;
    let staging = staging_path(path);
    let write_err = |source: io::Error| RatewatchError::PersistenceWrite {
        path: path.to_path_buf(),
        source,
    };

    if let Err(e) = tokio::fs::write(&staging, bytes).await {
        return Err(write_err(e));
    }
    if let Err(e) = tokio::fs::rename(&staging, path).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(write_err(e));
    }
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Save `source` every `options.save_period` until `lifetime` is cancelled.
///
/// A failed save cancels `lifetime` and is returned.
pub(crate) async fn run_save_loop<S: Persistable>(
    source: &S,
    options: &PersistenceOptions,
    lifetime: &Lifetime,
) -> Result<()> {
    if options.save_period.is_zero() {
        lifetime.cancel();
        return Err(RatewatchError::Construction(
            "save period must be greater than zero".to_string(),
        ));
    }

    let mut saves = time::interval_at(Instant::now() + options.save_period, options.save_period);
    saves.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = lifetime.cancelled() => return Ok(()),
            _ = saves.tick() => {
                let at = Utc::now();
                let snapshot = source.capture(at);

                if let Err(e) = write_snapshot(&options.path, &snapshot).await {
                    error!(
                        path = %options.path.display(),
                        error = %e,
                        "Snapshot save failed, stopping"
                    );
                    lifetime.cancel();
                    return Err(e);
                }

                source.record_save(at);
                trace!(path = %options.path.display(), "Snapshot saved");
            }
        }
    }
}
