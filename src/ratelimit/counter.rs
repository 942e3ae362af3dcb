//! Sliding-window event counter.
//!
//! The window is split into `resolution` ticks. Increments accumulate in a
//! cumulative counter; at every tick the delta since the previous tick is
//! pushed into a ring buffer, and once the ring is full the oldest delta is
//! subtracted again. The counter therefore always holds the number of events
//! seen during the trailing window, give or take one tick.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

use super::persistence::{self, CounterSnapshot, Persistable, PersistenceOptions};
use crate::error::{RatewatchError, Result};
use crate::lifetime::Lifetime;

/// Default number of ticks per window.
pub const DEFAULT_RESOLUTION: u64 = 1000;
/// Smallest tick period a counter accepts.
pub const MIN_TICK_PERIOD: Duration = Duration::from_millis(1);

/// Validated window span and granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSettings {
    window: Duration,
    resolution: u64,
}

impl WindowSettings {
    /// Validate a window of `window` split into `resolution` ticks.
    pub fn new(window: Duration, resolution: u64) -> Result<Self> {
        if resolution == 0 {
            return Err(RatewatchError::Construction(
                "resolution must be at least 1".to_string(),
            ));
        }
        if usize::try_from(resolution).is_err() {
            return Err(RatewatchError::Construction(format!(
                "resolution {resolution} does not fit in memory"
            )));
        }

        let settings = Self { window, resolution };
        let tick_period = settings.tick_period();
        if tick_period < MIN_TICK_PERIOD {
            return Err(RatewatchError::Construction(format!(
                "tick period {tick_period:?} ({window:?} over {resolution} ticks) is below the minimum of {MIN_TICK_PERIOD:?}"
            )));
        }

        Ok(settings)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn resolution(&self) -> u64 {
        self.resolution
    }

    /// Duration of one tick, truncated to the nanosecond.
    pub fn tick_period(&self) -> Duration {
        let nanos = self.window.as_nanos() / u128::from(self.resolution);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    fn slots(&self) -> usize {
        // Checked in `new`.
        self.resolution as usize
    }
}

/// Mutable counter state, always accessed under the counter's lock.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Ring {
    counter: i64,
    prev_counter: i64,
    slots: Vec<i64>,
    head: usize,
    tail: usize,
}

impl Ring {
    fn new(len: usize) -> Self {
        Self {
            counter: 0,
            prev_counter: 0,
            slots: vec![0; len],
            head: 0,
            tail: 0,
        }
    }

    fn tick(&mut self) {
        let len = self.slots.len();

        self.slots[self.head] = self.counter - self.prev_counter;
        self.head = (self.head + 1) % len;

        // head catching up with tail means the ring is full: the oldest
        // delta leaves the window before its slot is reused.
        if self.head == self.tail {
            self.counter -= self.slots[self.tail];
            self.tail = (self.tail + 1) % len;
        }

        self.prev_counter = self.counter;
    }

    /// Apply `ticks` ticks without new increments.
    ///
    /// After `len + 1` empty ticks every slot holds zero and the ring is full,
    /// so further ticks only rotate `head` and `tail` together.
    fn replay(&mut self, ticks: u64) {
        let len = self.slots.len() as u64;
        let literal = ticks.min(len + 1);

        for _ in 0..literal {
            self.tick();
        }

        let rest = ticks - literal;
        if rest > 0 {
            self.head = (self.head + (rest % len) as usize) % self.slots.len();
            self.tail = self.head;
        }
    }
}

/// A thread-safe approximate sliding-window counter.
///
/// Shared through an [`Arc`]; the background tick loop is started with
/// [`WindowCounter::start`] and stops when its [`Lifetime`] is cancelled.
pub struct WindowCounter {
    settings: WindowSettings,
    ring: Mutex<Ring>,
    persistence: Option<PersistenceOptions>,
    saved_at: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for WindowCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowCounter")
            .field("settings", &self.settings)
            .field("value", &self.value())
            .field("persistence", &self.persistence)
            .finish()
    }
}

impl WindowCounter {
    /// Create an empty counter, validating the window configuration.
    pub fn new(
        window: Duration,
        resolution: u64,
        persistence: Option<PersistenceOptions>,
    ) -> Result<Self> {
        let settings = WindowSettings::new(window, resolution)?;
        Ok(Self::with_settings(settings, persistence))
    }

    /// Create an empty counter from already validated settings.
    pub fn with_settings(settings: WindowSettings, persistence: Option<PersistenceOptions>) -> Self {
        Self {
            settings,
            ring: Mutex::new(Ring::new(settings.slots())),
            persistence,
            saved_at: Mutex::new(None),
        }
    }

    /// Rebuild a counter from a snapshot, replaying the ticks missed since it
    /// was saved.
    pub fn from_snapshot(
        snapshot: CounterSnapshot,
        persistence: Option<PersistenceOptions>,
    ) -> Result<Self> {
        Self::restore(snapshot, persistence, Utc::now())
    }

    /// Rebuild a counter from JSON snapshot bytes.
    pub fn from_json(bytes: &[u8], persistence: Option<PersistenceOptions>) -> Result<Self> {
        let snapshot = persistence::decode_snapshot(bytes)?;
        Self::from_snapshot(snapshot, persistence)
    }

    /// Rebuild a counter from a snapshot file.
    pub fn from_file(path: &Path, persistence: Option<PersistenceOptions>) -> Result<Self> {
        let snapshot = persistence::read_snapshot(path)?;
        Self::from_snapshot(snapshot, persistence)
    }

    /// Restore from `persistence.path` when that file exists, otherwise
    /// start empty with `settings`.
    pub fn restore_or_new(
        settings: WindowSettings,
        persistence: Option<PersistenceOptions>,
    ) -> Result<Self> {
        let path = match &persistence {
            Some(options) if persistence::snapshot_exists(&options.path)? => options.path.clone(),
            _ => return Ok(Self::with_settings(settings, persistence)),
        };

        let counter = Self::from_file(&path, persistence)?;
        if counter.settings != settings {
            warn!(
                path = %path.display(),
                window = ?counter.settings.window,
                resolution = counter.settings.resolution,
                "Snapshot window differs from configuration, keeping the snapshot's"
            );
        }
        Ok(counter)
    }

    pub(crate) fn restore(
        snapshot: CounterSnapshot,
        persistence: Option<PersistenceOptions>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let settings = WindowSettings::new(snapshot.window, snapshot.resolution)
            .map_err(|e| RatewatchError::Decode(e.to_string()))?;

        let len = settings.slots();
        if snapshot.counters.len() != len {
            return Err(RatewatchError::Decode(format!(
                "expected {len} tick slots, found {}",
                snapshot.counters.len()
            )));
        }
        if snapshot.head >= len || snapshot.tail >= len {
            return Err(RatewatchError::Decode(format!(
                "ring positions head={} tail={} out of range for {len} slots",
                snapshot.head, snapshot.tail
            )));
        }

        let mut ring = Ring {
            counter: snapshot.counter,
            prev_counter: snapshot.prev_counter,
            slots: snapshot.counters,
            head: snapshot.head,
            tail: snapshot.tail,
        };

        // Clock moving backwards counts as no downtime.
        let down = (now - snapshot.saved_at).to_std().unwrap_or_default();
        let missing_ticks = down.as_nanos() / settings.tick_period().as_nanos();
        let missing_ticks = u64::try_from(missing_ticks).unwrap_or(u64::MAX);
        ring.replay(missing_ticks);

        debug!(
            window = ?settings.window,
            resolution = settings.resolution,
            downtime = ?down,
            missing_ticks,
            value = ring.counter,
            "Restored window counter"
        );

        Ok(Self {
            settings,
            ring: Mutex::new(ring),
            persistence,
            saved_at: Mutex::new(Some(snapshot.saved_at)),
        })
    }

    /// Record one event and return the new windowed count.
    pub fn increase(&self) -> i64 {
        let mut ring = self.ring.lock();
        ring.counter += 1;
        ring.counter
    }

    /// Number of events in the trailing window.
    pub fn value(&self) -> i64 {
        self.ring.lock().counter
    }

    /// Events per second over the trailing window.
    pub fn rate(&self) -> f64 {
        self.value() as f64 / self.settings.window.as_secs_f64()
    }

    /// Advance the window by one tick.
    ///
    /// The background loop calls this every tick period; it is public so the
    /// window can also be driven by hand.
    pub fn tick(&self) {
        let mut ring = self.ring.lock();
        ring.tick();
        trace!(value = ring.counter, head = ring.head, tail = ring.tail, "Tick");
    }

    pub fn settings(&self) -> WindowSettings {
        self.settings
    }

    pub fn persistence(&self) -> Option<&PersistenceOptions> {
        self.persistence.as_ref()
    }

    /// When the last snapshot of this counter reached the disk.
    pub fn saved_at(&self) -> Option<DateTime<Utc>> {
        *self.saved_at.lock()
    }

    /// Copy the current state.
    pub fn snapshot(&self) -> CounterSnapshot {
        self.capture(Utc::now())
    }

    /// Run the tick loop, and the save loop when persistence is configured,
    /// until `lifetime` is cancelled.
    ///
    /// A failed save cancels `lifetime` and is returned.
    pub async fn run(&self, lifetime: &Lifetime) -> Result<()> {
        info!(
            window = ?self.settings.window,
            resolution = self.settings.resolution,
            persistence = ?self.persistence.as_ref().map(|p| &p.path),
            "Starting window counter"
        );

        match &self.persistence {
            Some(options) => {
                let ((), saved) = tokio::join!(
                    self.tick_loop(lifetime),
                    persistence::run_save_loop(self, options, lifetime)
                );
                saved
            }
            None => {
                self.tick_loop(lifetime).await;
                Ok(())
            }
        }
    }

    /// Spawn [`WindowCounter::run`] inside `lifetime`.
    pub fn start(self: &Arc<Self>, lifetime: &Lifetime) -> JoinHandle<Result<()>> {
        let counter = Arc::clone(self);
        let scope = lifetime.clone();
        lifetime.spawn(async move { counter.run(&scope).await })
    }

    async fn tick_loop(&self, lifetime: &Lifetime) {
        let period = self.settings.tick_period();
        let mut ticks = time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = lifetime.cancelled() => break,
                _ = ticks.tick() => self.tick(),
            }
        }

        debug!(value = self.value(), "Window counter stopped");
    }
}

impl Persistable for WindowCounter {
    type Snapshot = CounterSnapshot;

    fn capture(&self, at: DateTime<Utc>) -> CounterSnapshot {
        let ring = self.ring.lock().clone();
        CounterSnapshot {
            window: self.settings.window,
            counter: ring.counter,
            prev_counter: ring.prev_counter,
            resolution: self.settings.resolution,
            counters: ring.slots,
            head: ring.head,
            tail: ring.tail,
            saved_at: at,
        }
    }

    fn record_save(&self, at: DateTime<Utc>) {
        *self.saved_at.lock() = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(window_ms: u64, resolution: u64) -> WindowCounter {
        WindowCounter::new(Duration::from_millis(window_ms), resolution, None).unwrap()
    }

    fn at(rfc3339: &str) -> DateTime<Utc> {
        rfc3339.parse().unwrap()
    }

    #[test]
    fn test_tick_period() {
        let settings = WindowSettings::new(Duration::from_secs(1), 10).unwrap();
        assert_eq!(settings.tick_period(), Duration::from_millis(100));

        let settings = WindowSettings::new(Duration::from_secs(60), 1000).unwrap();
        assert_eq!(settings.tick_period(), Duration::from_millis(60));
    }

    #[test]
    fn test_settings_reject_sub_millisecond_ticks() {
        let result = WindowSettings::new(Duration::from_nanos(1), 1);
        assert!(matches!(result, Err(RatewatchError::Construction(_))));

        let result = WindowSettings::new(Duration::from_secs(60), 1_000_000);
        assert!(matches!(result, Err(RatewatchError::Construction(_))));

        let result = WindowCounter::new(Duration::ZERO, 10, None);
        assert!(matches!(result, Err(RatewatchError::Construction(_))));
    }

    #[test]
    fn test_settings_reject_zero_resolution() {
        let result = WindowSettings::new(Duration::from_secs(1), 0);
        assert!(matches!(result, Err(RatewatchError::Construction(_))));
    }

    #[test]
    fn test_new_counter_is_empty() {
        let counter = counter(1000, 1000);
        assert_eq!(counter.value(), 0);
        assert_eq!(counter.rate(), 0.0);
        assert_eq!(counter.saved_at(), None);

        let snapshot = counter.snapshot();
        assert_eq!(snapshot.counters.len(), 1000);
        assert_eq!((snapshot.head, snapshot.tail), (0, 0));
    }

    #[test]
    fn test_increase_returns_cumulative_value() {
        let counter = counter(1000, 10);
        for expected in 1..=25 {
            assert_eq!(counter.increase(), expected);
        }
        assert_eq!(counter.value(), 25);
    }

    #[test]
    fn test_ticks_keep_increments_until_eviction() {
        let counter = counter(1000, 10);

        // Nine ticks never fill a ten-slot ring.
        for _ in 0..9 {
            counter.increase();
            counter.increase();
            counter.tick();
        }
        assert_eq!(counter.value(), 18);
    }

    #[test]
    fn test_eviction_after_full_window() {
        let counter = counter(1000, 10);
        for _ in 0..5 {
            counter.increase();
        }

        for _ in 0..9 {
            counter.tick();
        }
        assert_eq!(counter.value(), 5);

        counter.tick();
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn test_window_slides_one_tick_at_a_time() {
        let counter = counter(1000, 4);

        // One event per tick, each committed to its own slot.
        for _ in 0..4 {
            counter.increase();
            counter.tick();
        }
        // The fourth tick filled the ring and evicted the first event.
        assert_eq!(counter.value(), 3);

        counter.tick();
        assert_eq!(counter.value(), 2);
        counter.tick();
        assert_eq!(counter.value(), 1);
        counter.tick();
        assert_eq!(counter.value(), 0);
        counter.tick();
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn test_rate() {
        let counter = counter(2000, 10);
        for _ in 0..10 {
            counter.increase();
        }
        assert_eq!(counter.rate(), 5.0);
    }

    #[test]
    fn test_concurrent_increase_loses_nothing() {
        let counter = counter(60_000, 1000);
        let threads = 8;
        let per_thread = 1000;

        std::thread::scope(|scope| {
            for _ in 0..threads {
                scope.spawn(|| {
                    for _ in 0..per_thread {
                        counter.increase();
                    }
                });
            }
        });

        assert_eq!(counter.value(), threads * per_thread);
    }

    #[test]
    fn test_restore_without_downtime_keeps_state() {
        let counter = counter(1000, 10);
        for _ in 0..3 {
            counter.increase();
            counter.tick();
        }
        counter.increase();

        let saved_at = at("2024-01-01T00:00:00Z");
        let snapshot = counter.capture(saved_at);
        let restored = WindowCounter::restore(snapshot.clone(), None, saved_at).unwrap();

        assert_eq!(restored.value(), counter.value());
        assert_eq!(restored.capture(saved_at), snapshot);
        assert_eq!(restored.saved_at(), Some(saved_at));
    }

    #[test]
    fn test_restore_replays_missing_ticks() {
        let saved_at = at("2024-01-01T00:00:00Z");
        let tick = Duration::from_millis(100);

        for missing in [0u32, 3, 9, 10, 11, 12, 37] {
            let live = counter(1000, 10);
            for _ in 0..4 {
                live.increase();
                live.tick();
            }
            live.increase();
            live.increase();
            let snapshot = live.capture(saved_at);

            // Half a tick on top must not count as an extra tick.
            let now = saved_at + chrono::Duration::from_std(tick * missing + tick / 2).unwrap();
            let restored = WindowCounter::restore(snapshot, None, now).unwrap();

            for _ in 0..missing {
                live.tick();
            }
            assert_eq!(
                restored.capture(saved_at),
                live.capture(saved_at),
                "state mismatch after {missing} missing ticks"
            );
        }
    }

    #[test]
    fn test_restore_after_long_downtime_drains_window() {
        let live = counter(1000, 10);
        for _ in 0..50 {
            live.increase();
        }
        live.tick();
        let saved_at = at("2024-01-01T00:00:00Z");
        let snapshot = live.capture(saved_at);

        let restored =
            WindowCounter::restore(snapshot, None, at("2024-01-08T00:00:00Z")).unwrap();

        assert_eq!(restored.value(), 0);
        assert!(restored.capture(saved_at).counters.iter().all(|&delta| delta == 0));
    }

    #[test]
    fn test_restore_with_clock_skew_replays_nothing() {
        let live = counter(1000, 10);
        live.increase();
        let saved_at = at("2024-01-01T00:00:10Z");
        let snapshot = live.capture(saved_at);

        let restored =
            WindowCounter::restore(snapshot.clone(), None, at("2024-01-01T00:00:00Z")).unwrap();
        assert_eq!(restored.capture(saved_at), snapshot);
    }

    #[test]
    fn test_restore_rejects_inconsistent_snapshot() {
        let saved_at = at("2024-01-01T00:00:00Z");
        let valid = counter(1000, 4).capture(saved_at);

        let mut short = valid.clone();
        short.counters.pop();
        assert!(matches!(
            WindowCounter::restore(short, None, saved_at),
            Err(RatewatchError::Decode(_))
        ));

        let mut bad_head = valid.clone();
        bad_head.head = 4;
        assert!(matches!(
            WindowCounter::restore(bad_head, None, saved_at),
            Err(RatewatchError::Decode(_))
        ));

        let mut tiny_window = valid;
        tiny_window.window = Duration::from_nanos(1);
        assert!(matches!(
            WindowCounter::restore(tiny_window, None, saved_at),
            Err(RatewatchError::Decode(_))
        ));
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let result = WindowCounter::from_json(b"invalidJSON", None);
        assert!(matches!(result, Err(RatewatchError::Decode(_))));
    }

    #[test]
    fn test_restore_or_new() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("windowCounterState.json");
        let options = PersistenceOptions::new(&path, Duration::from_secs(1)).unwrap();
        let settings = WindowSettings::new(Duration::from_secs(60), 1000).unwrap();

        let fresh = WindowCounter::restore_or_new(settings, Some(options.clone())).unwrap();
        assert_eq!(fresh.value(), 0);
        assert_eq!(fresh.saved_at(), None);

        for _ in 0..7 {
            fresh.increase();
        }
        std::fs::write(&path, serde_json::to_vec(&fresh.snapshot()).unwrap()).unwrap();

        let restored = WindowCounter::restore_or_new(settings, Some(options)).unwrap();
        assert_eq!(restored.value(), 7);
        assert_eq!(restored.persistence().unwrap().path, path);
    }

    #[test]
    fn test_restore_or_new_surfaces_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("windowCounterState.json");
        std::fs::write(&path, b"{\"counter\": 1}").unwrap();

        let settings = WindowSettings::new(Duration::from_secs(60), 1000).unwrap();
        let options = PersistenceOptions::new(&path, Duration::from_secs(1)).unwrap();

        let result = WindowCounter::restore_or_new(settings, Some(options));
        assert!(matches!(result, Err(RatewatchError::Decode(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_until_cancelled() {
        let counter = Arc::new(counter(1000, 10));
        let lifetime = Lifetime::new();
        for _ in 0..5 {
            counter.increase();
        }

        let handle = counter.start(&lifetime);

        time::sleep(Duration::from_millis(950)).await;
        assert_eq!(counter.value(), 5);

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.value(), 0);

        lifetime.shutdown().await;
        tokio_test::assert_ok!(handle.await.unwrap());

        // No more ticks once stopped.
        counter.increase();
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.value(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_traffic_settles_on_window_count() {
        let counter = Arc::new(counter(1000, 10));
        let lifetime = Lifetime::new();
        counter.start(&lifetime);

        // Ten events per second, offset half a tick from the tick boundaries.
        let producer = {
            let counter = Arc::clone(&counter);
            let scope = lifetime.clone();
            tokio::spawn(async move {
                let period = Duration::from_millis(100);
                let mut events = time::interval_at(Instant::now() + period / 2, period);
                loop {
                    tokio::select! {
                        _ = scope.cancelled() => break,
                        _ = events.tick() => { counter.increase(); }
                    }
                }
            })
        };

        time::sleep(Duration::from_millis(3020)).await;
        let value = counter.value();
        assert!((9..=10).contains(&value), "value = {value}");

        lifetime.shutdown().await;
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_persists_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("windowCounterState.json");
        let options = PersistenceOptions::new(&path, Duration::from_millis(20)).unwrap();
        let counter =
            Arc::new(WindowCounter::new(Duration::from_secs(60), 1000, Some(options)).unwrap());
        let lifetime = Lifetime::new();

        for _ in 0..4 {
            counter.increase();
        }
        let handle = counter.start(&lifetime);

        time::sleep(Duration::from_millis(120)).await;
        lifetime.shutdown().await;
        assert!(handle.await.unwrap().is_ok());

        let snapshot: CounterSnapshot = persistence::read_snapshot(&path).unwrap();
        assert_eq!(snapshot.counter, 4);
        assert_eq!(snapshot.resolution, 1000);
        assert_eq!(counter.saved_at(), Some(snapshot.saved_at));
    }

    #[tokio::test]
    async fn test_save_failure_stops_counter() {
        let dir = tempfile::tempdir().unwrap();
        let options = PersistenceOptions::new(
            dir.path().join("missing").join("state.json"),
            Duration::from_millis(10),
        )
        .unwrap();
        let counter =
            Arc::new(WindowCounter::new(Duration::from_secs(1), 10, Some(options)).unwrap());
        let lifetime = Lifetime::new();

        let result = counter.start(&lifetime).await.unwrap();

        assert!(matches!(result, Err(RatewatchError::PersistenceWrite { .. })));
        assert!(lifetime.is_cancelled());
    }
}
