//! Cluster-Wide I/O Throttler
//!
//! Bounds aggregate read and write bandwidth across independent worker
//! processes sharing one storage pool. There is no coordinator and no
//! leader: workers publish their recent bandwidth into the telemetry
//! tables (see `winery-catalog`) and each one derates itself to its fair
//! share when the cluster total exceeds the limit.
//!
//! ## How It Works
//!
//! ```text
//!  worker A ──┐                       ┌── worker B
//!   LeakyBucket│  t_read / t_write   │LeakyBucket
//!   Bandwidth ─┼──▶ (PostgreSQL) ◀───┼─ Bandwidth
//!              │   refresh ≈ 1 s     │
//!              └── SUM > limit L?  ──┘
//!                  bucket ← L / N
//! ```
//!
//! - A [`LeakyBucket`] enforces the local rate by sleeping until the
//!   bucket can absorb the requested bytes.
//! - A [`BandwidthCalculator`] keeps a 60-second histogram of observed
//!   bytes to report a smoothed figure to peers.
//! - Every refresh interval the worker uploads its figure, sums the fresh
//!   rows of all workers, and resets its bucket to `L/N` when the total
//!   runs over.
//!
//! The guarantee is deliberately weak: over windows much longer than the
//! refresh interval, aggregate throughput converges to ≈ L. There is no
//! strict fairness between workers.
//!
//! ## Failure Model
//!
//! Rows older than the live window belong to dead workers and are
//! ignored. If the telemetry database itself is unreachable while
//! throttling is enabled, I/O **fails closed** with [`Error::Throttled`]:
//! a cluster that cannot see its own bandwidth must not free-run over a
//! shared pool.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use winery_catalog::{CatalogError, IoDirection, ThrottlerDb};

use crate::config::ThrottlerConfig;
use crate::error::{Error, Result};

/// How often a worker republishes its bandwidth and re-reads the cluster
/// aggregate.
const SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Width of the bandwidth averaging window, in seconds.
const BANDWIDTH_WINDOW: u64 = 60;

/// Leaky bucket holding at most `total` bytes, leaking `total` per
/// second. Taking more than the bucket holds sleeps until enough has
/// leaked out.
pub struct LeakyBucket {
    total: f64,
    current: f64,
    updated: Instant,
}

impl LeakyBucket {
    pub fn new(total: u64) -> Self {
        let total = total.max(1) as f64;
        Self {
            total,
            current: total,
            updated: Instant::now(),
        }
    }

    /// Change the capacity. Overflow from a shrink is discarded.
    pub fn reset(&mut self, total: u64) {
        self.total = total.max(1) as f64;
        self.current = self.current.min(self.total);
        self.tick();
    }

    /// Absorb `count` bytes, sleeping as long as necessary.
    pub async fn take(&mut self, count: u64) {
        self.tick();
        let count = count as f64;
        if count > self.current {
            let wait = (count - self.current) / self.total;
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            self.tick();
        }
        self.current -= count.min(self.total);
    }

    fn tick(&mut self) {
        let now = Instant::now();
        let leaked = self.total * (now - self.updated).as_secs_f64();
        self.current = (self.current + leaked).min(self.total);
        self.updated = now;
    }
}

/// Sliding 60-second histogram of observed bytes; `get` is the windowed
/// average in bytes per second.
pub struct BandwidthCalculator {
    history: VecDeque<u64>,
    current: u64,
    current_second: u64,
    started: Instant,
}

impl Default for BandwidthCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl BandwidthCalculator {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(BANDWIDTH_WINDOW as usize - 1),
            current: 0,
            current_second: 0,
            started: Instant::now(),
        }
    }

    pub fn add(&mut self, count: u64) {
        let second = self.started.elapsed().as_secs();
        if second > self.current_second {
            self.history.push_back(self.current);
            // Idle seconds between the last add and this one count as 0.
            let gap = (second - self.current_second - 1).min(BANDWIDTH_WINDOW);
            for _ in 0..gap {
                self.history.push_back(0);
            }
            while self.history.len() > BANDWIDTH_WINDOW as usize - 1 {
                self.history.pop_front();
            }
            self.current_second = second;
            self.current = 0;
        }
        self.current += count;
    }

    /// Average bytes per second over the window.
    pub fn get(&self) -> u64 {
        (self.history.iter().sum::<u64>() + self.current) / BANDWIDTH_WINDOW
    }
}

/// One direction (read or write) of the throttling policy.
struct IoThrottler {
    db: ThrottlerDb,
    direction: IoDirection,
    row_id: i32,
    max_speed: u64,
    bucket: LeakyBucket,
    bandwidth: BandwidthCalculator,
    last_sync: Option<Instant>,
}

impl IoThrottler {
    async fn new(db: ThrottlerDb, direction: IoDirection, max_speed: u64) -> Result<Self> {
        let row_id = db.register(direction).await.map_err(fail_closed)?;
        Ok(Self {
            db,
            direction,
            row_id,
            max_speed,
            bucket: LeakyBucket::new(max_speed),
            bandwidth: BandwidthCalculator::new(),
            last_sync: None,
        })
    }

    async fn add(&mut self, count: u64) -> Result<()> {
        self.bucket.take(count).await;
        self.bandwidth.add(count);
        self.maybe_sync().await
    }

    async fn maybe_sync(&mut self) -> Result<()> {
        let now = Instant::now();
        let due = self
            .last_sync
            .map_or(true, |last| now - last > SYNC_INTERVAL);
        if due {
            self.sync().await?;
            self.last_sync = Some(now);
        }
        Ok(())
    }

    async fn sync(&mut self) -> Result<()> {
        let observed = self.bandwidth.get().min(i32::MAX as u64) as i32;
        self.db
            .update(self.direction, self.row_id, observed)
            .await
            .map_err(fail_closed)?;

        let (workers, total) = self
            .db
            .aggregate(self.direction)
            .await
            .map_err(fail_closed)?;

        if workers > 0 && total as u64 > self.max_speed {
            let share = self.max_speed / workers as u64;
            debug!(
                direction = ?self.direction,
                workers,
                total,
                share,
                "cluster over limit, derating to fair share"
            );
            self.bucket.reset(share);
        }
        Ok(())
    }
}

fn fail_closed(e: CatalogError) -> Error {
    Error::Throttled(e.to_string())
}

struct Inner {
    read: Mutex<IoThrottler>,
    write: Mutex<IoThrottler>,
}

/// Gate for all pool I/O of one worker process. Disabled (a no-op) when
/// the configuration has no throttler section.
pub struct Throttler {
    inner: Option<Inner>,
}

impl Throttler {
    /// A throttler that lets everything through.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Build from configuration; `default_db` is the catalog connection
    /// string, used when the throttler has no database of its own.
    pub async fn from_config(
        config: Option<&ThrottlerConfig>,
        default_db: &str,
    ) -> Result<Self> {
        let Some(config) = config else {
            return Ok(Self::disabled());
        };

        let url = config.db.as_deref().unwrap_or(default_db);
        let db = ThrottlerDb::connect(url).await.map_err(fail_closed)?;

        let read = IoThrottler::new(db.clone(), IoDirection::Read, config.max_read_bps).await?;
        let write = IoThrottler::new(db, IoDirection::Write, config.max_write_bps).await?;

        Ok(Self {
            inner: Some(Inner {
                read: Mutex::new(read),
                write: Mutex::new(write),
            }),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Account for (and possibly delay) a read of `bytes`.
    pub async fn throttle_read(&self, bytes: u64) -> Result<()> {
        if let Some(inner) = &self.inner {
            inner.read.lock().await.add(bytes).await?;
        }
        Ok(())
    }

    /// Account for (and possibly delay) a write of `bytes`.
    pub async fn throttle_write(&self, bytes: u64) -> Result<()> {
        if let Some(inner) = &self.inner {
            inner.write.lock().await.add(bytes).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bucket_burst_within_capacity_is_free() {
        let mut bucket = LeakyBucket::new(1000);
        let before = Instant::now();
        bucket.take(400).await;
        bucket.take(400).await;
        assert_eq!(Instant::now(), before, "no sleep expected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_sleeps_when_drained() {
        let mut bucket = LeakyBucket::new(1000);
        let before = Instant::now();
        bucket.take(1000).await; // drains the initial fill
        bucket.take(1000).await; // must wait ~1 s for a refill
        let waited = Instant::now() - before;
        assert!(
            waited >= Duration::from_millis(900),
            "waited only {:?}",
            waited
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_oversized_take_waits_proportionally() {
        let mut bucket = LeakyBucket::new(100);
        let before = Instant::now();
        bucket.take(100).await;
        // 300 bytes at 100 B/s: three seconds of accumulated credit.
        bucket.take(300).await;
        let waited = Instant::now() - before;
        assert!(waited >= Duration::from_secs(2), "waited only {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_reset_discards_overflow() {
        let mut bucket = LeakyBucket::new(1000);
        bucket.reset(10);
        let before = Instant::now();
        bucket.take(10).await; // capped fill covers this
        bucket.take(10).await; // now rate-limited at 10 B/s
        let waited = Instant::now() - before;
        assert!(
            waited >= Duration::from_millis(900),
            "waited only {:?}",
            waited
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bandwidth_average_over_window() {
        let mut bw = BandwidthCalculator::new();
        // 600 bytes per second for 6 seconds.
        for _ in 0..6 {
            bw.add(600);
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        // 3600 bytes over a 60 s window.
        assert_eq!(bw.get(), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bandwidth_idle_gap_counts_as_zero() {
        let mut bw = BandwidthCalculator::new();
        bw.add(6000);
        tokio::time::advance(Duration::from_secs(30)).await;
        bw.add(0);
        assert_eq!(bw.get(), 100); // 6000 / 60
    }

    #[tokio::test(start_paused = true)]
    async fn test_bandwidth_old_seconds_fall_out_of_window() {
        let mut bw = BandwidthCalculator::new();
        bw.add(6000);
        tokio::time::advance(Duration::from_secs(2 * BANDWIDTH_WINDOW)).await;
        bw.add(0);
        assert_eq!(bw.get(), 0);
    }

    #[tokio::test]
    async fn test_disabled_throttler_is_noop() {
        let throttler = Throttler::disabled();
        assert!(!throttler.is_enabled());
        throttler.throttle_read(u64::MAX).await.unwrap();
        throttler.throttle_write(u64::MAX).await.unwrap();
    }
}
