//! Bandwidth limits and live throughput of connections.
//!
//! Every connection owns a [`TrafficShaper`] whose parent is the session-wide
//! shaper, a frame is only read or written after both of them granted its
//! bytes, so the effective rate of a connection is the minimum of the two
//! limits.
use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::time::{sleep, Instant};

use crate::wire::BLOCK_LEN;

/// How often a throttled task checks its budget again. New limits are
/// picked up at the next tick.
pub const TICK: Duration = Duration::from_millis(100);

/// Time constant of the exponential decay of [`RateWindow`], in seconds.
const WINDOW_SECS: f64 = 1.0;

/// Rolling speed of one direction of traffic.
///
/// The rate decays continuously, so an idle window converges to zero
/// instead of freezing the last measured value.
#[derive(Debug, Clone)]
pub struct RateWindow {
    rate: f64,
    last: Instant,
    total: u64,
}

impl RateWindow {
    pub fn new(now: Instant) -> Self {
        Self { rate: 0.0, last: now, total: 0 }
    }

    fn decayed(&self, now: Instant) -> f64 {
        let dt = now.saturating_duration_since(self.last).as_secs_f64();
        self.rate * (-dt / WINDOW_SECS).exp()
    }

    pub fn record(&mut self, bytes: u64, now: Instant) {
        self.rate = self.decayed(now) + bytes as f64 / WINDOW_SECS;
        self.last = now;
        self.total += bytes;
    }

    /// Bytes per second.
    pub fn rate(&self, now: Instant) -> u64 {
        self.decayed(now).round() as u64
    }

    /// Bytes recorded since the window was created.
    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Token bucket of one direction, `rate` is in bytes per second and 0 means
/// unlimited.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: u64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(rate: u64, now: Instant) -> Self {
        let mut bucket = Self { rate, tokens: 0.0, last: now };
        bucket.tokens = bucket.capacity();
        bucket
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// A bucket must always be able to hold one full piece frame, or a
    /// block could never be granted under a tiny limit.
    fn capacity(&self) -> f64 {
        self.rate.max(BLOCK_LEN as u64 + 13) as f64
    }

    fn refill(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        if self.is_unlimited() {
            return;
        }
        self.tokens = (self.tokens + dt * self.rate as f64).min(self.capacity());
    }

    /// Change the rate. Time elapsed until `now` is still accounted at the
    /// old rate.
    pub fn set_rate(&mut self, rate: u64, now: Instant) {
        self.refill(now);
        let was_unlimited = self.is_unlimited();
        self.rate = rate;

        if self.is_unlimited() {
            self.tokens = 0.0;
        } else if was_unlimited {
            self.tokens = self.capacity();
        } else {
            self.tokens = self.tokens.min(self.capacity());
        }
    }

    /// How long until `bytes` can be taken, zero if they can be taken now.
    ///
    /// Requests larger than the capacity only need a full bucket and leave
    /// it in debt.
    pub fn wait_time(&mut self, bytes: usize, now: Instant) -> Duration {
        self.refill(now);
        if self.is_unlimited() {
            return Duration::ZERO;
        }

        let needed = (bytes as f64).min(self.capacity());
        if self.tokens >= needed {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((needed - self.tokens) / self.rate as f64)
        }
    }

    pub fn take(&mut self, bytes: usize) {
        if !self.is_unlimited() {
            self.tokens -= bytes as f64;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Upload,
    Download,
}

#[derive(Debug)]
struct Inner {
    upload: TokenBucket,
    download: TokenBucket,
    upload_window: RateWindow,
    download_window: RateWindow,
}

impl Inner {
    fn bucket(&mut self, dir: Direction) -> &mut TokenBucket {
        match dir {
            Direction::Upload => &mut self.upload,
            Direction::Download => &mut self.download,
        }
    }

    fn window(&mut self, dir: Direction) -> &mut RateWindow {
        match dir {
            Direction::Upload => &mut self.upload_window,
            Direction::Download => &mut self.download_window,
        }
    }
}

/// Rate limiter and speed meter of a connection, or of the whole session
/// when it has no parent.
#[derive(Debug)]
pub struct TrafficShaper {
    inner: Mutex<Inner>,
    parent: Option<Arc<TrafficShaper>>,
}

impl Default for TrafficShaper {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl TrafficShaper {
    pub fn new(write_limit: u64, read_limit: u64) -> Self {
        let now = Instant::now();
        Self {
            inner: Mutex::new(Inner {
                upload: TokenBucket::new(write_limit, now),
                download: TokenBucket::new(read_limit, now),
                upload_window: RateWindow::new(now),
                download_window: RateWindow::new(now),
            }),
            parent: None,
        }
    }

    /// A shaper whose traffic also counts against `parent`.
    pub fn with_parent(
        write_limit: u64,
        read_limit: u64,
        parent: Arc<TrafficShaper>,
    ) -> Self {
        Self { parent: Some(parent), ..Self::new(write_limit, read_limit) }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Change the limits in bytes per second, 0 is unlimited. Tasks waiting
    /// for budget see the new limits on their next tick.
    pub fn update(&self, write_limit: u64, read_limit: u64) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.upload.set_rate(write_limit, now);
        inner.download.set_rate(read_limit, now);
    }

    /// `(write_limit, read_limit)`
    pub fn limits(&self) -> (u64, u64) {
        let inner = self.lock();
        (inner.upload.rate(), inner.download.rate())
    }

    pub fn download_speed(&self) -> u64 {
        self.lock().download_window.rate(Instant::now())
    }

    pub fn upload_speed(&self) -> u64 {
        self.lock().upload_window.rate(Instant::now())
    }

    pub fn downloaded(&self) -> u64 {
        self.lock().download_window.total()
    }

    pub fn uploaded(&self) -> u64 {
        self.lock().upload_window.total()
    }

    /// Wait until `bytes` may be written.
    pub async fn acquire_upload(&self, bytes: usize) {
        self.acquire(Direction::Upload, bytes).await
    }

    /// Wait until `bytes` may be read.
    pub async fn acquire_download(&self, bytes: usize) {
        self.acquire(Direction::Download, bytes).await
    }

    async fn acquire(&self, dir: Direction, bytes: usize) {
        loop {
            let wait = self.try_acquire(dir, bytes);
            if wait.is_zero() {
                return;
            }
            sleep(wait.min(TICK)).await;
        }
    }

    /// Take the bytes from this shaper and its parent if both have the
    /// budget, otherwise return how long to wait. Locks child before parent.
    fn try_acquire(&self, dir: Direction, bytes: usize) -> Duration {
        let now = Instant::now();
        let mut inner = self.lock();
        let mut parent = self.parent.as_ref().map(|p| p.lock());

        let mut wait = inner.bucket(dir).wait_time(bytes, now);
        if let Some(parent) = parent.as_mut() {
            wait = wait.max(parent.bucket(dir).wait_time(bytes, now));
        }

        if !wait.is_zero() {
            return wait;
        }

        inner.bucket(dir).take(bytes);
        inner.window(dir).record(bytes as u64, now);
        if let Some(parent) = parent.as_mut() {
            parent.bucket(dir).take(bytes);
            parent.window(dir).record(bytes as u64, now);
        }

        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: u64 = 2 * BLOCK_LEN as u64;

    #[tokio::test(start_paused = true)]
    async fn rate_window_decays() {
        let start = Instant::now();
        let mut window = RateWindow::new(start);
        window.record(1000, start);
        assert_eq!(window.rate(start), 1000);

        let later = start + Duration::from_secs(10);
        assert_eq!(window.rate(later), 0);
        assert_eq!(window.total(), 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn throughput_converges_to_limit() {
        let shaper = TrafficShaper::new(LIMIT, 0);
        let start = Instant::now();
        let mut written = 0u64;

        while start.elapsed() < Duration::from_secs(10) {
            shaper.acquire_upload(BLOCK_LEN as usize).await;
            written += BLOCK_LEN as u64;
        }

        let elapsed = start.elapsed().as_secs_f64();
        let cap = (BLOCK_LEN + 13) as f64 + LIMIT as f64;
        assert!(written as f64 <= LIMIT as f64 * elapsed + cap);
        assert!(written as f64 >= LIMIT as f64 * (elapsed - 1.0));

        let speed = shaper.upload_speed();
        assert!(speed >= LIMIT / 2 && speed <= LIMIT * 2, "{speed}");
        assert_eq!(shaper.uploaded(), written);
    }

    #[tokio::test(start_paused = true)]
    async fn speed_goes_to_zero_when_idle() {
        let shaper = TrafficShaper::default();
        shaper.acquire_download(50_000).await;
        assert!(shaper.download_speed() > 0);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(shaper.download_speed(), 0);
        assert_eq!(shaper.downloaded(), 50_000);
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_takes_effect_within_a_tick() {
        let shaper = Arc::new(TrafficShaper::new(1000, 0));

        // the first frame drains the bucket
        shaper.acquire_upload(BLOCK_LEN as usize).await;

        let start = Instant::now();
        let s = shaper.clone();
        let handle = tokio::spawn(async move {
            s.acquire_upload(BLOCK_LEN as usize).await;
        });

        sleep(Duration::from_millis(500)).await;
        assert!(!handle.is_finished());

        shaper.update(0, 0);
        handle.await.unwrap();

        assert!(start.elapsed() <= Duration::from_millis(500) + TICK);
        assert_eq!(shaper.limits(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn parent_limit_applies_to_children() {
        let parent = Arc::new(TrafficShaper::new(LIMIT, 0));
        let a = Arc::new(TrafficShaper::with_parent(0, 0, parent.clone()));
        let b = Arc::new(TrafficShaper::with_parent(0, 0, parent.clone()));

        let start = Instant::now();
        let mut handles = Vec::new();
        for shaper in [a.clone(), b.clone()] {
            handles.push(tokio::spawn(async move {
                while start.elapsed() < Duration::from_secs(5) {
                    shaper.acquire_upload(BLOCK_LEN as usize).await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let total = a.uploaded() + b.uploaded();
        assert_eq!(total, parent.uploaded());

        let cap = (BLOCK_LEN + 13) as u64 + LIMIT;
        assert!(total <= LIMIT * 6 + cap, "{total}");
    }

    #[test]
    fn bucket_change_is_not_retroactive() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1000, now);
        bucket.take(bucket.capacity() as usize);

        // one second at 1000 B/s, then a much higher limit
        let later = now + Duration::from_secs(1);
        bucket.set_rate(1_000_000, later);

        assert!(bucket.wait_time(1000, later).is_zero());
        assert!(!bucket.wait_time(2000, later).is_zero());
    }
}
