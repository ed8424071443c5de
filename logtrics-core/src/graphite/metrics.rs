//! Metric cells and the concurrent registry behind the graphite bindings.
//!
//! Counters and gauges are plain atomics. Meters and timers keep their
//! state behind a mutex: a count plus 1/5/15-minute exponentially
//! weighted rates, and for timers a sliding sample window for
//! percentiles. Repeated lookups of the same name return the same cell.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicI64, Ordering},
};
use std::time::Instant;

use dashmap::{DashMap, mapref::entry::Entry};

use crate::error::LogtricsError;

/// Number of samples retained for timer percentiles.
const SAMPLE_WINDOW: usize = 1028;

/// Seconds between EWMA decay ticks.
const TICK_SECS: u64 = 5;

/// A monotonically adjustable signed counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicI64);

impl Counter {
    pub fn inc(&self, delta: i64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn dec(&self, delta: i64) {
        self.0.fetch_sub(delta, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A last-value-wins instantaneous measurement.
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn update(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// One exponentially weighted moving average over [`TICK_SECS`] ticks.
#[derive(Debug)]
struct Ewma {
    alpha: f64,
    rate: f64,
    uncounted: i64,
    initialized: bool,
}

impl Ewma {
    fn new(minutes: f64) -> Self {
        Self {
            alpha: 1.0 - (-(TICK_SECS as f64) / 60.0 / minutes).exp(),
            rate: 0.0,
            uncounted: 0,
            initialized: false,
        }
    }

    fn update(&mut self, n: i64) {
        self.uncounted += n;
    }

    fn tick(&mut self) {
        let instant_rate = self.uncounted as f64 / TICK_SECS as f64;
        self.uncounted = 0;
        if self.initialized {
            self.rate += self.alpha * (instant_rate - self.rate);
        } else {
            self.rate = instant_rate;
            self.initialized = true;
        }
    }

    /// Events per second.
    fn rate(&self) -> f64 {
        self.rate
    }
}

/// 1/5/15-minute rates with catch-up ticking.
#[derive(Debug)]
struct RateTracker {
    rates: [Ewma; 3],
    last_tick: Instant,
}

impl RateTracker {
    fn new(now: Instant) -> Self {
        Self {
            rates: [Ewma::new(1.0), Ewma::new(5.0), Ewma::new(15.0)],
            last_tick: now,
        }
    }

    fn update(&mut self, n: i64) {
        for ewma in &mut self.rates {
            ewma.update(n);
        }
    }

    /// Applies every elapsed decay tick since the last call.
    fn advance(&mut self, now: Instant) {
        let tick = std::time::Duration::from_secs(TICK_SECS);
        while now.duration_since(self.last_tick) >= tick {
            for ewma in &mut self.rates {
                ewma.tick();
            }
            self.last_tick += tick;
        }
    }

    fn snapshot(&self) -> (f64, f64, f64) {
        (
            self.rates[0].rate(),
            self.rates[1].rate(),
            self.rates[2].rate(),
        )
    }
}

/// A rate-tracked counter.
#[derive(Debug)]
pub struct Meter {
    inner: Mutex<MeterInner>,
}

#[derive(Debug)]
struct MeterInner {
    count: i64,
    start: Instant,
    rates: RateTracker,
}

/// Point-in-time view of a meter.
#[derive(Debug, Clone, Copy)]
pub struct MeterSnapshot {
    pub count: i64,
    pub rate1: f64,
    pub rate5: f64,
    pub rate15: f64,
    /// Lifetime events per second.
    pub mean_rate: f64,
}

impl Default for Meter {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            inner: Mutex::new(MeterInner {
                count: 0,
                start: now,
                rates: RateTracker::new(now),
            }),
        }
    }
}

impl Meter {
    pub fn mark(&self, delta: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.rates.advance(Instant::now());
        inner.count += delta;
        inner.rates.update(delta);
    }

    pub fn snapshot(&self) -> MeterSnapshot {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.rates.advance(now);
        let (rate1, rate5, rate15) = inner.rates.snapshot();
        let elapsed = now.duration_since(inner.start).as_secs_f64();
        MeterSnapshot {
            count: inner.count,
            rate1,
            rate5,
            rate15,
            mean_rate: if elapsed > 0.0 {
                inner.count as f64 / elapsed
            } else {
                0.0
            },
        }
    }
}

/// A duration distribution fed in nanoseconds.
#[derive(Debug)]
pub struct Timer {
    inner: Mutex<TimerInner>,
}

#[derive(Debug)]
struct TimerInner {
    count: i64,
    sum: i64,
    min: i64,
    max: i64,
    samples: Vec<i64>,
    next: usize,
    rates: RateTracker,
}

/// Point-in-time view of a timer. Durations are in nanoseconds.
#[derive(Debug, Clone, Copy)]
pub struct TimerSnapshot {
    pub count: i64,
    pub min: i64,
    pub max: i64,
    pub mean: f64,
    pub p50: f64,
    pub p75: f64,
    pub p95: f64,
    pub p99: f64,
    pub p999: f64,
    pub rate1: f64,
    pub rate5: f64,
    pub rate15: f64,
}

impl Default for Timer {
    fn default() -> Self {
        Self {
            inner: Mutex::new(TimerInner {
                count: 0,
                sum: 0,
                min: 0,
                max: 0,
                samples: Vec::new(),
                next: 0,
                rates: RateTracker::new(Instant::now()),
            }),
        }
    }
}

impl Timer {
    /// Records one duration in nanoseconds.
    pub fn update(&self, nanos: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.rates.advance(Instant::now());
        inner.rates.update(1);
        if inner.count == 0 {
            inner.min = nanos;
            inner.max = nanos;
        } else {
            inner.min = inner.min.min(nanos);
            inner.max = inner.max.max(nanos);
        }
        inner.count += 1;
        inner.sum += nanos;
        if inner.samples.len() < SAMPLE_WINDOW {
            inner.samples.push(nanos);
        } else {
            let next = inner.next;
            inner.samples[next] = nanos;
        }
        inner.next = (inner.next + 1) % SAMPLE_WINDOW;
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        let mut inner = self.inner.lock().unwrap();
        inner.rates.advance(Instant::now());
        let (rate1, rate5, rate15) = inner.rates.snapshot();
        let mut sorted = inner.samples.clone();
        sorted.sort_unstable();
        TimerSnapshot {
            count: inner.count,
            min: inner.min,
            max: inner.max,
            mean: if inner.count > 0 {
                inner.sum as f64 / inner.count as f64
            } else {
                0.0
            },
            p50: percentile(&sorted, 0.5),
            p75: percentile(&sorted, 0.75),
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
            p999: percentile(&sorted, 0.999),
            rate1,
            rate5,
            rate15,
        }
    }
}

/// Linear-interpolated percentile over a sorted sample window.
fn percentile(sorted: &[i64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = q * (sorted.len() - 1) as f64;
    let low = rank.floor() as usize;
    let high = rank.ceil() as usize;
    if low == high {
        return sorted[low] as f64;
    }
    let weight = rank - low as f64;
    sorted[low] as f64 * (1.0 - weight) + sorted[high] as f64 * weight
}

/// A kind-tagged metric cell.
#[derive(Debug, Clone)]
pub enum Metric {
    Counter(Arc<Counter>),
    Gauge(Arc<Gauge>),
    Timer(Arc<Timer>),
    Meter(Arc<Meter>),
}

impl Metric {
    pub fn kind(&self) -> &'static str {
        match self {
            Metric::Counter(_) => "counter",
            Metric::Gauge(_) => "gauge",
            Metric::Timer(_) => "timer",
            Metric::Meter(_) => "meter",
        }
    }
}

/// Concurrent name → cell mapping with get-or-register semantics.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    metrics: DashMap<String, Metric>,
}

macro_rules! get_or_register {
    ($map:expr, $name:ident, $variant:ident, $cell:ty, $kind:literal) => {
        match $map.entry($name.to_string()) {
            Entry::Occupied(entry) => match entry.get() {
                Metric::$variant(cell) => Ok(Arc::clone(cell)),
                other => Err(LogtricsError::metric_kind_conflict(
                    $name,
                    other.kind(),
                    $kind,
                )),
            },
            Entry::Vacant(entry) => {
                let cell = Arc::new(<$cell>::default());
                entry.insert(Metric::$variant(Arc::clone(&cell)));
                Ok(cell)
            }
        }
    };
}

impl MetricsRegistry {
    /// Returns the named counter, registering it on first use.
    pub fn counter(&self, name: &str) -> Result<Arc<Counter>, LogtricsError> {
        get_or_register!(self.metrics, name, Counter, Counter, "counter")
    }

    /// Returns the named gauge, registering it on first use.
    pub fn gauge(&self, name: &str) -> Result<Arc<Gauge>, LogtricsError> {
        get_or_register!(self.metrics, name, Gauge, Gauge, "gauge")
    }

    /// Returns the named timer, registering it on first use.
    pub fn timer(&self, name: &str) -> Result<Arc<Timer>, LogtricsError> {
        get_or_register!(self.metrics, name, Timer, Timer, "timer")
    }

    /// Returns the named meter, registering it on first use.
    pub fn meter(&self, name: &str) -> Result<Arc<Meter>, LogtricsError> {
        get_or_register!(self.metrics, name, Meter, Meter, "meter")
    }

    /// A consistent copy of the current name → cell mapping.
    ///
    /// Cells are shared handles; no lock is held by the caller afterwards.
    pub fn snapshot(&self) -> Vec<(String, Metric)> {
        let mut all: Vec<(String, Metric)> = self
            .metrics
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}
