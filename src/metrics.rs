//! Runtime metrics.
//!
//! Provides counters and histograms for fiber lifecycle statistics, plus a
//! text export in the Prometheus exposition format.
//!
//! Every runtime owns one [`FiberMetrics`], updated by the interpreter:
//!
//! | series | kind | recorded |
//! |---|---|---|
//! | `fiber_started` | counter | when a fiber is created |
//! | `fiber_successes` | counter | when a fiber ends with a value |
//! | `fiber_failures` | counter | when a fiber ends with a cause |
//! | `fiber_lifetimes` | histogram (seconds) | when a fiber ends |
//! | `fiber_fork_locations{location}` | counter | per fork call site |

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default lifetime buckets, in seconds.
const LIFETIME_BUCKETS: [f64; 10] = [0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0];

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: String,
    value: AtomicU64,
}

impl Counter {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: AtomicU64::new(0),
        }
    }

    /// Increments the counter by 1.
    pub fn increment(&self) {
        self.add(1);
    }

    /// Adds a value to the counter.
    pub fn add(&self, value: u64) {
        self.value.fetch_add(value, Ordering::Relaxed);
    }

    /// Returns the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Returns the counter name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A histogram for distribution tracking.
#[derive(Debug)]
pub struct Histogram {
    name: String,
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum: AtomicU64, // Stored as bits of f64
    count: AtomicU64,
}

impl Histogram {
    pub(crate) fn new(name: impl Into<String>, buckets: Vec<f64>) -> Self {
        let mut buckets = buckets;
        buckets.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let counts = (0..=buckets.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            name: name.into(),
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Observes a value.
    pub fn observe(&self, value: f64) {
        let idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.buckets.len());

        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        // CAS loop: there is no atomic float add.
        let mut current = self.sum.load(Ordering::Relaxed);
        loop {
            let new_bits = (f64::from_bits(current) + value).to_bits();
            match self.sum.compare_exchange_weak(
                current,
                new_bits,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(v) => current = v,
            }
        }
    }

    /// Returns the total count of observations.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Returns the sum of observations.
    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    /// Returns the histogram name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A named series: a metric name plus an optional single label.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SeriesKey {
    name: String,
    label: Option<(String, String)>,
}

impl SeriesKey {
    fn render(&self) -> String {
        match &self.label {
            None => self.name.clone(),
            Some((key, value)) => format!("{}{{{key}=\"{}\"}}", self.name, escape_label(value)),
        }
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// A collection of metrics.
#[derive(Debug, Default)]
pub struct Metrics {
    counters: BTreeMap<SeriesKey, Arc<Counter>>,
    histograms: BTreeMap<String, Arc<Histogram>>,
}

impl Metrics {
    /// Creates a new metrics registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets or creates a counter.
    pub fn counter(&mut self, name: &str) -> Arc<Counter> {
        self.series(SeriesKey {
            name: name.to_string(),
            label: None,
        })
    }

    /// Gets or creates a counter carrying one label.
    pub fn labeled_counter(&mut self, name: &str, label: &str, value: &str) -> Arc<Counter> {
        self.series(SeriesKey {
            name: name.to_string(),
            label: Some((label.to_string(), value.to_string())),
        })
    }

    fn series(&mut self, key: SeriesKey) -> Arc<Counter> {
        self.counters
            .entry(key)
            .or_insert_with_key(|key| Arc::new(Counter::new(key.name.clone())))
            .clone()
    }

    /// Gets or creates a histogram. The buckets of the first registration
    /// win.
    pub fn histogram(&mut self, name: &str, buckets: Vec<f64>) -> Arc<Histogram> {
        self.histograms
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Histogram::new(name, buckets)))
            .clone()
    }

    /// Exports metrics in the Prometheus text format.
    #[must_use]
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        let mut last_type: Option<&str> = None;
        for (key, counter) in &self.counters {
            if last_type != Some(key.name.as_str()) {
                let _ = writeln!(output, "# TYPE {} counter", key.name);
                last_type = Some(key.name.as_str());
            }
            let _ = writeln!(output, "{} {}", key.render(), counter.get());
        }

        for (name, hist) in &self.histograms {
            let _ = writeln!(output, "# TYPE {name} histogram");
            let mut cumulative = 0;
            for (i, count) in hist.counts.iter().enumerate() {
                cumulative += count.load(Ordering::Relaxed);
                let le = hist
                    .buckets
                    .get(i)
                    .map_or_else(|| "+Inf".to_string(), ToString::to_string);
                let _ = writeln!(output, "{name}_bucket{{le=\"{le}\"}} {cumulative}");
            }
            let _ = writeln!(output, "{name}_sum {}", hist.sum());
            let _ = writeln!(output, "{name}_count {}", hist.count());
        }

        output
    }
}

/// Fiber lifecycle metrics of one runtime.
#[derive(Debug)]
pub struct FiberMetrics {
    registry: Mutex<Metrics>,
    started: Arc<Counter>,
    successes: Arc<Counter>,
    failures: Arc<Counter>,
    lifetimes: Arc<Histogram>,
}

impl Default for FiberMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FiberMetrics {
    /// A fresh set of fiber metrics.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Metrics::new();
        let started = registry.counter("fiber_started");
        let successes = registry.counter("fiber_successes");
        let failures = registry.counter("fiber_failures");
        let lifetimes = registry.histogram("fiber_lifetimes", LIFETIME_BUCKETS.to_vec());
        Self {
            registry: Mutex::new(registry),
            started,
            successes,
            failures,
            lifetimes,
        }
    }

    pub(crate) fn record_start(&self) {
        self.started.increment();
    }

    pub(crate) fn record_end(&self, success: bool, lifetime: Duration) {
        if success {
            self.successes.increment();
        } else {
            self.failures.increment();
        }
        self.lifetimes.observe(lifetime.as_secs_f64());
    }

    pub(crate) fn record_fork(&self, location: &'static Location<'static>) {
        let site = format!("{}:{}", location.file(), location.line());
        self.registry
            .lock()
            .labeled_counter("fiber_fork_locations", "location", &site)
            .increment();
    }

    /// Fibers created so far.
    #[must_use]
    pub fn started(&self) -> u64 {
        self.started.get()
    }

    /// Fibers that ended with a value.
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.get()
    }

    /// Fibers that ended with a cause.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.get()
    }

    /// Distribution of fiber lifetimes in seconds.
    #[must_use]
    pub fn lifetimes(&self) -> Arc<Histogram> {
        Arc::clone(&self.lifetimes)
    }

    /// Fork counts per call site, keyed `file:line`.
    #[must_use]
    pub fn fork_locations(&self) -> BTreeMap<String, u64> {
        self.registry
            .lock()
            .counters
            .iter()
            .filter(|(key, _)| key.name == "fiber_fork_locations")
            .filter_map(|(key, counter)| {
                key.label
                    .as_ref()
                    .map(|(_, site)| (site.clone(), counter.get()))
            })
            .collect()
    }

    /// Renders every fiber metric in the Prometheus text format.
    #[must_use]
    pub fn export_prometheus(&self) -> String {
        self.registry.lock().export_prometheus()
    }
}
