use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use relay_core::observer::{RelayIncident, RelayObserver};
use serde::{Deserialize, Serialize};

/// Counter names fed by [`RelayObserver`].
pub mod names {
    pub const DECODE_ERRORS: &str = "relay.decode_errors";
    pub const LOOKUP_FAILURES: &str = "relay.lookup_failures";
    pub const EVENTS_DELIVERED: &str = "relay.events_delivered";
    pub const DELIVERY_FAILURES: &str = "relay.delivery_failures";
    pub const SEND_QUEUE_FULL: &str = "relay.send_queue_full";
    pub const PUBLISH_FAILURES: &str = "relay.publish_failures";
    pub const BROKER_DISCONNECTS: &str = "relay.broker_disconnects";
    pub const BROKER_CONNECTS: &str = "relay.broker_connects";
    pub const FRAMES_REJECTED: &str = "session.frames_rejected";
    pub const FANOUT_SIZE: &str = "relay.fanout_size";
    pub const CONNECTIONS_ACTIVE: &str = "ws.connections.active";
}

struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Integer gauge, can go below zero transiently.
struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }
    fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }
    fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Observations kept for percentiles. Count, sum and max cover every
/// observation.
const HISTOGRAM_WINDOW: usize = 1024;

#[derive(Default)]
struct HistogramState {
    recent: VecDeque<f64>,
    count: u64,
    sum: f64,
    max: f64,
}

struct Histogram {
    state: Mutex<HistogramState>,
}

impl Histogram {
    fn new() -> Self {
        Self {
            state: Mutex::new(HistogramState::default()),
        }
    }
    fn observe(&self, value: f64) {
        let mut state = self.state.lock();
        if state.recent.len() == HISTOGRAM_WINDOW {
            state.recent.pop_front();
        }
        state.recent.push_back(value);
        state.count += 1;
        state.sum += value;
        if state.count == 1 || value > state.max {
            state.max = value;
        }
    }
    fn summary(&self) -> HistogramSummary {
        let state = self.state.lock();
        if state.recent.is_empty() {
            return HistogramSummary::default();
        }
        let mut window: Vec<f64> = state.recent.iter().copied().collect();
        window.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = window.len();
        HistogramSummary {
            count: state.count,
            sum: state.sum,
            p50: window[n / 2],
            p95: window[((n as f64 * 0.95) as usize).min(n - 1)],
            max: state.max,
        }
    }
    #[cfg(test)]
    fn retained(&self) -> usize {
        self.state.lock().recent.len()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub max: f64,
}

/// Metric key: name + sorted labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: name.to_string(),
            labels: sorted,
        }
    }

    /// `name{k=v,...}`, used as the key in snapshots.
    fn render(&self) -> String {
        if self.labels.is_empty() {
            return self.name.clone();
        }
        let labels: Vec<String> = self.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("{}{{{}}}", self.name, labels.join(","))
    }
}

/// Point-in-time copy of every metric, served by `/health`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, i64>,
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// Thread-safe in-process metrics recorder.
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
        }
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        let counters = self.counters.read();
        if let Some(c) = counters.get(&key) {
            c.increment(n);
            return;
        }
        drop(counters);
        self.counters
            .write()
            .entry(key)
            .or_insert_with(Counter::new)
            .increment(n);
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters.read().get(&key).map_or(0, Counter::get)
    }

    /// Sum of a counter across all label sets.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .read()
            .iter()
            .filter(|(k, _)| k.name == name)
            .map(|(_, c)| c.get())
            .sum()
    }

    pub fn gauge_add(&self, name: &str, labels: &[(&str, &str)], delta: i64) {
        let key = MetricKey::new(name, labels);
        let gauges = self.gauges.read();
        if let Some(g) = gauges.get(&key) {
            g.add(delta);
            return;
        }
        drop(gauges);
        self.gauges.write().entry(key).or_insert_with(Gauge::new).add(delta);
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = MetricKey::new(name, labels);
        self.gauges.read().get(&key).map_or(0, Gauge::get)
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        let histograms = self.histograms.read();
        if let Some(h) = histograms.get(&key) {
            h.observe(value);
            return;
        }
        drop(histograms);
        self.histograms
            .write()
            .entry(key)
            .or_insert_with(Histogram::new)
            .observe(value);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self
                .counters
                .read()
                .iter()
                .map(|(k, c)| (k.render(), c.get()))
                .collect(),
            gauges: self
                .gauges
                .read()
                .iter()
                .map(|(k, g)| (k.render(), g.get()))
                .collect(),
            histograms: self
                .histograms
                .read()
                .iter()
                .map(|(k, h)| (k.render(), h.summary()))
                .collect(),
        }
    }
}

impl RelayObserver for MetricsRecorder {
    fn observe(&self, incident: &RelayIncident) {
        match incident {
            RelayIncident::DecodeFailed { .. } => self.counter_inc(names::DECODE_ERRORS, &[], 1),
            RelayIncident::LookupFailed { .. } => self.counter_inc(names::LOOKUP_FAILURES, &[], 1),
            RelayIncident::EventDelivered { connections, .. } => {
                self.counter_inc(names::EVENTS_DELIVERED, &[], 1);
                self.histogram_observe(names::FANOUT_SIZE, &[], *connections as f64);
            }
            RelayIncident::DeliveryFailed { .. } => {
                self.counter_inc(names::DELIVERY_FAILURES, &[], 1);
            }
            RelayIncident::SendQueueFull { .. } => self.counter_inc(names::SEND_QUEUE_FULL, &[], 1),
            RelayIncident::PublishFailed { .. } => {
                self.counter_inc(names::PUBLISH_FAILURES, &[], 1);
            }
            RelayIncident::BrokerDisconnected => {
                self.counter_inc(names::BROKER_DISCONNECTS, &[], 1);
            }
            RelayIncident::BrokerConnected => self.counter_inc(names::BROKER_CONNECTS, &[], 1),
            RelayIncident::FrameRejected { kind } => {
                self.counter_inc(names::FRAMES_REJECTED, &[("kind", *kind)], 1);
            }
        }
    }
}
