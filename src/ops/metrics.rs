//! In-process metrics registry.
//!
//! Counters, gauges and histograms are keyed by series name plus a rendered
//! label set (`tenant="acme",via="local"`) and exported as Prometheus text.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Histogram bucket upper bounds in milliseconds.
pub const DURATION_BUCKETS_MS: [f64; 15] = [
    1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 150.0, 200.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
    10000.0,
];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SeriesKey {
    name: String,
    labels: String,
}

impl SeriesKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            labels: render_labels(labels),
        }
    }
}

#[derive(Debug, Clone)]
struct Histogram {
    buckets: [u64; DURATION_BUCKETS_MS.len()],
    count: u64,
    sum: f64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: [0; DURATION_BUCKETS_MS.len()],
            count: 0,
            sum: 0.0,
        }
    }
}

impl Histogram {
    fn observe(&mut self, value: f64) {
        let value = if value.is_finite() { value.max(0.0) } else { 0.0 };
        for (idx, bound) in DURATION_BUCKETS_MS.iter().enumerate() {
            if value <= *bound {
                self.buckets[idx] += 1;
                break;
            }
        }
        self.count += 1;
        self.sum += value;
    }
}

/// Snapshot of one histogram series, for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: f64,
}

/// Shared metrics sink; cheap to clone behind an `Arc`.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: Mutex<BTreeMap<SeriesKey, u64>>,
    gauges: Mutex<BTreeMap<SeriesKey, i64>>,
    histograms: Mutex<BTreeMap<SeriesKey, Histogram>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, value: u64, labels: &[(&str, &str)]) {
        let key = SeriesKey::new(name, labels);
        let mut counters = self.counters.lock();
        let entry = counters.entry(key).or_insert(0);
        *entry = entry.saturating_add(value);
    }

    pub fn gauge_set(&self, name: &str, value: i64, labels: &[(&str, &str)]) {
        let key = SeriesKey::new(name, labels);
        self.gauges.lock().insert(key, value);
    }

    pub fn gauge_add(&self, name: &str, delta: i64, labels: &[(&str, &str)]) -> i64 {
        let key = SeriesKey::new(name, labels);
        let mut gauges = self.gauges.lock();
        let entry = gauges.entry(key).or_insert(0);
        *entry = entry.saturating_add(delta);
        *entry
    }

    pub fn histogram_observe(&self, name: &str, value_ms: f64, labels: &[(&str, &str)]) {
        let key = SeriesKey::new(name, labels);
        self.histograms
            .lock()
            .entry(key)
            .or_default()
            .observe(value_ms);
    }

    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = SeriesKey::new(name, labels);
        self.counters.lock().get(&key).copied().unwrap_or(0)
    }

    /// Sum of a counter across every label set.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .iter()
            .filter(|(key, _)| key.name == name)
            .map(|(_, value)| *value)
            .sum()
    }

    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<i64> {
        let key = SeriesKey::new(name, labels);
        self.gauges.lock().get(&key).copied()
    }

    pub fn histogram_snapshot(
        &self,
        name: &str,
        labels: &[(&str, &str)],
    ) -> Option<HistogramSnapshot> {
        let key = SeriesKey::new(name, labels);
        self.histograms.lock().get(&key).map(|h| HistogramSnapshot {
            count: h.count,
            sum: h.sum,
        })
    }

    /// Render all series in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut body = String::new();
        for (key, value) in self.counters.lock().iter() {
            push_sample(&mut body, &key.name, &key.labels, None, &value.to_string());
        }
        for (key, value) in self.gauges.lock().iter() {
            push_sample(&mut body, &key.name, &key.labels, None, &value.to_string());
        }
        for (key, hist) in self.histograms.lock().iter() {
            let bucket_name = format!("{}_bucket", key.name);
            let mut cumulative = 0u64;
            for (idx, bound) in DURATION_BUCKETS_MS.iter().enumerate() {
                cumulative += hist.buckets[idx];
                let le = format!("le=\"{}\"", bound);
                push_sample(
                    &mut body,
                    &bucket_name,
                    &key.labels,
                    Some(&le),
                    &cumulative.to_string(),
                );
            }
            push_sample(
                &mut body,
                &bucket_name,
                &key.labels,
                Some("le=\"+Inf\""),
                &hist.count.to_string(),
            );
            push_sample(
                &mut body,
                &format!("{}_sum", key.name),
                &key.labels,
                None,
                &hist.sum.to_string(),
            );
            push_sample(
                &mut body,
                &format!("{}_count", key.name),
                &key.labels,
                None,
                &hist.count.to_string(),
            );
        }
        body
    }
}

fn push_sample(body: &mut String, name: &str, labels: &str, extra: Option<&str>, value: &str) {
    let joined = match (labels.is_empty(), extra) {
        (true, None) => String::new(),
        (true, Some(extra)) => extra.to_string(),
        (false, None) => labels.to_string(),
        (false, Some(extra)) => format!("{labels},{extra}"),
    };
    if joined.is_empty() {
        let _ = writeln!(body, "{name} {value}");
    } else {
        let _ = writeln!(body, "{name}{{{joined}}} {value}");
    }
}

fn render_labels(labels: &[(&str, &str)]) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect::<Vec<_>>()
        .join(",")
}

fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}
