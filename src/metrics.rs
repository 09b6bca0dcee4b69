//! Structured metrics shared by every component.
//!
//! Emission never blocks the caller: counters and gauges are atomics behind
//! a concurrent map, and diagnostic events go through `try_lock` into a
//! bounded ring, dropping (and counting the drop) on contention or overflow.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// A structured diagnostic event with stable field names.
#[derive(Debug, Clone, Serialize)]
pub struct MetricEvent {
    pub event: String,
    pub component: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub attributes: serde_json::Value,
}

impl MetricEvent {
    pub fn new(component: &'static str, event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            component,
            path: None,
            duration_ms: None,
            count: None,
            error: None,
            attributes: serde_json::Value::Null,
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn attributes(mut self, attributes: serde_json::Value) -> Self {
        self.attributes = attributes;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
}

#[derive(Debug, Default)]
struct HistogramCell {
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

pub struct Metrics {
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, AtomicU64>,
    histograms: DashMap<String, HistogramCell>,
    ring: Mutex<VecDeque<MetricEvent>>,
    ring_capacity: usize,
    dropped: AtomicU64,
}

impl Metrics {
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            counters: DashMap::new(),
            gauges: DashMap::new(),
            histograms: DashMap::new(),
            ring: Mutex::new(VecDeque::with_capacity(ring_capacity)),
            ring_capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn counter(&self, name: &str, delta: u64) {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn gauge(&self, name: &str, value: u64) {
        self.gauges
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn histogram(&self, name: &str, value: u64) {
        let cell = self
            .histograms
            .entry(name.to_string())
            .or_insert_with(|| HistogramCell {
                count: AtomicU64::new(0),
                sum: AtomicU64::new(0),
                min: AtomicU64::new(u64::MAX),
                max: AtomicU64::new(0),
            });
        cell.count.fetch_add(1, Ordering::Relaxed);
        cell.sum.fetch_add(value, Ordering::Relaxed);
        cell.min.fetch_min(value, Ordering::Relaxed);
        cell.max.fetch_max(value, Ordering::Relaxed);
    }

    /// Enqueue a diagnostic event. O(1) and non-failing: contention or a
    /// full ring drops the event and bumps the drop counter instead.
    pub fn record(&self, event: MetricEvent) {
        match self.ring.try_lock() {
            Some(mut ring) => {
                if ring.len() >= self.ring_capacity {
                    ring.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                ring.push_back(event);
            }
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str) -> u64 {
        self.gauges
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn histogram_summary(&self, name: &str) -> HistogramSummary {
        self.histograms
            .get(name)
            .map(|cell| {
                let count = cell.count.load(Ordering::Relaxed);
                HistogramSummary {
                    count,
                    sum: cell.sum.load(Ordering::Relaxed),
                    min: if count == 0 {
                        0
                    } else {
                        cell.min.load(Ordering::Relaxed)
                    },
                    max: cell.max.load(Ordering::Relaxed),
                }
            })
            .unwrap_or_default()
    }

    /// Most recent diagnostic events, oldest first.
    pub fn recent_events(&self) -> Vec<MetricEvent> {
        self.ring.lock().iter().cloned().collect()
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new(512)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::default();
        metrics.counter("ingest.rewrites", 2);
        metrics.counter("ingest.rewrites", 3);
        assert_eq!(metrics.counter_value("ingest.rewrites"), 5);
        assert_eq!(metrics.counter_value("unknown"), 0);
    }

    #[test]
    fn histogram_tracks_bounds() {
        let metrics = Metrics::default();
        metrics.histogram("search.latency_ms", 12);
        metrics.histogram("search.latency_ms", 3);
        metrics.histogram("search.latency_ms", 40);
        let summary = metrics.histogram_summary("search.latency_ms");
        assert_eq!(summary.count, 3);
        assert_eq!(summary.sum, 55);
        assert_eq!(summary.min, 3);
        assert_eq!(summary.max, 40);
    }

    #[test]
    fn ring_overflow_counts_drops() {
        let metrics = Metrics::new(2);
        for i in 0..5 {
            metrics.record(MetricEvent::new("test", format!("event-{i}")));
        }
        let events = metrics.recent_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "event-3");
        assert_eq!(metrics.dropped_events(), 3);
    }
}
