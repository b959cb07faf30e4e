use dashmap::DashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

const LATENCY_BUCKETS_MS: &[u64] = &[50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000, 60_000];

#[derive(Debug, Default)]
struct Histogram {
    buckets: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: LATENCY_BUCKETS_MS.iter().map(|_| AtomicU64::new(0)).collect(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: u64) {
        for (bound, bucket) in LATENCY_BUCKETS_MS.iter().zip(&self.buckets) {
            if value <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn render(&self, out: &mut String, name: &str, labels: &str) {
        let sep = if labels.is_empty() { "" } else { "," };
        for (bound, bucket) in LATENCY_BUCKETS_MS.iter().zip(&self.buckets) {
            let _ = writeln!(
                out,
                "{}_bucket{{{}{}le=\"{}\"}} {}",
                name,
                labels,
                sep,
                bound,
                bucket.load(Ordering::Relaxed)
            );
        }
        let count = self.count.load(Ordering::Relaxed);
        let _ = writeln!(out, "{}_bucket{{{}{}le=\"+Inf\"}} {}", name, labels, sep, count);
        let _ = writeln!(out, "{}_sum{{{}}} {}", name, labels, self.sum.load(Ordering::Relaxed));
        let _ = writeln!(out, "{}_count{{{}}} {}", name, labels, count);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutcomeLabels {
    pub channel_id: i64,
    pub model: String,
    pub status: u16,
    pub group: String,
    pub user_id: i64,
}

impl OutcomeLabels {
    fn render(&self) -> String {
        format!(
            "channel=\"{}\",model=\"{}\",status=\"{}\",group=\"{}\",user=\"{}\"",
            self.channel_id,
            escape(&self.model),
            self.status,
            escape(&self.group),
            self.user_id
        )
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

/// Process-wide relay counters, rendered in the Prometheus text format.
#[derive(Debug)]
pub struct RelayMetrics {
    attempts: DashMap<(i64, String), AtomicU64>,
    retries: AtomicU64,
    successes: DashMap<OutcomeLabels, AtomicU64>,
    failures: DashMap<OutcomeLabels, AtomicU64>,
    channel_disabled: AtomicU64,
    e2e_latency: Histogram,
    channel_latency: DashMap<i64, Histogram>,
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            attempts: DashMap::new(),
            retries: AtomicU64::new(0),
            successes: DashMap::new(),
            failures: DashMap::new(),
            channel_disabled: AtomicU64::new(0),
            e2e_latency: Histogram::new(),
            channel_latency: DashMap::new(),
        }
    }

    pub fn record_attempt(&self, channel_id: i64, model: &str) {
        self.attempts
            .entry((channel_id, model.to_string()))
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, labels: OutcomeLabels, e2e_ms: u64) {
        self.successes.entry(labels).or_default().fetch_add(1, Ordering::Relaxed);
        self.e2e_latency.observe(e2e_ms);
    }

    pub fn record_failure(&self, labels: OutcomeLabels) {
        self.failures.entry(labels).or_default().fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_channel_disabled(&self) {
        self.channel_disabled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_channel_latency(&self, channel_id: i64, millis: u64) {
        self.channel_latency
            .entry(channel_id)
            .or_insert_with(Histogram::new)
            .observe(millis);
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.iter().map(|e| e.value().load(Ordering::Relaxed)).sum()
    }

    pub fn failures(&self) -> u64 {
        self.failures.iter().map(|e| e.value().load(Ordering::Relaxed)).sum()
    }

    pub fn attempts(&self, channel_id: i64, model: &str) -> u64 {
        self.attempts
            .get(&(channel_id, model.to_string()))
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// `backend_down` comes from the rate-limit store; `cache` from the entity cache.
    pub fn render(&self, backend_down: u64, cache_errors: u64) -> String {
        let mut out = String::new();

        out.push_str("# TYPE relay_attempts_total counter\n");
        let mut attempts: Vec<_> = self
            .attempts
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        attempts.sort();
        for ((channel, model), value) in attempts {
            let _ = writeln!(out, "relay_attempts_total{{channel=\"{}\",model=\"{}\"}} {}", channel, escape(&model), value);
        }

        out.push_str("# TYPE relay_retries_total counter\n");
        let _ = writeln!(out, "relay_retries_total {}", self.retries());

        for (name, map) in [("relay_success_total", &self.successes), ("relay_failure_total", &self.failures)] {
            let _ = writeln!(out, "# TYPE {} counter", name);
            let mut rows: Vec<_> = map
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect();
            rows.sort();
            for (labels, value) in rows {
                let _ = writeln!(out, "{}{{{}}} {}", name, labels.render(), value);
            }
        }

        out.push_str("# TYPE relay_channel_auto_disabled_total counter\n");
        let _ = writeln!(out, "relay_channel_auto_disabled_total {}", self.channel_disabled.load(Ordering::Relaxed));
        out.push_str("# TYPE relay_rate_limit_backend_down_total counter\n");
        let _ = writeln!(out, "relay_rate_limit_backend_down_total {}", backend_down);
        out.push_str("# TYPE relay_entity_cache_errors_total counter\n");
        let _ = writeln!(out, "relay_entity_cache_errors_total {}", cache_errors);

        out.push_str("# TYPE relay_e2e_latency_ms histogram\n");
        self.e2e_latency.render(&mut out, "relay_e2e_latency_ms", "");

        out.push_str("# TYPE relay_channel_latency_ms histogram\n");
        let mut channels: Vec<i64> = self.channel_latency.iter().map(|e| *e.key()).collect();
        channels.sort();
        for channel in channels {
            if let Some(histogram) = self.channel_latency.get(&channel) {
                histogram.render(&mut out, "relay_channel_latency_ms", &format!("channel=\"{}\"", channel));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(status: u16) -> OutcomeLabels {
        OutcomeLabels {
            channel_id: 1,
            model: "m".to_string(),
            status,
            group: "g".to_string(),
            user_id: 7,
        }
    }

    #[test]
    fn test_counters_render() {
        let metrics = RelayMetrics::new();
        metrics.record_attempt(1, "m");
        metrics.record_attempt(1, "m");
        metrics.record_retry();
        metrics.record_success(labels(200), 120);
        metrics.record_failure(labels(500));
        metrics.observe_channel_latency(1, 80);

        let text = metrics.render(3, 0);
        assert!(text.contains("relay_attempts_total{channel=\"1\",model=\"m\"} 2"));
        assert!(text.contains("relay_retries_total 1"));
        assert!(text.contains("relay_failure_total{channel=\"1\",model=\"m\",status=\"500\",group=\"g\",user=\"7\"} 1"));
        assert!(text.contains("relay_rate_limit_backend_down_total 3"));
        assert!(text.contains("relay_e2e_latency_ms_bucket{le=\"250\"} 1"));
        assert!(text.contains("relay_e2e_latency_ms_bucket{le=\"100\"} 0"));
        assert!(text.contains("relay_channel_latency_ms_bucket{channel=\"1\",le=\"100\"} 1"));
        assert_eq!(metrics.successes(), 1);
        assert_eq!(metrics.failures(), 1);
    }

    #[test]
    fn test_label_escaping() {
        assert_eq!(escape("a\"b"), "a\\\"b");
    }
}
