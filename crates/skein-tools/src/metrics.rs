use std::collections::HashMap;

use tokio::sync::Mutex;

/// Rolling per-tool performance numbers, shared across all runs.
#[derive(Debug, Clone, Default)]
pub struct ToolStats {
    pub invocations: u64,
    pub successes: u64,
    /// Cumulative average duration across all invocations.
    pub avg_duration_ms: f64,
}

impl ToolStats {
    pub fn success_rate(&self) -> f64 {
        if self.invocations == 0 {
            return 0.0;
        }
        self.successes as f64 / self.invocations as f64
    }
}

/// Per-tool metrics store. Updated on every invocation regardless of
/// outcome; updates for one tool id are serialized by the store lock.
pub struct ToolMetrics {
    stats: Mutex<HashMap<String, ToolStats>>,
}

impl ToolMetrics {
    pub fn new() -> Self {
        Self {
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub async fn record(&self, tool_id: &str, elapsed_ms: u64, succeeded: bool) {
        let mut stats = self.stats.lock().await;
        let entry = stats.entry(tool_id.to_string()).or_default();
        entry.invocations += 1;
        if succeeded {
            entry.successes += 1;
        }
        let n = entry.invocations as f64;
        entry.avg_duration_ms += (elapsed_ms as f64 - entry.avg_duration_ms) / n;
    }

    pub async fn snapshot(&self, tool_id: &str) -> Option<ToolStats> {
        self.stats.lock().await.get(tool_id).cloned()
    }
}

impl Default for ToolMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cumulative_average() {
        let metrics = ToolMetrics::new();
        metrics.record("t", 100, true).await;
        metrics.record("t", 200, true).await;
        metrics.record("t", 300, false).await;

        let stats = metrics.snapshot("t").await.unwrap();
        assert_eq!(stats.invocations, 3);
        assert_eq!(stats.successes, 2);
        assert!((stats.avg_duration_ms - 200.0).abs() < f64::EPSILON);
        assert!((stats.success_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unknown_tool() {
        let metrics = ToolMetrics::new();
        assert!(metrics.snapshot("nope").await.is_none());
        assert_eq!(ToolStats::default().success_rate(), 0.0);
    }
}
