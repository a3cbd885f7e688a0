//! Engine health overview.
//!
//! Summarises cache effectiveness, transport counters and breaker state.
//! Used by `vctx stats` and the `stats` tool.

use serde::Serialize;

use crate::cache::CacheStats;
use crate::circuit::CircuitState;
use crate::transport::TransportStats;

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub base_url: String,
    pub cache: CacheStats,
    pub transport: TransportStats,
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
    pub cache_file: Option<String>,
}

impl StatsReport {
    /// Human-readable multi-line summary.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("Vault Context — Engine Stats\n");
        out.push_str("============================\n\n");
        out.push_str(&format!("  Vault:       {}\n", self.base_url));
        out.push_str(&format!(
            "  Circuit:     {} ({} consecutive failures)\n",
            circuit_label(self.circuit),
            self.consecutive_failures
        ));
        out.push('\n');
        out.push_str("  Cache:\n");
        out.push_str(&format!("    Entries:   {}\n", self.cache.entries));
        out.push_str(&format!("    Size:      {}\n", format_bytes(self.cache.bytes as u64)));
        out.push_str(&format!(
            "    Hit rate:  {:.1}% ({} hits / {} misses)\n",
            self.cache.hit_rate * 100.0,
            self.cache.hits,
            self.cache.misses
        ));
        out.push_str(&format!(
            "    Evicted:   {} (expired {})\n",
            self.cache.evictions, self.cache.expirations
        ));
        if let Some(path) = &self.cache_file {
            out.push_str(&format!("    File:      {}\n", path));
        }
        out.push('\n');
        out.push_str("  Transport:\n");
        out.push_str(&format!(
            "    Requests:  {} ({} ok, {} failed)\n",
            self.transport.requests, self.transport.successes, self.transport.failures
        ));
        out.push_str(&format!("    Retries:   {}\n", self.transport.retries));
        out.push_str(&format!(
            "    Rejected:  {} (circuit open)\n",
            self.transport.circuit_rejections
        ));
        out.push_str(&format!(
            "    Latency:   {:.1} ms avg\n",
            self.transport.avg_latency_ms
        ));
        out
    }
}

fn circuit_label(state: CircuitState) -> &'static str {
    match state {
        CircuitState::Closed => "closed",
        CircuitState::Open => "OPEN",
        CircuitState::HalfOpen => "half-open",
    }
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn test_render_mentions_open_circuit() {
        let report = StatsReport {
            base_url: "https://127.0.0.1:27124".into(),
            cache: CacheStats {
                hits: 3,
                misses: 1,
                hit_rate: 0.75,
                entries: 2,
                bytes: 4096,
                evictions: 0,
                expirations: 1,
            },
            transport: TransportStats {
                requests: 4,
                successes: 1,
                failures: 3,
                retries: 2,
                circuit_rejections: 1,
                avg_latency_ms: 12.5,
                circuit: CircuitState::Open,
            },
            circuit: CircuitState::Open,
            consecutive_failures: 0,
            cache_file: None,
        };
        let text = report.render();
        assert!(text.contains("OPEN"));
        assert!(text.contains("75.0%"));
        assert!(text.contains("4.0 KB"));
    }
}
