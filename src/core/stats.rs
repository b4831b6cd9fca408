//! Process-wide connection statistics kept by the relay.
//!
//! Both counters live in one `AtomicU64` (attempts in the high half,
//! successes in the low half) so every update is a single compare-and-swap
//! and `successes <= attempts` holds at all times.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct ConnectionStats {
    counters: AtomicU64,
    started_at: Instant,
}

/// Snapshot returned by [`ConnectionStats::get_stats`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// `successes / attempts * 100`, one decimal, in `[0, 100]`.
    pub success_rate: f64,
    /// Relay uptime in hours, one decimal.
    pub uptime_hours: f64,
    pub uptime_secs: u64,
    pub total_attempts: u32,
    pub successful_connections: u32,
}

#[inline]
fn pack(attempts: u32, successes: u32) -> u64 {
    ((attempts as u64) << 32) | successes as u64
}

#[inline]
fn unpack(v: u64) -> (u32, u32) {
    ((v >> 32) as u32, v as u32)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self {
            counters: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    fn update(&self, f: impl Fn(u32, u32) -> Option<(u32, u32)>) -> bool {
        self.counters
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                let (a, s) = unpack(v);
                f(a, s).map(|(a, s)| pack(a, s))
            })
            .is_ok()
    }

    pub fn increment_attempts(&self) {
        self.update(|a, s| Some((a.saturating_add(1), s)));
    }

    /// No-op once every attempt is already counted as a success.
    pub fn increment_successes(&self) -> bool {
        self.update(|a, s| (s < a).then_some((a, s + 1)))
    }

    /// No-op at zero attempts; successes are clamped down to attempts.
    pub fn decrement_attempts(&self) -> bool {
        self.update(|a, s| {
            if a == 0 {
                return None;
            }
            let a = a - 1;
            Some((a, s.min(a)))
        })
    }

    pub fn counts(&self) -> (u32, u32) {
        unpack(self.counters.load(Ordering::Acquire))
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        let (attempts, successes) = self.counts();
        let success_rate = if attempts == 0 {
            0.0
        } else {
            round1((successes as f64 / attempts as f64 * 100.0).clamp(0.0, 100.0))
        };
        let uptime = self.started_at.elapsed();

        StatsSnapshot {
            success_rate,
            uptime_hours: round1(uptime.as_secs_f64() / 3600.0),
            uptime_secs: uptime.as_secs(),
            total_attempts: attempts,
            successful_connections: successes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn empty_stats_report_zero_rate() {
        let stats = ConnectionStats::new();
        let snap = stats.get_stats();
        assert_eq!(snap.success_rate, 0.0);
        assert_eq!(snap.total_attempts, 0);
        assert_eq!(snap.uptime_hours, 0.0);
    }

    #[test]
    fn successes_never_exceed_attempts() {
        let stats = ConnectionStats::new();
        assert!(!stats.increment_successes());
        stats.increment_attempts();
        assert!(stats.increment_successes());
        assert!(!stats.increment_successes());
        assert_eq!(stats.counts(), (1, 1));
        assert_eq!(stats.get_stats().success_rate, 100.0);
    }

    #[test]
    fn decrement_clamps_successes() {
        let stats = ConnectionStats::new();
        assert!(!stats.decrement_attempts());
        stats.increment_attempts();
        stats.increment_successes();
        assert!(stats.decrement_attempts());
        assert_eq!(stats.counts(), (0, 0));
    }

    #[test]
    fn rate_is_rounded_to_one_decimal() {
        let stats = ConnectionStats::new();
        for _ in 0..3 {
            stats.increment_attempts();
        }
        stats.increment_successes();
        assert_eq!(stats.get_stats().success_rate, 33.3);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let stats = ConnectionStats::new();
        let json = serde_json::to_value(stats.get_stats()).unwrap();
        assert!(json.get("successRate").is_some());
        assert!(json.get("uptimeHours").is_some());
        assert!(json.get("totalAttempts").is_some());
    }

    #[test]
    fn concurrent_updates_keep_invariant() {
        let stats = Arc::new(ConnectionStats::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        stats.increment_attempts();
                        stats.increment_successes();
                        if i % 2 == 0 {
                            stats.decrement_attempts();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let (a, s) = stats.counts();
        assert!(s <= a);
        let rate = stats.get_stats().success_rate;
        assert!((0.0..=100.0).contains(&rate));
    }
}
