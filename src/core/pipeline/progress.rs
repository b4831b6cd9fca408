//! Throughput, ETA and progress throttling shared by sender and receiver.

use super::Direction;
use crate::utils::formatters::{format_eta, format_file_size, format_speed};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct BatchProgress {
    pub direction: Direction,
    pub file_name: String,
    /// 1-based position of the current file.
    pub file_index: u32,
    pub file_count: u32,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub percent: u8,
    /// Bytes per second; `None` until the warm-up period has passed.
    pub speed_bps: Option<f64>,
    pub eta: Option<Duration>,
}

impl fmt::Display for BatchProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{}] {} {}% ({} / {})",
            self.file_index,
            self.file_count,
            self.file_name,
            self.percent,
            format_file_size(self.bytes_transferred),
            format_file_size(self.total_bytes),
        )?;
        if let (Some(speed), Some(eta)) = (self.speed_bps, self.eta) {
            write!(f, " {} ETA {}", format_speed(speed), format_eta(eta))?;
        }
        Ok(())
    }
}

/// Cumulative byte counter for one batch.
#[derive(Debug)]
pub struct ThroughputMeter {
    total: u64,
    transferred: u64,
    started: Instant,
    last_emit: Option<Instant>,
    last_percent: u8,
    throttle: Duration,
    warmup: Duration,
}

impl ThroughputMeter {
    pub fn new(total: u64, throttle: Duration, warmup: Duration) -> Self {
        Self {
            total,
            transferred: 0,
            started: Instant::now(),
            last_emit: None,
            last_percent: 0,
            throttle,
            warmup,
        }
    }

    pub fn advance(&mut self, bytes: u64) {
        self.transferred = self.transferred.saturating_add(bytes);
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn is_complete(&self) -> bool {
        self.transferred >= self.total
    }

    /// Whether a progress event is due: always on completion, otherwise at
    /// most once per throttle window.
    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        let due = self.is_complete()
            || self
                .last_emit
                .map_or(true, |t| now.duration_since(t) >= self.throttle);
        if due {
            self.last_emit = Some(now);
        }
        due
    }

    /// Floor percentage, never decreasing.
    fn percent(&mut self) -> u8 {
        let pct = if self.total == 0 {
            100
        } else {
            ((self.transferred.min(self.total) as u128 * 100) / self.total as u128) as u8
        };
        self.last_percent = self.last_percent.max(pct);
        self.last_percent
    }

    fn rate(&self) -> (Option<f64>, Option<Duration>) {
        let elapsed = self.started.elapsed();
        if elapsed < self.warmup || elapsed.is_zero() {
            return (None, None);
        }
        let speed = self.transferred as f64 / elapsed.as_secs_f64();
        if speed <= 0.0 {
            return (Some(0.0), None);
        }
        let remaining = self.total.saturating_sub(self.transferred) as f64;
        (Some(speed), Some(Duration::from_secs_f64(remaining / speed)))
    }

    pub fn snapshot(
        &mut self,
        direction: Direction,
        file_name: &str,
        file_index: u32,
        file_count: u32,
    ) -> BatchProgress {
        let (speed_bps, eta) = self.rate();
        BatchProgress {
            direction,
            file_name: file_name.to_string(),
            file_index,
            file_count,
            bytes_transferred: self.transferred,
            total_bytes: self.total,
            percent: self.percent(),
            speed_bps,
            eta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meter(total: u64) -> ThroughputMeter {
        ThroughputMeter::new(total, Duration::from_millis(100), Duration::from_millis(500))
    }

    #[tokio::test(start_paused = true)]
    async fn throttles_between_updates() {
        let mut m = meter(1000);
        m.advance(10);
        assert!(m.should_emit());
        m.advance(10);
        assert!(!m.should_emit());
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(m.should_emit());
    }

    #[tokio::test(start_paused = true)]
    async fn completion_always_emits() {
        let mut m = meter(100);
        m.advance(50);
        assert!(m.should_emit());
        m.advance(50);
        assert!(m.should_emit());
        assert_eq!(m.snapshot(Direction::Send, "f", 1, 1).percent, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn speed_reported_after_warmup() {
        let mut m = meter(10_000);
        m.advance(1000);
        assert!(m.snapshot(Direction::Send, "f", 1, 1).speed_bps.is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        let p = m.snapshot(Direction::Send, "f", 1, 1);
        let speed = p.speed_bps.unwrap();
        assert!((speed - 1000.0).abs() < 1.0);
        assert_eq!(p.eta.unwrap().as_secs(), 9);
    }

    #[tokio::test]
    async fn percent_never_decreases() {
        let mut m = meter(300);
        let mut last = 0;
        for _ in 0..3 {
            m.advance(100);
            let p = m.snapshot(Direction::Receive, "f", 1, 1).percent;
            assert!(p >= last);
            last = p;
        }
        assert_eq!(last, 100);
    }
}
