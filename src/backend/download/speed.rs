use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Bytes per second over a trailing window.
pub struct SpeedMeter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedMeter {
    pub fn new(window: Duration) -> Self {
        SpeedMeter {
            window: window.max(Duration::from_millis(1)),
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    pub fn record_at(&mut self, at: Instant, bytes: u64) {
        self.samples.push_back((at, bytes));
        self.expire(at);
    }

    pub fn rate(&mut self) -> u64 {
        self.rate_at(Instant::now())
    }

    pub fn rate_at(&mut self, now: Instant) -> u64 {
        self.expire(now);
        let total: u64 = self.samples.iter().map(|(_, bytes)| bytes).sum();
        (total as f64 / self.window.as_secs_f64()) as u64
    }

    fn expire(&mut self, now: Instant) {
        while let Some((at, _)) = self.samples.front() {
            if now.saturating_duration_since(*at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}
