//! Oscillation detection over recent selections
//!
//! A sliding window of selection timestamps; hitting the threshold yields an
//! exponentially growing backoff. The window is private to the owning
//! process and never distributed.

use crate::config::RelayControlConfig;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Emitted when the threshold is crossed.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffSignal {
    /// How long automatic selection must stay suspended
    pub delay: Duration,
    /// Consecutive detections including this one
    pub consecutive: u32,
    /// Selections observed inside the window at detection time
    pub events_in_window: usize,
}

pub struct LoopDetector {
    window: Duration,
    threshold: usize,
    base_delay: Duration,
    max_delay: Duration,
    reset_after: Duration,
    events: VecDeque<Instant>,
    consecutive: u32,
    last_detection: Option<Instant>,
}

impl LoopDetector {
    pub fn new(config: &RelayControlConfig) -> Self {
        Self {
            window: config.loop_window,
            threshold: config.loop_threshold,
            base_delay: config.backoff_base,
            max_delay: config.backoff_max,
            reset_after: config.loop_count_reset_after,
            events: VecDeque::new(),
            consecutive: 0,
            last_detection: None,
        }
    }

    /// Record an automatic selection happening now.
    pub fn record(&mut self) -> Option<BackoffSignal> {
        self.record_at(Instant::now())
    }

    /// Record an automatic selection at an explicit instant.
    pub fn record_at(&mut self, now: Instant) -> Option<BackoffSignal> {
        if let Some(last) = self.last_detection {
            if now.duration_since(last) >= self.reset_after {
                self.consecutive = 0;
            }
        }

        self.events.push_back(now);
        while let Some(&oldest) = self.events.front() {
            if now.duration_since(oldest) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }

        let events_in_window = self.events.len();
        if events_in_window < self.threshold {
            return None;
        }

        let delay = self.backoff_delay();
        self.consecutive = self.consecutive.saturating_add(1);
        self.last_detection = Some(now);
        // A detection consumes its window; the next one needs fresh churn
        self.events.clear();

        Some(BackoffSignal {
            delay,
            consecutive: self.consecutive,
            events_in_window,
        })
    }

    fn backoff_delay(&self) -> Duration {
        let exponent = self.consecutive.min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .map(|delay| delay.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }

    /// Selections currently inside the window.
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn window_seconds(&self) -> u64 {
        self.window.as_secs()
    }
}
