//! Backlog warnings per subscription
//!
//! Each subscription owns a `BacklogMonitor`. Size warnings fire every time
//! the backlog reaches another full multiple of the size threshold. Latency
//! warnings fire when no item has finished for a full threshold, then again
//! after each further threshold; finishing an item resets that escalation.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::logger::FlowLogger;

/// A warning raised by a backlog monitor
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BacklogWarning {
    /// The backlog reached another multiple of the size threshold
    Size {
        /// Affected subscription, `{element}.{stream}`
        stream: String,
        /// Current backlog size
        size: usize,
    },
    /// Nothing finished for too long
    Latency {
        /// Affected subscription, `{element}.{stream}`
        stream: String,
        /// Current backlog size
        size: usize,
        /// Time since the last item finished (or the oldest item arrived)
        elapsed: Duration,
    },
}

impl fmt::Display for BacklogWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Size { stream, size } => write!(
                f,
                "Backlog for {} is growing: {} events waiting or in progress",
                stream, size
            ),
            Self::Latency {
                stream,
                size,
                elapsed,
            } => write!(
                f,
                "Slow processing detected for {}: {} events waiting or in progress, no event finished for {}ms",
                stream,
                size,
                elapsed.as_millis()
            ),
        }
    }
}

/// Bookkeeping of one subscription's backlog
#[derive(Debug, Default)]
pub struct BacklogState {
    arrivals: VecDeque<Instant>,
    size_level: usize,
    latency_warnings: u32,
    last_dequeue: Option<Instant>,
}

impl BacklogState {
    /// Items waiting or in progress
    pub fn size(&self) -> usize {
        self.arrivals.len()
    }

    /// Latency warnings issued since the last dequeue
    pub fn latency_warnings(&self) -> u32 {
        self.latency_warnings
    }

    /// Record an arrival; returns the new size level if a warning is due
    pub fn enqueue(&mut self, now: Instant, size_threshold: usize) -> Option<usize> {
        self.arrivals.push_back(now);
        let level = self.size() / size_threshold.max(1);
        if level > self.size_level {
            self.size_level = level;
            Some(level)
        } else {
            None
        }
    }

    /// Record that an item finished
    pub fn dequeue(&mut self, now: Instant, size_threshold: usize) {
        self.arrivals.pop_front();
        self.last_dequeue = Some(now);
        self.latency_warnings = 0;
        self.size_level = self.size_level.min(self.size() / size_threshold.max(1));
    }

    /// Check for stalled progress; returns the elapsed time if a warning is due
    pub fn check_latency(&mut self, now: Instant, threshold: Duration) -> Option<Duration> {
        let oldest = *self.arrivals.front()?;
        let since = match self.last_dequeue {
            Some(last) if last > oldest => last,
            _ => oldest,
        };
        let elapsed = now.saturating_duration_since(since);
        let due = threshold.saturating_mul(self.latency_warnings.saturating_add(1));
        if elapsed >= due {
            self.latency_warnings += 1;
            Some(elapsed)
        } else {
            None
        }
    }
}

/// Backlog monitor attached to one subscription
#[derive(Debug)]
pub struct BacklogMonitor {
    stream: String,
    size_threshold: usize,
    latency_threshold: Duration,
    state: Mutex<BacklogState>,
}

impl BacklogMonitor {
    /// Create a monitor for the subscription labeled `stream`
    pub fn new(stream: impl Into<String>, size_threshold: usize, latency_threshold: Duration) -> Self {
        Self {
            stream: stream.into(),
            size_threshold: size_threshold.max(1),
            latency_threshold,
            state: Mutex::new(BacklogState::default()),
        }
    }

    /// Subscription label
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Items waiting or in progress
    pub fn size(&self) -> usize {
        self.with_state(|s| s.size())
    }

    /// An event was handed to the limiter
    pub fn enqueued(&self) -> Option<BacklogWarning> {
        let now = Instant::now();
        let threshold = self.size_threshold;
        self.with_state(|s| s.enqueue(now, threshold).map(|_| s.size()))
            .map(|size| BacklogWarning::Size {
                stream: self.stream.clone(),
                size,
            })
    }

    /// A handler invocation finished
    pub fn dequeued(&self) {
        let now = Instant::now();
        let threshold = self.size_threshold;
        self.with_state(|s| s.dequeue(now, threshold));
    }

    /// Check for stalled progress
    pub fn check(&self) -> Option<BacklogWarning> {
        self.check_at(Instant::now())
    }

    fn check_at(&self, now: Instant) -> Option<BacklogWarning> {
        let threshold = self.latency_threshold;
        self.with_state(|s| s.check_latency(now, threshold).map(|elapsed| (s.size(), elapsed)))
            .map(|(size, elapsed)| BacklogWarning::Latency {
                stream: self.stream.clone(),
                size,
                elapsed,
            })
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut BacklogState) -> R) -> R {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }
}

/// Periodically check `monitors` for stalled progress, logging warnings
pub fn spawn_watchdog(
    monitors: Vec<Arc<BacklogMonitor>>,
    interval: Duration,
    logger: FlowLogger,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            for monitor in &monitors {
                if let Some(warning) = monitor.check() {
                    logger.warn(warning.to_string());
                }
            }
        }
    })
}
