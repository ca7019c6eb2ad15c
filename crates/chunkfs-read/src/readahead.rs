//! Adaptive readahead window
//!
//! [`ReadaheadController`] watches the offsets a session reads and sizes the
//! window of data to prefetch past the cursor.
//!
//! # Features
//!
//! - **Sequential detection**: a read starting at (or just past) the end of
//!   the previous read grows the window, ×4 while it is below a sixteenth of
//!   the cap and ×2 after that
//! - **Random reset**: any other access drops the window to the minimum
//! - **Throughput cap**: a short history of recent reads bounds the window to
//!   about two expiration intervals worth of observed throughput, so prefetched
//!   data does not expire before it is consumed
//! - **Denial-aware**: a prefetch refused by the bandwidth governor undoes the
//!   growth of the read that triggered it
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use chunkfs_read::readahead::{AccessPattern, ReadaheadController};
//!
//! let mut ra = ReadaheadController::new(16 << 20, Duration::from_secs(1), 0, false);
//! assert_eq!(ra.feed(0, 4096), AccessPattern::Sequential);
//! assert_eq!(ra.feed(4096, 4096), AccessPattern::Sequential);
//! assert_eq!(ra.window(), 1 << 20);
//! assert_eq!(ra.feed(0, 4096), AccessPattern::Random);
//! assert_eq!(ra.window(), 64 << 10);
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::EngineConfig;

/// Smallest non-zero readahead window
pub const MIN_WINDOW: u64 = 64 * 1024;

const HISTORY_CAPACITY: usize = 64;
const HISTORY_VALIDITY_THRESHOLD: usize = 3;
const HISTORY_LIFESPAN: Duration = Duration::from_micros(1 << 20);

/// Classification of one access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPattern {
    Sequential,
    Random,
    /// Readahead is turned off
    Disabled,
}

/// Per-session readahead window state
#[derive(Debug, Clone)]
pub struct ReadaheadController {
    limit: u64,
    max_window: u64,
    min_window: u64,
    window: u64,
    previous_window: u64,
    last_pattern: AccessPattern,
    next_offset: u64,
    tolerance: u64,
    expiration: Duration,
    adaptive: bool,
    history: VecDeque<(Instant, u64)>,
    history_bytes: u64,
}

impl ReadaheadController {
    /// Create a controller capped at `limit` bytes
    pub fn new(limit: u64, expiration: Duration, tolerance: u64, adaptive: bool) -> Self {
        let enabled = limit > 0 && !expiration.is_zero();
        let min_window = if enabled { MIN_WINDOW.min(limit) } else { 0 };
        Self {
            limit,
            max_window: limit,
            min_window,
            window: min_window,
            previous_window: min_window,
            last_pattern: AccessPattern::Disabled,
            next_offset: 0,
            tolerance,
            expiration,
            adaptive,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            history_bytes: 0,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.max_readahead_window,
            config.cache_expiration,
            config.sequential_tolerance,
            config.adaptive_readahead,
        )
    }

    fn enabled(&self) -> bool {
        self.min_window > 0
    }

    /// Feed one read request and update the window
    pub fn feed(&mut self, offset: u64, size: u32) -> AccessPattern {
        if !self.enabled() {
            self.window = 0;
            return AccessPattern::Disabled;
        }

        if self.adaptive {
            let now = Instant::now();
            self.record_history(now, u64::from(size));
            self.adjust_max_window(now);
        }

        self.previous_window = self.window;
        let sequential =
            offset >= self.next_offset && offset - self.next_offset <= self.tolerance;

        self.last_pattern = if sequential {
            self.expand();
            AccessPattern::Sequential
        } else {
            self.window = self.min_window;
            AccessPattern::Random
        };

        self.next_offset = offset.saturating_add(u64::from(size));
        self.last_pattern
    }

    /// The prefetch for the last fed read was refused
    pub fn prefetch_denied(&mut self) {
        if self.last_pattern == AccessPattern::Sequential {
            self.window = self.previous_window;
        }
    }

    /// Current window in bytes
    pub fn window(&self) -> u64 {
        self.window
    }

    /// Effective cap after throughput adaptation
    pub fn max_window(&self) -> u64 {
        self.max_window
    }

    pub fn min_window(&self) -> u64 {
        self.min_window
    }

    /// Configured cap
    pub fn limit(&self) -> u64 {
        self.limit
    }

    fn expand(&mut self) {
        if self.window >= self.max_window {
            return;
        }
        let factor = if self.window < self.max_window / 16 { 4 } else { 2 };
        self.window = self.window.saturating_mul(factor).min(self.max_window);
    }

    fn record_history(&mut self, now: Instant, bytes: u64) {
        while let Some(&(at, old)) = self.history.front() {
            if self.history.len() < HISTORY_CAPACITY && now.duration_since(at) < HISTORY_LIFESPAN {
                break;
            }
            self.history.pop_front();
            self.history_bytes = self.history_bytes.saturating_sub(old);
        }
        self.history.push_back((now, bytes));
        self.history_bytes = self.history_bytes.saturating_add(bytes);
    }

    fn adjust_max_window(&mut self, now: Instant) {
        if self.history.len() < HISTORY_VALIDITY_THRESHOLD {
            return;
        }
        let Some(&(oldest, _)) = self.history.front() else {
            return;
        };
        let span = now.duration_since(oldest);
        if span.is_zero() {
            return;
        }

        let throughput = self.history_bytes as f64 / span.as_secs_f64();
        let adjusted = 2.0 * throughput * self.expiration.as_secs_f64();
        let adjusted = if adjusted.is_finite() {
            adjusted.min(self.limit as f64) as u64
        } else {
            self.limit
        };
        self.max_window = adjusted.clamp(self.min_window, self.limit);
    }
}
