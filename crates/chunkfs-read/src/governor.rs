//! Bandwidth governor for speculative reads
//!
//! Keeps speculative traffic (readahead, parity prefetch, redundant waves)
//! proportional to what callers actually asked for. Both flows are accounted
//! over a sliding window equal to the cache expiration interval.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use chunkfs_read::governor::{Admission, BandwidthGovernor};
//!
//! let governor = BandwidthGovernor::new(1.0, Duration::from_secs(1));
//! assert_eq!(governor.admit(4096), Admission::Deny);
//!
//! governor.record_demand(8192);
//! assert_eq!(governor.admit(4096), Admission::Allow);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Outcome of a prefetch admission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny,
}

/// Governor statistics
#[derive(Debug, Clone, Default)]
pub struct GovernorStats {
    /// Demanded bytes currently in the window
    pub window_demanded: u64,
    /// Speculative bytes currently in the window
    pub window_speculative: u64,
    pub admitted: u64,
    pub denied: u64,
    /// Bytes recorded without admission (redundant waves)
    pub forced_bytes: u64,
}

#[derive(Debug, Default)]
struct Flow {
    entries: VecDeque<(Instant, u64)>,
    total: u64,
}

impl Flow {
    fn push(&mut self, at: Instant, bytes: u64) {
        self.entries.push_back((at, bytes));
        self.total = self.total.saturating_add(bytes);
    }

    fn expire(&mut self, now: Instant, window: Duration) {
        while let Some(&(at, bytes)) = self.entries.front() {
            if now.duration_since(at) < window {
                break;
            }
            self.entries.pop_front();
            self.total = self.total.saturating_sub(bytes);
        }
    }
}

#[derive(Debug, Default)]
struct Account {
    demanded: Flow,
    speculative: Flow,
}

impl Account {
    fn expire(&mut self, now: Instant, window: Duration) {
        self.demanded.expire(now, window);
        self.speculative.expire(now, window);
    }
}

#[derive(Debug, Default)]
struct GovernorStatsInternal {
    admitted: AtomicU64,
    denied: AtomicU64,
    forced_bytes: AtomicU64,
}

/// Sliding-window ratio limiter for speculative bytes
#[derive(Debug)]
pub struct BandwidthGovernor {
    ratio: f64,
    window: Duration,
    account: Mutex<Account>,
    stats: GovernorStatsInternal,
}

impl BandwidthGovernor {
    pub fn new(ratio: f64, window: Duration) -> Self {
        Self {
            ratio,
            window,
            account: Mutex::new(Account::default()),
            stats: GovernorStatsInternal::default(),
        }
    }

    /// Record bytes a caller asked for
    pub fn record_demand(&self, bytes: u64) {
        let now = Instant::now();
        let mut account = self.account.lock();
        account.expire(now, self.window);
        account.demanded.push(now, bytes);
    }

    /// Ask to spend `bytes` on a prefetch; never blocks
    pub fn admit(&self, bytes: u64) -> Admission {
        let now = Instant::now();
        let mut account = self.account.lock();
        account.expire(now, self.window);

        let budget = self.ratio * account.demanded.total as f64;
        let wanted = account.speculative.total.saturating_add(bytes) as f64;

        if account.demanded.total > 0 && wanted <= budget {
            account.speculative.push(now, bytes);
            self.stats.admitted.fetch_add(1, Ordering::Relaxed);
            Admission::Allow
        } else {
            self.stats.denied.fetch_add(1, Ordering::Relaxed);
            Admission::Deny
        }
    }

    /// Account speculative bytes that were sent without asking
    pub fn record_speculative(&self, bytes: u64) {
        let now = Instant::now();
        let mut account = self.account.lock();
        account.expire(now, self.window);
        account.speculative.push(now, bytes);
        self.stats.forced_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn stats(&self) -> GovernorStats {
        let now = Instant::now();
        let mut account = self.account.lock();
        account.expire(now, self.window);
        GovernorStats {
            window_demanded: account.demanded.total,
            window_speculative: account.speculative.total,
            admitted: self.stats.admitted.load(Ordering::Relaxed),
            denied: self.stats.denied.load(Ordering::Relaxed),
            forced_bytes: self.stats.forced_bytes.load(Ordering::Relaxed),
        }
    }
}
