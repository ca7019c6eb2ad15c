//! Retry and timeout policy for wave reads
//!
//! The policy is pure: given the ledger of attempts issued so far and the
//! time elapsed since the logical read began, it decides what the dispatcher
//! does next. Keeping it free of I/O and clocks makes every timing rule
//! testable without a runtime.
//!
//! # Budgets
//!
//! - **Connect**: `max(connect_timeout, round_trip_estimate)` per attempt
//! - **Wave**: data-wait budget per attempt, measured from the moment the
//!   connection was established
//! - **Total**: hard ceiling on the logical read, checked before anything else
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use chunkfs_read::config::EngineConfig;
//! use chunkfs_read::policy::{AttemptLedger, Decision, RetryTimeoutPolicy};
//!
//! let policy = RetryTimeoutPolicy::new(&EngineConfig::default());
//! let ledger = AttemptLedger::new(2);
//! assert!(matches!(policy.decide(&ledger, Duration::ZERO), Decision::Issue { server: 0, .. }));
//! ```

use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::AttemptFailure;

/// Budgets applied to one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptTimeouts {
    pub connect: Duration,
    pub wave: Duration,
}

/// Lifecycle of one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptPhase {
    Connecting,
    /// Connected at `since`, waiting for data
    Receiving { since: Duration },
    Failed(AttemptFailure),
}

/// One attempt of a fetch against one server
#[derive(Debug, Clone)]
pub struct ReadAttempt {
    /// Sequence number within the fetch, starting at zero
    pub seq: u32,
    /// Index into the candidate server list
    pub server: usize,
    /// Offset from the start of the logical read
    pub issued_at: Duration,
    pub timeouts: AttemptTimeouts,
    pub phase: AttemptPhase,
}

impl ReadAttempt {
    /// When the current phase runs out of budget; `None` once failed
    pub fn phase_deadline(&self) -> Option<Duration> {
        match self.phase {
            AttemptPhase::Connecting => Some(self.issued_at.saturating_add(self.timeouts.connect)),
            AttemptPhase::Receiving { since } => Some(since.saturating_add(self.timeouts.wave)),
            AttemptPhase::Failed(_) => None,
        }
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.phase, AttemptPhase::Failed(_))
    }

    /// Alive but past its phase budget
    pub fn is_stalled(&self, elapsed: Duration) -> bool {
        self.phase_deadline().is_some_and(|deadline| elapsed >= deadline)
    }
}

/// Every attempt issued by one fetch
#[derive(Debug, Clone)]
pub struct AttemptLedger {
    server_count: usize,
    attempts: Vec<ReadAttempt>,
}

impl AttemptLedger {
    pub fn new(server_count: usize) -> Self {
        Self {
            server_count,
            attempts: Vec::new(),
        }
    }

    pub fn server_count(&self) -> usize {
        self.server_count
    }

    pub fn attempts(&self) -> &[ReadAttempt] {
        &self.attempts
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// Attempts that have not failed yet
    pub fn in_flight(&self) -> usize {
        self.attempts.iter().filter(|a| a.is_alive()).count()
    }

    /// Record a newly issued attempt and return its sequence number
    pub fn record_issue(&mut self, server: usize, at: Duration, timeouts: AttemptTimeouts) -> u32 {
        let seq = self.attempts.len() as u32;
        self.attempts.push(ReadAttempt {
            seq,
            server,
            issued_at: at,
            timeouts,
            phase: AttemptPhase::Connecting,
        });
        seq
    }

    /// The attempt's connection is up; its wave clock starts now
    pub fn mark_connected(&mut self, seq: u32, at: Duration) {
        if let Some(attempt) = self.attempts.get_mut(seq as usize) {
            if attempt.phase == AttemptPhase::Connecting {
                attempt.phase = AttemptPhase::Receiving { since: at };
            }
        }
    }

    pub fn mark_failed(&mut self, seq: u32, failure: AttemptFailure) {
        if let Some(attempt) = self.attempts.get_mut(seq as usize) {
            attempt.phase = AttemptPhase::Failed(failure);
        }
    }

    pub fn get(&self, seq: u32) -> Option<&ReadAttempt> {
        self.attempts.get(seq as usize)
    }

    /// Most recent failure, if any attempt failed
    pub fn last_failure(&self) -> Option<&AttemptFailure> {
        self.attempts.iter().rev().find_map(|a| match &a.phase {
            AttemptPhase::Failed(failure) => Some(failure),
            _ => None,
        })
    }

    fn tried(&self, server: usize) -> bool {
        self.attempts.iter().any(|a| a.server == server)
    }

    fn busy(&self, server: usize, elapsed: Duration) -> bool {
        self.attempts
            .iter()
            .any(|a| a.server == server && a.is_alive() && !a.is_stalled(elapsed))
    }
}

/// Why a fetch gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    AllReplicasExhausted,
    TotalTimeout,
}

/// Next step for the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// First attempt of the fetch
    Issue {
        server: usize,
        timeouts: AttemptTimeouts,
    },
    /// Start another wave; earlier attempts keep running
    RetryNextServer {
        server: usize,
        timeouts: AttemptTimeouts,
    },
    /// Nothing to do until this much time has passed or an attempt reports
    Wait(Duration),
    Fail(FailReason),
}

/// Timing and server-rotation rules for one fetch
#[derive(Debug, Clone)]
pub struct RetryTimeoutPolicy {
    max_attempts: u32,
    total: Duration,
    timeouts: AttemptTimeouts,
}

impl RetryTimeoutPolicy {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts(),
            total: config.total_read_timeout,
            timeouts: AttemptTimeouts {
                connect: config.connect_budget(),
                wave: config.effective_wave_timeout(),
            },
        }
    }

    pub fn total_timeout(&self) -> Duration {
        self.total
    }

    pub fn attempt_timeouts(&self) -> AttemptTimeouts {
        self.timeouts
    }

    /// Decide the next step given the attempts so far
    pub fn decide(&self, ledger: &AttemptLedger, elapsed: Duration) -> Decision {
        if elapsed >= self.total {
            return Decision::Fail(FailReason::TotalTimeout);
        }
        if ledger.server_count() == 0 {
            return Decision::Fail(FailReason::AllReplicasExhausted);
        }
        if ledger.is_empty() {
            return Decision::Issue {
                server: 0,
                timeouts: self.timeouts,
            };
        }

        // Earliest budget expiry among attempts still within budget
        let pending = ledger
            .attempts()
            .iter()
            .filter(|a| !a.is_stalled(elapsed))
            .filter_map(ReadAttempt::phase_deadline)
            .min();

        if let Some(deadline) = pending {
            return Decision::Wait(deadline.min(self.total) - elapsed);
        }

        if (ledger.len() as u32) < self.max_attempts {
            return Decision::RetryNextServer {
                server: self.next_server(ledger, elapsed),
                timeouts: self.timeouts,
            };
        }

        // Out of retries; stalled attempts may still answer before the ceiling
        if ledger.in_flight() > 0 {
            return Decision::Wait(self.total - elapsed);
        }

        Decision::Fail(FailReason::AllReplicasExhausted)
    }

    fn next_server(&self, ledger: &AttemptLedger, elapsed: Duration) -> usize {
        let count = ledger.server_count();
        if let Some(untried) = (0..count).find(|&s| !ledger.tried(s)) {
            return untried;
        }

        let last = ledger.attempts().last().map_or(0, |a| a.server);
        let rotation = (1..count).map(|step| (last + step) % count);

        rotation
            .clone()
            .find(|&s| !ledger.busy(s, elapsed))
            .or_else(|| rotation.clone().next())
            .unwrap_or(last)
    }
}
