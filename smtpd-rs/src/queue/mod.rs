//! Durable outbound queue and delivery capability seam.
//!
//! The store is the queue: accepted envelopes become per-recipient rows with
//! independent retry state, workers borrow rows under a lease and report an
//! outcome. How a message actually reaches the next hop (MX resolution,
//! client connections) is behind [`DeliveryService`] and out of scope here.

pub mod scheduler;
pub mod store;

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

pub use scheduler::RetryScheduler;
pub use store::SqliteQueueStore;

/// Queue entry lifecycle. Transitions are monotonic: `Pending`/`Retry`
/// alternate while delivery is outstanding, then exactly one of the terminal
/// states is reached and never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    Pending,
    Retry,
    Delivered,
    Failed,
    DeadLetter,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Retry => "retry",
            QueueStatus::Delivered => "delivered",
            QueueStatus::Failed => "failed",
            QueueStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "retry" => Some(QueueStatus::Retry),
            "delivered" => Some(QueueStatus::Delivered),
            "failed" => Some(QueueStatus::Failed),
            "dead_letter" => Some(QueueStatus::DeadLetter),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Delivered | QueueStatus::Failed | QueueStatus::DeadLetter
        )
    }
}

/// One recipient of one committed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub message_id: String,
    pub reverse_path: String,
    pub forward_path: String,
    pub body_ref: String,
    pub declared_size: Option<i64>,
    pub priority: i64,
    pub attempts: i64,
    pub max_attempts: i64,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
}

/// What the session hands to `enqueue` after a successful commit.
#[derive(Debug, Clone)]
pub struct NewQueueMessage {
    pub message_id: String,
    pub reverse_path: String,
    pub forward_paths: Vec<String>,
    pub declared_size: Option<i64>,
    pub priority: i64,
    pub body_ref: String,
    pub body: Vec<u8>,
}

/// Result of one delivery attempt. Hard bounces from the remote side map to
/// `PermFail` regardless of the attempt count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    TempFail(String),
    PermFail(String),
}

/// Exponential backoff parameters for temporary failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Delay before the next attempt, given how many attempts have already
    /// failed: `min(max_delay, base * 2^attempts)`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 2u64.checked_pow(attempts).unwrap_or(u64::MAX);
        let secs = self.base.as_secs().saturating_mul(factor);
        Duration::from_secs(secs.min(self.max_delay.as_secs()))
    }

    /// Backoff with +/-20% jitter so synchronized failures spread out.
    pub fn backoff_with_jitter(&self, attempts: u32) -> Duration {
        use rand::Rng;
        let base = self.backoff(attempts).as_secs_f64();
        let factor = rand::thread_rng().gen_range(0.8..=1.2);
        Duration::from_secs_f64(base * factor)
    }
}

/// Durable queue persistence. Every method commits before returning; callers
/// never hold locks across calls.
#[async_trait::async_trait]
pub trait QueueStore: Send + Sync {
    /// Persist one row per recipient plus the body, atomically. Returns the
    /// new row ids in recipient order.
    async fn enqueue(&self, message: NewQueueMessage) -> Result<Vec<i64>>;

    /// Claim up to `batch_size` eligible rows, sorted by
    /// `(priority, next_attempt_at, id)`, marking each with a lease that
    /// expires on its own if the claimant crashes.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        batch_size: i64,
        lease: Duration,
    ) -> Result<Vec<QueueEntry>>;

    /// Record a delivery outcome for a claimed row. Terminal rows are left
    /// untouched, which makes repeated `Delivered` reports idempotent.
    async fn record_outcome(
        &self,
        id: i64,
        outcome: &DeliveryOutcome,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Clear expired leases and return the rows that became eligible again.
    async fn expire_leases(&self, now: DateTime<Utc>) -> Result<Vec<QueueEntry>>;

    /// Eagerly clear leases on graceful shutdown so another process can pick
    /// the rows up without waiting for expiry.
    async fn release_leases(&self, ids: &[i64]) -> Result<()>;

    /// Fetch the message body for a claimed entry.
    async fn fetch_body(&self, body_ref: &str) -> Result<Vec<u8>>;

    /// Row count per status, for logs and tests.
    async fn count_by_status(&self, status: QueueStatus) -> Result<i64>;
}

/// Delivery capability: forwards one entry to its next hop. Implementations
/// must tolerate re-delivery of the same entry (the queue is at-least-once).
#[async_trait::async_trait]
pub trait DeliveryService: Send + Sync {
    async fn deliver(&self, entry: &QueueEntry, body: &[u8]) -> DeliveryOutcome;
}

/// Development sink: accepts everything and logs it. Deployments replace
/// this with a relay client.
pub struct LogDelivery;

#[async_trait::async_trait]
impl DeliveryService for LogDelivery {
    async fn deliver(&self, entry: &QueueEntry, body: &[u8]) -> DeliveryOutcome {
        info!(
            "delivery sink: message {} for {} ({} bytes)",
            entry.message_id,
            entry.forward_path,
            body.len()
        );
        DeliveryOutcome::Delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            base: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            max_attempts: 5,
        };
        let deltas: Vec<u64> = (0..5).map(|n| policy.backoff(n).as_secs()).collect();
        assert_eq!(deltas, vec![60, 120, 240, 480, 960]);
    }

    #[test]
    fn test_backoff_capped_at_max_delay() {
        let policy = RetryPolicy {
            base: Duration::from_secs(300),
            max_delay: Duration::from_secs(4 * 3600),
            max_attempts: 10,
        };
        assert_eq!(policy.backoff(20), Duration::from_secs(4 * 3600));
        // Overflow-sized exponents stay capped too
        assert_eq!(policy.backoff(200), Duration::from_secs(4 * 3600));
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let policy = RetryPolicy {
            base: Duration::from_secs(100),
            max_delay: Duration::from_secs(10_000),
            max_attempts: 5,
        };
        for _ in 0..100 {
            let d = policy.backoff_with_jitter(0).as_secs_f64();
            assert!((80.0..=120.0).contains(&d), "jittered delay out of band: {d}");
        }
    }

    #[test]
    fn test_status_text_roundtrip() {
        for status in [
            QueueStatus::Pending,
            QueueStatus::Retry,
            QueueStatus::Delivered,
            QueueStatus::Failed,
            QueueStatus::DeadLetter,
        ] {
            assert_eq!(QueueStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(QueueStatus::parse("bounced"), None);
    }
}
