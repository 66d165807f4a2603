//! SQLite-backed queue store.
//!
//! Timestamps are stored as RFC 3339 text so the lexicographic comparisons
//! in SQL match chronological order. Bodies live in their own table keyed by
//! content digest; entry rows reference them by `body_ref`, so a message to
//! many recipients stores its body once.

use crate::error::{Result, SmtpError};
use crate::queue::{
    DeliveryOutcome, NewQueueMessage, QueueEntry, QueueStatus, QueueStore, RetryPolicy,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, info, warn};

type EntryRow = (
    i64,            // id
    String,         // message_id
    String,         // reverse_path
    String,         // forward_path
    String,         // body_ref
    Option<i64>,    // declared_size
    i64,            // priority
    i64,            // attempts
    i64,            // max_attempts
    Option<String>, // next_attempt_at
    Option<String>, // last_error
    String,         // status
    String,         // created_at
);

const ENTRY_COLUMNS: &str = "id, message_id, reverse_path, forward_path, body_ref, \
     declared_size, priority, attempts, max_attempts, next_attempt_at, last_error, \
     status, created_at";

pub struct SqliteQueueStore {
    db: SqlitePool,
    retry: RetryPolicy,
}

impl SqliteQueueStore {
    pub async fn connect(database_url: &str, retry: RetryPolicy) -> Result<Self> {
        // An in-memory database exists per connection; cap the pool at one
        // connection so every query sees the bootstrapped schema.
        let pool_size = if database_url.contains(":memory:") { 1 } else { 5 };
        let db = SqlitePoolOptions::new()
            .max_connections(pool_size)
            .connect(database_url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_bodies (
                body_ref TEXT PRIMARY KEY,
                content BLOB NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&db)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL,
                reverse_path TEXT NOT NULL,
                forward_path TEXT NOT NULL,
                body_ref TEXT NOT NULL REFERENCES queue_bodies(body_ref),
                declared_size INTEGER,
                priority INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                next_attempt_at TEXT,
                last_error TEXT,
                status TEXT NOT NULL,
                lease_until TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&db)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queue_due \
             ON queue_entries (status, next_attempt_at, priority)",
        )
        .execute(&db)
        .await?;

        Ok(Self { db, retry })
    }

    fn entry_from_row(row: EntryRow) -> Result<QueueEntry> {
        let (
            id,
            message_id,
            reverse_path,
            forward_path,
            body_ref,
            declared_size,
            priority,
            attempts,
            max_attempts,
            next_attempt_at,
            last_error,
            status,
            created_at,
        ) = row;

        let status = QueueStatus::parse(&status)
            .ok_or_else(|| SmtpError::QueueTemp(format!("unknown queue status: {status}")))?;

        Ok(QueueEntry {
            id,
            message_id,
            reverse_path,
            forward_path,
            body_ref,
            declared_size,
            priority,
            attempts,
            max_attempts,
            next_attempt_at: next_attempt_at.map(|s| parse_ts(&s)).transpose()?,
            last_error,
            status,
            created_at: parse_ts(&created_at)?,
        })
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SmtpError::QueueTemp(format!("bad timestamp in store: {e}")))
}

#[async_trait::async_trait]
impl QueueStore for SqliteQueueStore {
    async fn enqueue(&self, message: NewQueueMessage) -> Result<Vec<i64>> {
        if message.forward_paths.is_empty() {
            return Err(SmtpError::QueuePerm("envelope without recipients".to_string()));
        }

        let now = Utc::now().to_rfc3339();
        let mut tx = self.db.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO queue_bodies (body_ref, content, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(body_ref) DO NOTHING
            "#,
        )
        .bind(&message.body_ref)
        .bind(&message.body)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let mut ids = Vec::with_capacity(message.forward_paths.len());
        for forward_path in &message.forward_paths {
            let result = sqlx::query(
                r#"
                INSERT INTO queue_entries (
                    message_id, reverse_path, forward_path, body_ref,
                    declared_size, priority, attempts, max_attempts,
                    next_attempt_at, status, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, 'pending', ?)
                "#,
            )
            .bind(&message.message_id)
            .bind(&message.reverse_path)
            .bind(forward_path)
            .bind(&message.body_ref)
            .bind(message.declared_size)
            .bind(message.priority)
            .bind(self.retry.max_attempts as i64)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
            ids.push(result.last_insert_rowid());
        }

        tx.commit().await?;
        info!(
            "enqueued message {} for {} recipient(s)",
            message.message_id,
            ids.len()
        );
        Ok(ids)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        batch_size: i64,
        lease: Duration,
    ) -> Result<Vec<QueueEntry>> {
        let now_text = now.to_rfc3339();
        let lease_until = (now + chrono::Duration::seconds(lease.as_secs() as i64)).to_rfc3339();

        let mut tx = self.db.begin().await?;

        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM queue_entries
            WHERE status IN ('pending', 'retry')
              AND next_attempt_at <= ?
              AND (lease_until IS NULL OR lease_until <= ?)
            ORDER BY priority ASC, next_attempt_at ASC, id ASC
            LIMIT ?
            "#
        ))
        .bind(&now_text)
        .bind(&now_text)
        .bind(batch_size)
        .fetch_all(&mut *tx)
        .await?;

        for (id, ..) in &rows {
            sqlx::query("UPDATE queue_entries SET lease_until = ? WHERE id = ?")
                .bind(&lease_until)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        rows.into_iter().map(Self::entry_from_row).collect()
    }

    async fn record_outcome(
        &self,
        id: i64,
        outcome: &DeliveryOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match outcome {
            DeliveryOutcome::Delivered => {
                sqlx::query(
                    r#"
                    UPDATE queue_entries
                    SET status = 'delivered',
                        attempts = attempts + 1,
                        next_attempt_at = NULL,
                        lease_until = NULL
                    WHERE id = ? AND status IN ('pending', 'retry')
                    "#,
                )
                .bind(id)
                .execute(&self.db)
                .await?;
                debug!("queue entry {} delivered", id);
            }
            DeliveryOutcome::PermFail(reason) => {
                sqlx::query(
                    r#"
                    UPDATE queue_entries
                    SET status = 'failed',
                        attempts = attempts + 1,
                        last_error = ?,
                        next_attempt_at = NULL,
                        lease_until = NULL
                    WHERE id = ? AND status IN ('pending', 'retry')
                    "#,
                )
                .bind(reason)
                .bind(id)
                .execute(&self.db)
                .await?;
                warn!("queue entry {} permanently failed: {}", id, reason);
            }
            DeliveryOutcome::TempFail(reason) => {
                let mut tx = self.db.begin().await?;

                let row = sqlx::query_as::<_, (i64, i64)>(
                    r#"
                    SELECT attempts, max_attempts FROM queue_entries
                    WHERE id = ? AND status IN ('pending', 'retry')
                    "#,
                )
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

                let Some((attempts, max_attempts)) = row else {
                    // Already terminal; nothing to record.
                    tx.rollback().await?;
                    return Ok(());
                };

                let new_attempts = attempts + 1;
                if new_attempts >= max_attempts {
                    sqlx::query(
                        r#"
                        UPDATE queue_entries
                        SET status = 'dead_letter',
                            attempts = ?,
                            last_error = ?,
                            next_attempt_at = NULL,
                            lease_until = NULL
                        WHERE id = ?
                        "#,
                    )
                    .bind(new_attempts)
                    .bind(reason)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                    warn!(
                        "queue entry {} dead-lettered after {} attempts: {}",
                        id, new_attempts, reason
                    );
                } else {
                    let delay = self.retry.backoff_with_jitter(attempts as u32);
                    let next = now + chrono::Duration::seconds(delay.as_secs() as i64);
                    sqlx::query(
                        r#"
                        UPDATE queue_entries
                        SET status = 'retry',
                            attempts = ?,
                            last_error = ?,
                            next_attempt_at = ?,
                            lease_until = NULL
                        WHERE id = ?
                        "#,
                    )
                    .bind(new_attempts)
                    .bind(reason)
                    .bind(next.to_rfc3339())
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                    debug!(
                        "queue entry {} retry {}/{} scheduled in {}s",
                        id,
                        new_attempts,
                        max_attempts,
                        delay.as_secs()
                    );
                }

                tx.commit().await?;
            }
        }
        Ok(())
    }

    async fn expire_leases(&self, now: DateTime<Utc>) -> Result<Vec<QueueEntry>> {
        let now_text = now.to_rfc3339();
        let mut tx = self.db.begin().await?;

        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM queue_entries
            WHERE lease_until IS NOT NULL
              AND lease_until <= ?
              AND status IN ('pending', 'retry')
            "#
        ))
        .bind(&now_text)
        .fetch_all(&mut *tx)
        .await?;

        for (id, ..) in &rows {
            sqlx::query("UPDATE queue_entries SET lease_until = NULL WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        if !rows.is_empty() {
            warn!("expired {} stale queue lease(s)", rows.len());
        }
        rows.into_iter().map(Self::entry_from_row).collect()
    }

    async fn release_leases(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql =
            format!("UPDATE queue_entries SET lease_until = NULL WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        query.execute(&self.db).await?;
        Ok(())
    }

    async fn fetch_body(&self, body_ref: &str) -> Result<Vec<u8>> {
        let row = sqlx::query_as::<_, (Vec<u8>,)>(
            "SELECT content FROM queue_bodies WHERE body_ref = ?",
        )
        .bind(body_ref)
        .fetch_optional(&self.db)
        .await?;

        row.map(|(content,)| content)
            .ok_or_else(|| SmtpError::QueueTemp(format!("missing body {body_ref}")))
    }

    async fn count_by_status(&self, status: QueueStatus) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM queue_entries WHERE status = ?")
                .bind(status.as_str())
                .fetch_one(&self.db)
                .await?;
        Ok(count.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            max_attempts: 3,
        }
    }

    async fn store() -> SqliteQueueStore {
        SqliteQueueStore::connect("sqlite::memory:", policy())
            .await
            .unwrap()
    }

    fn message(recipients: &[&str]) -> NewQueueMessage {
        NewQueueMessage {
            message_id: "msg-1".to_string(),
            reverse_path: "a@x.org".to_string(),
            forward_paths: recipients.iter().map(|s| s.to_string()).collect(),
            declared_size: None,
            priority: 0,
            body_ref: "ref-1".to_string(),
            body: b"Subject: hi\r\n\r\nbody".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_one_row_per_recipient() {
        let store = store().await;
        let ids = store
            .enqueue(message(&["b@y.org", "c@y.org", "b@y.org"]))
            .await
            .unwrap();
        assert_eq!(ids.len(), 3);

        let claimed = store
            .claim_due(Utc::now(), 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 3);
        assert!(claimed.iter().all(|e| e.message_id == "msg-1"));
        assert!(claimed.iter().all(|e| e.reverse_path == "a@x.org"));
        assert!(claimed.iter().all(|e| e.body_ref == "ref-1"));
        // Recipient order is acceptance order, duplicates preserved
        let recipients: Vec<&str> = claimed.iter().map(|e| e.forward_path.as_str()).collect();
        assert_eq!(recipients, vec!["b@y.org", "c@y.org", "b@y.org"]);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_empty_recipient_list() {
        let store = store().await;
        assert!(store.enqueue(message(&[])).await.is_err());
    }

    #[tokio::test]
    async fn test_body_readable_after_enqueue() {
        let store = store().await;
        store.enqueue(message(&["b@y.org"])).await.unwrap();
        let body = store.fetch_body("ref-1").await.unwrap();
        assert_eq!(body, b"Subject: hi\r\n\r\nbody");
    }

    #[tokio::test]
    async fn test_claimed_rows_not_reclaimed_while_leased() {
        let store = store().await;
        store.enqueue(message(&["b@y.org"])).await.unwrap();

        let first = store
            .claim_due(Utc::now(), 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let second = store
            .claim_due(Utc::now(), 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_expired_lease_becomes_eligible() {
        let store = store().await;
        store.enqueue(message(&["b@y.org"])).await.unwrap();

        let claimed = store
            .claim_due(Utc::now(), 10, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        let later = Utc::now() + chrono::Duration::seconds(5);
        let expired = store.expire_leases(later).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, claimed[0].id);

        let reclaimed = store
            .claim_due(later, 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_ordering_priority_then_due_time_then_id() {
        let store = store().await;
        let mut low = message(&["low@y.org"]);
        low.priority = 10;
        low.message_id = "low".to_string();
        let mut high = message(&["high@y.org"]);
        high.priority = 0;
        high.message_id = "high".to_string();

        store.enqueue(low).await.unwrap();
        store.enqueue(high).await.unwrap();

        let claimed = store
            .claim_due(Utc::now(), 10, Duration::from_secs(60))
            .await
            .unwrap();
        let order: Vec<&str> = claimed.iter().map(|e| e.message_id.as_str()).collect();
        assert_eq!(order, vec!["high", "low"]);
    }

    #[tokio::test]
    async fn test_delivered_is_idempotent() {
        let store = store().await;
        let ids = store.enqueue(message(&["b@y.org"])).await.unwrap();
        let id = ids[0];

        store
            .record_outcome(id, &DeliveryOutcome::Delivered, Utc::now())
            .await
            .unwrap();
        store
            .record_outcome(id, &DeliveryOutcome::Delivered, Utc::now())
            .await
            .unwrap();

        assert_eq!(store.count_by_status(QueueStatus::Delivered).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_status_never_regresses() {
        let store = store().await;
        let ids = store.enqueue(message(&["b@y.org"])).await.unwrap();
        let id = ids[0];

        store
            .record_outcome(id, &DeliveryOutcome::Delivered, Utc::now())
            .await
            .unwrap();
        // A late temp-fail report must not resurrect the row
        store
            .record_outcome(id, &DeliveryOutcome::TempFail("late".into()), Utc::now())
            .await
            .unwrap();

        assert_eq!(store.count_by_status(QueueStatus::Delivered).await.unwrap(), 1);
        assert_eq!(store.count_by_status(QueueStatus::Retry).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tempfail_schedules_retry_then_dead_letters() {
        let store = store().await;
        let ids = store.enqueue(message(&["b@y.org"])).await.unwrap();
        let id = ids[0];
        let now = Utc::now();

        store
            .record_outcome(id, &DeliveryOutcome::TempFail("450 busy".into()), now)
            .await
            .unwrap();
        assert_eq!(store.count_by_status(QueueStatus::Retry).await.unwrap(), 1);

        // Not yet eligible: the backoff pushed next_attempt_at into the future
        let claimed = store.claim_due(now, 10, Duration::from_secs(60)).await.unwrap();
        assert!(claimed.is_empty());

        // Eligible once the backoff has passed (60s base, +20% jitter ceiling)
        let later = now + chrono::Duration::seconds(100);
        let claimed = store.claim_due(later, 10, Duration::from_secs(60)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempts, 1);
        assert_eq!(claimed[0].last_error.as_deref(), Some("450 busy"));

        store
            .record_outcome(id, &DeliveryOutcome::TempFail("450 busy".into()), later)
            .await
            .unwrap();
        store
            .record_outcome(id, &DeliveryOutcome::TempFail("450 busy".into()), later)
            .await
            .unwrap();

        // max_attempts = 3 reached
        assert_eq!(store.count_by_status(QueueStatus::DeadLetter).await.unwrap(), 1);
        let remaining = store
            .claim_due(later + chrono::Duration::days(365), 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn test_permfail_is_terminal_regardless_of_attempts() {
        let store = store().await;
        let ids = store.enqueue(message(&["b@y.org"])).await.unwrap();

        store
            .record_outcome(ids[0], &DeliveryOutcome::PermFail("550 no such user".into()), Utc::now())
            .await
            .unwrap();

        assert_eq!(store.count_by_status(QueueStatus::Failed).await.unwrap(), 1);
        assert_eq!(store.count_by_status(QueueStatus::Pending).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_release_leases_makes_rows_eligible_immediately() {
        let store = store().await;
        store.enqueue(message(&["b@y.org"])).await.unwrap();

        let claimed = store
            .claim_due(Utc::now(), 10, Duration::from_secs(600))
            .await
            .unwrap();
        let ids: Vec<i64> = claimed.iter().map(|e| e.id).collect();

        store.release_leases(&ids).await.unwrap();

        let reclaimed = store
            .claim_due(Utc::now(), 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
    }
}
