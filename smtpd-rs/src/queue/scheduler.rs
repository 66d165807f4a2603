//! Retry scheduler: a pool of workers draining the queue store.
//!
//! Each worker iteration claims a batch under a lease, invokes the delivery
//! capability with a per-entry deadline and records the outcome. Workers
//! stop claiming when shutdown is signalled, get a grace window for
//! in-flight deliveries, and release any leases they still hold so another
//! process can take over immediately.

use crate::config::QueueConfig;
use crate::queue::{DeliveryOutcome, DeliveryService, QueueStore};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct RetryScheduler {
    store: Arc<dyn QueueStore>,
    delivery: Arc<dyn DeliveryService>,
    workers: usize,
    batch_size: i64,
    lease: Duration,
    poll_interval: Duration,
    delivery_timeout: Duration,
    drain_timeout: Duration,
    shutdown: CancellationToken,
}

impl RetryScheduler {
    pub fn new(
        store: Arc<dyn QueueStore>,
        delivery: Arc<dyn DeliveryService>,
        config: &QueueConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            delivery,
            workers: config.worker_count(),
            batch_size: config.batch_size,
            lease: config.lease(),
            poll_interval: config.poll_interval(),
            delivery_timeout: config.delivery_timeout(),
            drain_timeout: config.drain_timeout(),
            shutdown,
        }
    }

    /// Run workers plus the lease sweeper until shutdown, then drain.
    pub async fn run(self) {
        info!("starting retry scheduler with {} worker(s)", self.workers);

        let mut tasks = JoinSet::new();

        {
            let store = Arc::clone(&self.store);
            let shutdown = self.shutdown.clone();
            let interval = (self.lease / 2).max(Duration::from_secs(1));
            tasks.spawn(async move {
                lease_sweeper(store, interval, shutdown).await;
            });
        }

        for worker in 0..self.workers {
            let store = Arc::clone(&self.store);
            let delivery = Arc::clone(&self.delivery);
            let shutdown = self.shutdown.clone();
            let batch_size = self.batch_size;
            let lease = self.lease;
            let poll_interval = self.poll_interval;
            let delivery_timeout = self.delivery_timeout;
            tasks.spawn(async move {
                worker_loop(
                    worker,
                    store,
                    delivery,
                    batch_size,
                    lease,
                    poll_interval,
                    delivery_timeout,
                    shutdown,
                )
                .await;
            });
        }

        self.shutdown.cancelled().await;
        info!("retry scheduler draining (up to {:?})", self.drain_timeout);

        if timeout(self.drain_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("drain timeout reached, aborting remaining deliveries");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        info!("retry scheduler stopped");
    }
}

async fn lease_sweeper(
    store: Arc<dyn QueueStore>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(interval) => {}
        }
        match store.expire_leases(Utc::now()).await {
            Ok(expired) if !expired.is_empty() => {
                warn!("recovered {} entries from expired leases", expired.len());
            }
            Ok(_) => {}
            Err(e) => error!("lease sweep failed: {}", e),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker: usize,
    store: Arc<dyn QueueStore>,
    delivery: Arc<dyn DeliveryService>,
    batch_size: i64,
    lease: Duration,
    poll_interval: Duration,
    delivery_timeout: Duration,
    shutdown: CancellationToken,
) {
    debug!("queue worker {} started", worker);

    'claiming: while !shutdown.is_cancelled() {
        let batch = match store.claim_due(Utc::now(), batch_size, lease).await {
            Ok(batch) => batch,
            Err(e) => {
                error!("worker {}: claim failed: {}", worker, e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(poll_interval) => continue,
                }
            }
        };

        if batch.is_empty() {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(poll_interval) => continue,
            }
        }

        let mut unprocessed: Vec<i64> = batch.iter().map(|e| e.id).collect();
        for entry in batch {
            if shutdown.is_cancelled() {
                if let Err(e) = store.release_leases(&unprocessed).await {
                    error!("worker {}: failed to release leases: {}", worker, e);
                }
                break 'claiming;
            }
            unprocessed.retain(|&id| id != entry.id);

            let body = match store.fetch_body(&entry.body_ref).await {
                Ok(body) => body,
                Err(e) => {
                    error!(
                        "worker {}: body {} unavailable for entry {}: {}",
                        worker, entry.body_ref, entry.id, e
                    );
                    // Lease expiry will make the row eligible again
                    continue;
                }
            };

            let outcome = match timeout(delivery_timeout, delivery.deliver(&entry, &body)).await {
                Ok(outcome) => outcome,
                Err(_) => DeliveryOutcome::TempFail(format!(
                    "delivery timed out after {}s",
                    delivery_timeout.as_secs()
                )),
            };

            debug!(
                "worker {}: entry {} ({} -> {}) outcome {:?}",
                worker, entry.id, entry.reverse_path, entry.forward_path, outcome
            );

            if let Err(e) = store.record_outcome(entry.id, &outcome, Utc::now()).await {
                error!(
                    "worker {}: failed to record outcome for entry {}: {}",
                    worker, entry.id, e
                );
            }
        }
    }

    debug!("queue worker {} stopped", worker);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::store::SqliteQueueStore;
    use crate::queue::{NewQueueMessage, QueueEntry, QueueStatus, RetryPolicy};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted delivery capability: pops the next outcome per call,
    /// repeating the last one when the script runs dry.
    struct ScriptedDelivery {
        script: Vec<DeliveryOutcome>,
        calls: AtomicUsize,
    }

    impl ScriptedDelivery {
        fn new(script: Vec<DeliveryOutcome>) -> Self {
            Self {
                script,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl DeliveryService for ScriptedDelivery {
        async fn deliver(&self, _entry: &QueueEntry, _body: &[u8]) -> DeliveryOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .get(call)
                .or_else(|| self.script.last())
                .cloned()
                .unwrap_or(DeliveryOutcome::Delivered)
        }
    }

    fn test_config() -> QueueConfig {
        QueueConfig {
            database_url: "sqlite::memory:".to_string(),
            workers: 1,
            batch_size: 10,
            lease_s: 60,
            poll_s: 1,
            delivery_timeout_s: 5,
            drain_timeout_s: 2,
            retry_base_s: 0, // immediate retries keep the test fast
            retry_max_s: 0,
            max_attempts: 3,
        }
    }

    async fn store_with_message() -> Arc<SqliteQueueStore> {
        let store = SqliteQueueStore::connect(
            "sqlite::memory:",
            RetryPolicy {
                base: Duration::from_secs(0),
                max_delay: Duration::from_secs(0),
                max_attempts: 3,
            },
        )
        .await
        .unwrap();

        store
            .enqueue(NewQueueMessage {
                message_id: "msg-1".to_string(),
                reverse_path: "a@x.org".to_string(),
                forward_paths: vec!["b@y.org".to_string()],
                declared_size: None,
                priority: 0,
                body_ref: "ref-1".to_string(),
                body: b"body".to_vec(),
            })
            .await
            .unwrap();

        Arc::new(store)
    }

    async fn wait_for_status(store: &SqliteQueueStore, status: QueueStatus) {
        for _ in 0..200 {
            if store.count_by_status(status).await.unwrap() == 1 {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
        panic!("queue entry never reached {:?}", status);
    }

    #[tokio::test]
    async fn test_scheduler_delivers_after_temp_failures() {
        let store = store_with_message().await;
        let delivery = Arc::new(ScriptedDelivery::new(vec![
            DeliveryOutcome::TempFail("450 try later".into()),
            DeliveryOutcome::TempFail("450 try later".into()),
            DeliveryOutcome::Delivered,
        ]));

        let shutdown = CancellationToken::new();
        let scheduler = RetryScheduler::new(
            store.clone() as Arc<dyn QueueStore>,
            delivery.clone() as Arc<dyn DeliveryService>,
            &test_config(),
            shutdown.clone(),
        );
        let handle = tokio::spawn(scheduler.run());

        wait_for_status(&store, QueueStatus::Delivered).await;
        assert_eq!(delivery.calls.load(Ordering::SeqCst), 3);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_dead_letters_after_max_attempts() {
        let store = store_with_message().await;
        let delivery = Arc::new(ScriptedDelivery::new(vec![DeliveryOutcome::TempFail(
            "450 always busy".into(),
        )]));

        let shutdown = CancellationToken::new();
        let scheduler = RetryScheduler::new(
            store.clone() as Arc<dyn QueueStore>,
            delivery.clone() as Arc<dyn DeliveryService>,
            &test_config(),
            shutdown.clone(),
        );
        let handle = tokio::spawn(scheduler.run());

        wait_for_status(&store, QueueStatus::DeadLetter).await;
        assert_eq!(delivery.calls.load(Ordering::SeqCst), 3);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_hard_bounce_fails_immediately() {
        let store = store_with_message().await;
        let delivery = Arc::new(ScriptedDelivery::new(vec![DeliveryOutcome::PermFail(
            "550 no such user".into(),
        )]));

        let shutdown = CancellationToken::new();
        let scheduler = RetryScheduler::new(
            store.clone() as Arc<dyn QueueStore>,
            delivery.clone() as Arc<dyn DeliveryService>,
            &test_config(),
            shutdown.clone(),
        );
        let handle = tokio::spawn(scheduler.run());

        wait_for_status(&store, QueueStatus::Failed).await;
        assert_eq!(delivery.calls.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
