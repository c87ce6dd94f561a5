//! The consumer loop: pull, ingest, acknowledge.
//!
//! Deliveries are processed strictly one at a time; each is fully
//! acknowledged before the next is pulled. The loop ends when the
//! subscription does, and signals completion exactly once so the shutdown
//! coordinator can bound its wait.
//!
//! Failure policy, per delivery:
//!
//! - success: acknowledge without requeue
//! - validation failure: dead-letter and acknowledge (never retried)
//! - persistence failure: requeue while under the retry cap, then
//!   dead-letter
//! - acknowledge failure: logged and contained; a single failed ack is
//!   never fatal to the service

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::dlq::DeadLetterSink;
use crate::queue::{Delivery, Subscription};
use crate::usecase::{IngestError, IngestLogUseCase};

/// Persistence-failure retries before a payload is dead-lettered.
pub const MAX_RETRIES: u32 = 3;

/// Drives a subscription, ingesting each delivery sequentially.
pub struct ConsumerLoop {
    ingest: IngestLogUseCase,
    dlq: Arc<dyn DeadLetterSink>,
    max_retries: u32,
}

impl ConsumerLoop {
    pub fn new(ingest: IngestLogUseCase, dlq: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            ingest,
            dlq,
            max_retries: MAX_RETRIES,
        }
    }

    /// Override the retry cap.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Run until the subscription ends, then fire the completion signal.
    pub async fn run(self, mut subscription: Subscription, done: oneshot::Sender<()>) {
        let mut processed: u64 = 0;
        let mut failed: u64 = 0;

        while let Some(delivery) = subscription.next().await {
            if self.handle(delivery).await {
                processed += 1;
            } else {
                failed += 1;
            }
        }

        info!(
            processed = processed,
            failed = failed,
            "Subscription ended, consumer loop finished"
        );
        let _ = done.send(());
    }

    /// Process one delivery. Returns whether ingestion succeeded.
    async fn handle(&self, delivery: Delivery) -> bool {
        let retry_count = delivery.retry_count();
        let result = self.ingest.execute(delivery.payload()).await;

        match result {
            Ok(record) => {
                debug!(level = %record.level, "Log record ingested");
                if let Err(e) = delivery.ack(false).await {
                    // The record is persisted; a failed ack means a possible
                    // redelivery, not a reason to crash.
                    error!(error = %e, "Failed to acknowledge delivery");
                }
                true
            }
            Err(IngestError::Validation(reason)) => {
                warn!(reason = %reason, "Dropping malformed payload");
                self.dead_letter(delivery, &reason, retry_count).await;
                false
            }
            Err(IngestError::Persistence(cause)) => {
                if retry_count >= self.max_retries {
                    warn!(
                        error = %cause,
                        retry_count = retry_count,
                        "Retries exhausted, dead-lettering payload"
                    );
                    self.dead_letter(delivery, &cause.to_string(), retry_count)
                        .await;
                } else {
                    warn!(
                        error = %cause,
                        retry_count = retry_count,
                        "Store unavailable, requeueing delivery"
                    );
                    if let Err(e) = delivery.ack(true).await {
                        error!(error = %e, "Failed to requeue delivery");
                    }
                }
                false
            }
        }
    }

    /// Push the payload to the DLQ, then acknowledge-and-drop the delivery.
    async fn dead_letter(&self, delivery: Delivery, reason: &str, retry_count: u32) {
        let payload = delivery.payload().to_vec();
        if let Err(e) = self.dlq.push(&payload, reason, retry_count).await {
            error!(error = %e, "Failed to dead-letter payload");
        }
        if let Err(e) = delivery.ack(false).await {
            error!(error = %e, "Failed to acknowledge delivery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::DlqError;
    use crate::queue::{Acknowledger, QueueError};
    use crate::store::testing::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct RecordingAcker {
        acks: Arc<Mutex<Vec<bool>>>,
        fail: bool,
    }

    #[async_trait]
    impl Acknowledger for RecordingAcker {
        async fn ack(self: Box<Self>, requeue: bool) -> Result<(), QueueError> {
            self.acks.lock().unwrap().push(requeue);
            if self.fail {
                return Err(QueueError::Command("injected ack failure".to_string()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        entries: Mutex<Vec<(Vec<u8>, String, u32)>>,
    }

    impl RecordingSink {
        fn entries(&self) -> Vec<(Vec<u8>, String, u32)> {
            self.entries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeadLetterSink for RecordingSink {
        async fn push(
            &self,
            payload: &[u8],
            error: &str,
            retry_count: u32,
        ) -> Result<(), DlqError> {
            self.entries
                .lock()
                .unwrap()
                .push((payload.to_vec(), error.to_string(), retry_count));
            Ok(())
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        dlq: Arc<RecordingSink>,
        acks: Arc<Mutex<Vec<bool>>>,
        tx: mpsc::Sender<Delivery>,
        loop_handle: tokio::task::JoinHandle<()>,
        done: oneshot::Receiver<()>,
    }

    fn start_loop() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let dlq = Arc::new(RecordingSink::default());
        let acks = Arc::new(Mutex::new(Vec::new()));

        let consumer = ConsumerLoop::new(IngestLogUseCase::new(store.clone()), dlq.clone());
        let (tx, rx) = mpsc::channel(8);
        let (done_tx, done_rx) = oneshot::channel();
        let loop_handle = tokio::spawn(consumer.run(Subscription::new(rx), done_tx));

        Harness {
            store,
            dlq,
            acks,
            tx,
            loop_handle,
            done: done_rx,
        }
    }

    impl Harness {
        fn delivery(&self, payload: &[u8], retry_count: u32) -> Delivery {
            Delivery::new(
                payload.to_vec(),
                retry_count,
                Box::new(RecordingAcker {
                    acks: self.acks.clone(),
                    fail: false,
                }),
            )
        }

        async fn finish(self) -> Vec<bool> {
            drop(self.tx);
            tokio::time::timeout(Duration::from_secs(1), self.loop_handle)
                .await
                .expect("consumer loop should finish")
                .unwrap();
            let acks = self.acks.lock().unwrap().clone();
            acks
        }
    }

    #[tokio::test]
    async fn test_valid_delivery_is_acked_without_requeue() {
        let harness = start_loop();
        let delivery = harness.delivery(br#"{"level":"info","message":"hello"}"#, 0);
        harness.tx.send(delivery).await.unwrap();

        let store = harness.store.clone();
        let acks = harness.finish().await;

        assert_eq!(acks, vec![false]);
        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "hello");
    }

    #[tokio::test]
    async fn test_validation_failure_is_dead_lettered_and_acked() {
        let harness = start_loop();
        let delivery = harness.delivery(br#"{"level":"info","message":""}"#, 0);
        harness.tx.send(delivery).await.unwrap();

        let store = harness.store.clone();
        let dlq = harness.dlq.clone();
        let acks = harness.finish().await;

        // Acked-and-dropped, never requeued
        assert_eq!(acks, vec![false]);
        assert!(store.records().is_empty());

        let entries = dlq.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].1.contains("message must not be empty"));
    }

    #[tokio::test]
    async fn test_persistence_failure_is_requeued_under_cap() {
        let harness = start_loop();
        harness.store.set_failing(true);

        let delivery = harness.delivery(br#"{"level":"info","message":"hello"}"#, 0);
        harness.tx.send(delivery).await.unwrap();

        let dlq = harness.dlq.clone();
        let acks = harness.finish().await;

        assert_eq!(acks, vec![true]);
        assert!(dlq.entries().is_empty());
    }

    #[tokio::test]
    async fn test_persistence_failure_past_cap_is_dead_lettered() {
        let harness = start_loop();
        harness.store.set_failing(true);

        let delivery = harness.delivery(br#"{"level":"info","message":"hello"}"#, MAX_RETRIES);
        harness.tx.send(delivery).await.unwrap();

        let dlq = harness.dlq.clone();
        let acks = harness.finish().await;

        assert_eq!(acks, vec![false]);
        assert_eq!(dlq.entries().len(), 1);
        assert_eq!(dlq.entries()[0].2, MAX_RETRIES);
    }

    #[tokio::test]
    async fn test_ack_failure_is_contained() {
        let harness = start_loop();

        let failing = Delivery::new(
            br#"{"level":"info","message":"first"}"#.to_vec(),
            0,
            Box::new(RecordingAcker {
                acks: harness.acks.clone(),
                fail: true,
            }),
        );
        harness.tx.send(failing).await.unwrap();

        // The loop must survive the failed ack and keep processing
        let delivery = harness.delivery(br#"{"level":"info","message":"second"}"#, 0);
        harness.tx.send(delivery).await.unwrap();

        let store = harness.store.clone();
        let acks = harness.finish().await;

        assert_eq!(acks, vec![false, false]);
        let messages: Vec<String> = store.records().into_iter().map(|r| r.message).collect();
        assert!(messages.contains(&"first".to_string()));
        assert!(messages.contains(&"second".to_string()));
    }

    #[tokio::test]
    async fn test_completion_signal_fires_when_subscription_ends() {
        let harness = start_loop();
        drop(harness.tx);

        tokio::time::timeout(Duration::from_secs(1), harness.done)
            .await
            .expect("completion signal should arrive promptly")
            .expect("completion signal should be sent, not dropped");
    }
}
