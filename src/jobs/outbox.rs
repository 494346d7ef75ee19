//! Outbox publisher: relay unpublished events to the bus.
//!
//! Delivery is at-least-once. Each event is sent first and marked published
//! afterwards; a crash (or a mark that keeps failing) between the two means
//! the event is sent again on a later tick, so bus consumers must be
//! idempotent on the event `id`. A send failure counts an attempt on the row
//! and leaves it pending. A row whose payload cannot be decoded is parked
//! by the store and counted, and the rest of the batch still goes out.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use selfheal_common::OutboxEvent;
use serde::Serialize;

use crate::clients::EventBus;
use crate::config::{JOB_OUTBOX_PUBLISHER, OutboxConfig};
use crate::errors::PipelineError;
use crate::scheduler::Job;
use crate::store::DbHandle;

const MARK_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Default, Clone, Serialize)]
pub struct PublishReport {
    pub fetched: usize,
    pub published: usize,
    /// Marked by someone else between our send and our mark.
    pub already_published: usize,
    pub failed: usize,
    /// Undecodable rows set aside this run.
    pub parked: usize,
}

impl fmt::Display for PublishReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetched {}: {} published, {} already published, {} failed, {} parked",
            self.fetched, self.published, self.already_published, self.failed, self.parked
        )
    }
}

pub struct OutboxPublisher {
    db: DbHandle,
    bus: Arc<dyn EventBus>,
    settings: OutboxConfig,
    store_timeout: Duration,
}

impl OutboxPublisher {
    pub fn new(db: DbHandle, bus: Arc<dyn EventBus>, settings: OutboxConfig, store_timeout: Duration) -> Self {
        Self {
            db,
            bus,
            settings,
            store_timeout,
        }
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<PublishReport, PipelineError> {
        let limit = self.settings.batch_size;
        let batch = self
            .db
            .call_with_timeout("fetch_unpublished", self.store_timeout, move |db| {
                db.fetch_unpublished(limit)
            })
            .await?;

        let mut report = PublishReport {
            fetched: batch.rows.len(),
            parked: batch.skipped,
            ..Default::default()
        };
        for event in batch.rows {
            let topic = event.topic();
            match self.bus.publish(&topic, &event.event_type, &event.payload).await {
                Ok(()) => {
                    if self.mark(&event, now).await? {
                        tracing::debug!(event_id = %event.id, topic = %topic, "event published");
                        report.published += 1;
                    } else {
                        report.already_published += 1;
                    }
                }
                Err(e) => {
                    let error = format!("{:#}", e);
                    tracing::warn!(event_id = %event.id, topic = %topic, error = %error, "publish failed, will retry");
                    self.record_failure(&event, error).await?;
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Flip `published` with a few retries on store errors. `false` when the
    /// row was already published, which is benign.
    async fn mark(&self, event: &OutboxEvent, now: DateTime<Utc>) -> Result<bool, PipelineError> {
        let attempts = self.settings.mark_retries.max(1);
        let mut attempt = 1;
        loop {
            let id = event.id.clone();
            let marked = self
                .db
                .call_with_timeout("mark_published", self.store_timeout, move |db| {
                    db.mark_published(&id, now)
                })
                .await;
            match marked {
                Ok(changed) => return Ok(changed),
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!(event_id = %event.id, attempt, error = %e, "mark failed, retrying");
                    tokio::time::sleep(MARK_BACKOFF * attempt).await;
                    attempt += 1;
                }
                // Sent but unmarked: the next tick redelivers it.
                Err(e) => return Err(e),
            }
        }
    }

    async fn record_failure(&self, event: &OutboxEvent, error: String) -> Result<(), PipelineError> {
        let id = event.id.clone();
        self.db
            .call_with_timeout("record_publish_failure", self.store_timeout, move |db| {
                db.record_publish_failure(&id, &error)
            })
            .await
    }
}

#[async_trait]
impl Job for OutboxPublisher {
    fn name(&self) -> &str {
        JOB_OUTBOX_PUBLISHER
    }

    async fn run(&self) -> anyhow::Result<String> {
        Ok(self.run_at(Utc::now()).await?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PipelineDb;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, h, m, 0).unwrap()
    }

    #[derive(Default)]
    struct RecordingBus {
        sent: Mutex<Vec<(String, String)>>,
        down: AtomicBool,
    }

    #[async_trait]
    impl EventBus for RecordingBus {
        async fn publish(&self, topic: &str, event_type: &str, _payload: &serde_json::Value) -> anyhow::Result<()> {
            if self.down.load(Ordering::SeqCst) {
                anyhow::bail!("broker unreachable");
            }
            self.sent.lock().unwrap().push((topic.to_string(), event_type.to_string()));
            Ok(())
        }
    }

    fn setup(bus: Arc<RecordingBus>) -> (DbHandle, OutboxPublisher) {
        let db = DbHandle::new(PipelineDb::new_in_memory().unwrap());
        let publisher = OutboxPublisher::new(db.clone(), bus, OutboxConfig::default(), Duration::from_secs(5));
        (db, publisher)
    }

    fn enqueue(db: &DbHandle, event_type: &str, at: DateTime<Utc>) -> String {
        db.lock_sync()
            .unwrap()
            .enqueue_event("bug", "1", event_type, &serde_json::json!({"bug_id": 1}), at)
            .unwrap()
    }

    #[tokio::test]
    async fn test_publishes_in_fifo_order_and_marks() {
        let bus = Arc::new(RecordingBus::default());
        let (db, publisher) = setup(bus.clone());
        enqueue(&db, "bug.analyzed", t(10, 0));
        enqueue(&db, "bug.fixed", t(10, 1));

        let report = publisher.run_at(t(10, 2)).await.unwrap();
        assert_eq!(report.published, 2);
        assert_eq!(
            *bus.sent.lock().unwrap(),
            vec![
                ("bug.events".to_string(), "bug.analyzed".to_string()),
                ("bug.events".to_string(), "bug.fixed".to_string()),
            ]
        );
        let pending = db.lock_sync().unwrap().list_outbox_events(Some(false), 10).unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_second_run_with_no_new_events_sends_nothing() {
        let bus = Arc::new(RecordingBus::default());
        let (db, publisher) = setup(bus.clone());
        enqueue(&db, "bug.fixed", t(10, 0));

        publisher.run_at(t(10, 1)).await.unwrap();
        let again = publisher.run_at(t(10, 1)).await.unwrap();
        assert_eq!(again.fetched, 0);
        assert_eq!(bus.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_send_failure_leaves_event_pending() {
        let bus = Arc::new(RecordingBus::default());
        bus.down.store(true, Ordering::SeqCst);
        let (db, publisher) = setup(bus.clone());
        let id = enqueue(&db, "bug.fixed", t(10, 0));

        let report = publisher.run_at(t(10, 1)).await.unwrap();
        assert_eq!(report.failed, 1);
        let event = db.lock_sync().unwrap().get_outbox_event(&id).unwrap().unwrap();
        assert!(!event.published);
        assert_eq!(event.attempts, 1);
        assert!(event.last_error.unwrap().contains("broker unreachable"));

        bus.down.store(false, Ordering::SeqCst);
        assert_eq!(publisher.run_at(t(10, 2)).await.unwrap().published, 1);
        let event = db.lock_sync().unwrap().get_outbox_event(&id).unwrap().unwrap();
        assert!(event.published);
        assert!(event.published_at.is_some());
    }

    #[tokio::test]
    async fn test_malformed_event_does_not_block_later_ones() {
        let bus = Arc::new(RecordingBus::default());
        let (db, publisher) = setup(bus.clone());
        db.lock_sync().unwrap().insert_raw_event("bad", "not json", t(9, 59)).unwrap();
        let good = enqueue(&db, "bug.fixed", t(10, 0));

        let report = publisher.run_at(t(10, 1)).await.unwrap();
        assert_eq!((report.published, report.parked), (1, 1));
        assert!(db.lock_sync().unwrap().get_outbox_event(&good).unwrap().unwrap().published);

        let again = publisher.run_at(t(10, 2)).await.unwrap();
        assert_eq!((again.fetched, again.parked), (0, 0));
        assert_eq!(*bus.sent.lock().unwrap(), vec![("bug.events".to_string(), "bug.fixed".to_string())]);
        let stats = db.lock_sync().unwrap().pipeline_stats().unwrap();
        assert_eq!((stats.unpublished_events, stats.parked_events), (0, 1));
    }

    #[tokio::test]
    async fn test_concurrent_mark_is_benign() {
        let bus = Arc::new(RecordingBus::default());
        let (db, publisher) = setup(bus.clone());
        let id = enqueue(&db, "bug.fixed", t(10, 0));
        let event = db.lock_sync().unwrap().get_outbox_event(&id).unwrap().unwrap();

        // another publisher marked it after we fetched
        assert!(db.lock_sync().unwrap().mark_published(&id, t(10, 1)).unwrap());
        assert!(!publisher.mark(&event, t(10, 1)).await.unwrap());

        let event = db.lock_sync().unwrap().get_outbox_event(&id).unwrap().unwrap();
        assert!(event.published, "published never reverts");
    }

    #[tokio::test]
    async fn test_racing_publishers_may_redeliver_but_never_unpublish() {
        let bus = Arc::new(RecordingBus::default());
        let (db, first) = setup(bus.clone());
        let second = OutboxPublisher::new(db.clone(), bus.clone(), OutboxConfig::default(), Duration::from_secs(5));
        for m in 0..5 {
            enqueue(&db, "bug.fixed", t(10, m));
        }

        let (a, b) = tokio::join!(first.run_at(t(10, 6)), second.run_at(t(10, 6)));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.published + b.published, 5, "each row is marked exactly once");
        assert!(bus.sent.lock().unwrap().len() >= 5);
        assert!(db.lock_sync().unwrap().list_outbox_events(Some(false), 10).unwrap().is_empty());
    }
}
