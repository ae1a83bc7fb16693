use crate::analysis::{AnalysisClient, AnalysisError};
use crate::config::IngestionConfig;
use crate::notification::{NotificationRecord, ObjectRef, ParseError, UploadNotification};
use crate::record::ResultRecord;
use crate::result_store::{ResultStore, StoreError};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

/// Why an event did not complete
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EventFailure {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Final state of one event in a batch
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    /// Record written
    Stored { object: ObjectRef, label_count: usize },
    /// Terminal failure, the event will not be retried
    Dropped {
        object: Option<ObjectRef>,
        failure: EventFailure,
    },
    /// Transient failure, the event should be redelivered
    PendingRetry {
        object: ObjectRef,
        failure: EventFailure,
    },
}

impl EventOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, EventOutcome::Stored { .. })
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self, EventOutcome::Dropped { .. })
    }

    pub fn is_pending_retry(&self) -> bool {
        matches!(self, EventOutcome::PendingRetry { .. })
    }
}

/// Outcomes of a batch, in the order the events arrived
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub outcomes: Vec<EventOutcome>,
}

impl BatchReport {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn stored(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_stored()).count()
    }

    pub fn dropped(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_dropped()).count()
    }

    pub fn pending_retry(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_pending_retry()).count()
    }

    /// A non-empty batch where nothing but transient failures happened
    pub fn is_fatal(&self) -> bool {
        !self.is_empty() && self.outcomes.iter().all(EventOutcome::is_pending_retry)
    }

    /// The records of `notification` that need redelivery, if any
    pub fn redelivery(&self, notification: &UploadNotification) -> Option<UploadNotification> {
        let records: Vec<NotificationRecord> = self
            .outcomes
            .iter()
            .zip(&notification.records)
            .filter(|(outcome, _)| outcome.is_pending_retry())
            .map(|(_, record)| record.clone())
            .collect();

        if records.is_empty() {
            None
        } else {
            Some(UploadNotification::new(records))
        }
    }
}

/// Batch-level failures of the ingestion handler
#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("all {} events in the batch failed with transient errors", .0.len())]
    BatchFailed(BatchReport),
}

impl IngestionError {
    pub fn report(&self) -> &BatchReport {
        match self {
            IngestionError::BatchFailed(report) => report,
        }
    }
}

/// Turns upload notifications into stored result records.
///
/// Each event is handled on its own: a failing event never stops the others.
/// Failures are only classified here; redelivery belongs to the transport.
pub struct IngestionHandler {
    analysis: Arc<dyn AnalysisClient>,
    store: Arc<dyn ResultStore>,
    config: IngestionConfig,
}

impl IngestionHandler {
    pub fn new(
        analysis: Arc<dyn AnalysisClient>,
        store: Arc<dyn ResultStore>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            analysis,
            store,
            config,
        }
    }

    /// Process every record of a notification and report per-event outcomes
    #[instrument(skip(self, notification), fields(events = notification.len()))]
    pub async fn handle_batch(
        &self,
        notification: &UploadNotification,
    ) -> Result<BatchReport, IngestionError> {
        let pending: Vec<_> = notification
            .records
            .iter()
            .map(|record| self.process_record(record))
            .collect();
        let outcomes: Vec<EventOutcome> = stream::iter(pending)
            .buffered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        let report = BatchReport { outcomes };

        info!(
            stored = report.stored(),
            dropped = report.dropped(),
            pending_retry = report.pending_retry(),
            "Batch processed"
        );

        if report.is_fatal() {
            metrics::counter!("labels.batches.failed").increment(1);
            return Err(IngestionError::BatchFailed(report));
        }

        Ok(report)
    }

    async fn process_record(&self, record: &NotificationRecord) -> EventOutcome {
        match record.parse() {
            Ok(object) => self.ingest_object(object).await,
            Err(e) => {
                warn!(error = %e, "Dropping malformed upload notification record");
                metrics::counter!("labels.events.dropped").increment(1);
                EventOutcome::Dropped {
                    object: None,
                    failure: e.into(),
                }
            }
        }
    }

    /// Analyze one object and store its labels
    #[instrument(skip(self, object), fields(bucket = %object.bucket, object_key = %object.object_key))]
    pub async fn ingest_object(&self, object: ObjectRef) -> EventOutcome {
        let analysis_timeout = self.config.analysis_timeout();
        let started = Instant::now();

        let analysis = timeout(
            analysis_timeout,
            self.analysis.analyze(&object.bucket, &object.object_key),
        )
        .await
        .unwrap_or_else(|_| {
            Err(AnalysisError::ServiceUnavailable(format!(
                "analysis timed out after {analysis_timeout:?}"
            )))
        });

        metrics::histogram!("labels.analysis.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        let labels = match analysis {
            Ok(labels) => labels,
            Err(e) => return analysis_failure(object, e),
        };

        debug!(label_count = labels.len(), "Object analyzed");

        let label_count = labels.len();
        let record = ResultRecord::new(object.bucket.clone(), object.object_key.clone(), labels);

        let store_timeout = self.config.store_timeout();
        let write = timeout(store_timeout, self.store.put(record))
            .await
            .unwrap_or_else(|_| {
                Err(StoreError::Unavailable(format!(
                    "store write timed out after {store_timeout:?}"
                )))
            });

        match write {
            Ok(()) => {
                info!(label_count, "Result record stored");
                metrics::counter!("labels.events.stored").increment(1);
                EventOutcome::Stored {
                    object,
                    label_count,
                }
            }
            Err(e @ StoreError::Unavailable(_)) => {
                warn!(error = %e, "Result store unavailable, event pending retry");
                metrics::counter!("labels.events.retry_pending").increment(1);
                EventOutcome::PendingRetry {
                    object,
                    failure: e.into(),
                }
            }
            Err(e @ StoreError::InvalidRecord(_)) => {
                error!(error = %e, "DEFECT: parsed event produced a record the store rejected");
                metrics::counter!("labels.events.dropped").increment(1);
                EventOutcome::Dropped {
                    object: Some(object),
                    failure: e.into(),
                }
            }
        }
    }
}

fn analysis_failure(object: ObjectRef, err: AnalysisError) -> EventOutcome {
    match err {
        AnalysisError::ServiceUnavailable(_) | AnalysisError::ServiceThrottled(_) => {
            warn!(error = %err, "Analysis failed transiently, event pending retry");
            metrics::counter!("labels.events.retry_pending").increment(1);
            EventOutcome::PendingRetry {
                object,
                failure: err.into(),
            }
        }
        AnalysisError::ObjectNotFound(_) => {
            info!(error = %err, "Object no longer exists, dropping event");
            metrics::counter!("labels.events.dropped").increment(1);
            EventOutcome::Dropped {
                object: Some(object),
                failure: err.into(),
            }
        }
        AnalysisError::UnsupportedFormat(_) | AnalysisError::PermissionDenied(_) => {
            error!(error = %err, "Object cannot be analyzed, dropping event");
            metrics::counter!("labels.events.dropped").increment(1);
            EventOutcome::Dropped {
                object: Some(object),
                failure: err.into(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::MockAnalysisClient;
    use crate::record::LabelScore;
    use crate::result_store::{MemoryResultStore, MockResultStore};
    use async_trait::async_trait;
    use std::time::Duration;

    fn config() -> IngestionConfig {
        IngestionConfig {
            analysis_timeout_secs: 15,
            store_timeout_secs: 10,
            max_concurrency: 4,
        }
    }

    fn person_labels() -> Vec<LabelScore> {
        vec![
            LabelScore::new("Person", 98.12),
            LabelScore::new("Portrait", 94.33),
        ]
    }

    fn batch(keys: &[&str]) -> UploadNotification {
        UploadNotification::new(
            keys.iter()
                .map(|key| NotificationRecord::object_created("uploads", *key))
                .collect(),
        )
    }

    fn object(key: &str) -> ObjectRef {
        ObjectRef {
            bucket: "uploads".to_string(),
            object_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_successful_event_is_stored() {
        let mut analysis = MockAnalysisClient::new();
        analysis
            .expect_analyze()
            .withf(|bucket, key| bucket == "uploads" && key == "sample.jpg")
            .times(1)
            .returning(|_, _| Ok(person_labels()));

        let store = Arc::new(MemoryResultStore::new());
        let handler = IngestionHandler::new(Arc::new(analysis), store.clone(), config());

        let report = handler.handle_batch(&batch(&["sample.jpg"])).await.unwrap();

        assert_eq!(report.stored(), 1);
        assert_eq!(
            store.get("sample.jpg").await.unwrap(),
            Some(ResultRecord::new("uploads", "sample.jpg", person_labels()))
        );
    }

    #[tokio::test]
    async fn test_empty_label_list_is_stored() {
        let mut analysis = MockAnalysisClient::new();
        analysis.expect_analyze().returning(|_, _| Ok(vec![]));

        let store = Arc::new(MemoryResultStore::new());
        let handler = IngestionHandler::new(Arc::new(analysis), store.clone(), config());

        let report = handler.handle_batch(&batch(&["blank.png"])).await.unwrap();

        assert_eq!(
            report.outcomes,
            vec![EventOutcome::Stored {
                object: object("blank.png"),
                label_count: 0
            }]
        );
        assert!(store.get("blank.png").await.unwrap().unwrap().labels.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_event_does_not_affect_valid_event() {
        let mut analysis = MockAnalysisClient::new();
        analysis
            .expect_analyze()
            .times(1)
            .returning(|_, _| Ok(person_labels()));

        let mut notification = batch(&["sample.jpg"]);
        notification.records.insert(0, NotificationRecord::default());

        let store = Arc::new(MemoryResultStore::new());
        let handler = IngestionHandler::new(Arc::new(analysis), store.clone(), config());

        let report = handler.handle_batch(&notification).await.unwrap();

        assert_eq!(
            report.outcomes[0],
            EventOutcome::Dropped {
                object: None,
                failure: EventFailure::Parse(ParseError::MissingBucket)
            }
        );
        assert!(report.outcomes[1].is_stored());
        assert!(store.get("sample.jpg").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_wrong_typed_record_is_dropped_and_sibling_is_stored() {
        let mut analysis = MockAnalysisClient::new();
        analysis
            .expect_analyze()
            .withf(|_, key| key == "sample.jpg")
            .times(1)
            .returning(|_, _| Ok(person_labels()));

        let payload = r#"{"Records":[
            {"eventName":"ObjectCreated:Put","s3":{"bucket":{"name":"uploads"},"object":{"key":12345}}},
            {"eventName":"ObjectCreated:Put","s3":{"bucket":{"name":"uploads"},"object":{"key":"sample.jpg"}}}
        ]}"#;
        let notification: UploadNotification = serde_json::from_str(payload).unwrap();

        let store = Arc::new(MemoryResultStore::new());
        let handler = IngestionHandler::new(Arc::new(analysis), store.clone(), config());

        let report = handler.handle_batch(&notification).await.unwrap();

        assert!(matches!(
            report.outcomes[0],
            EventOutcome::Dropped {
                object: None,
                failure: EventFailure::Parse(ParseError::Malformed(_))
            }
        ));
        assert!(report.outcomes[1].is_stored());
        assert!(store.get("sample.jpg").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_undecodable_key_is_dropped_without_analysis() {
        let mut analysis = MockAnalysisClient::new();
        analysis.expect_analyze().never();

        let handler = IngestionHandler::new(
            Arc::new(analysis),
            Arc::new(MemoryResultStore::new()),
            config(),
        );

        let report = handler.handle_batch(&batch(&["bad%zz.jpg"])).await.unwrap();
        assert_eq!(report.dropped(), 1);
    }

    #[tokio::test]
    async fn test_throttled_event_is_pending_retry_and_not_written() {
        let mut analysis = MockAnalysisClient::new();
        analysis.expect_analyze().returning(|_, key| {
            if key == "busy.jpg" {
                Err(AnalysisError::ServiceThrottled("rate exceeded".into()))
            } else {
                Ok(person_labels())
            }
        });

        let store = Arc::new(MemoryResultStore::new());
        let handler = IngestionHandler::new(Arc::new(analysis), store.clone(), config());

        let report = handler
            .handle_batch(&batch(&["busy.jpg", "sample.jpg"]))
            .await
            .unwrap();

        assert_eq!(
            report.outcomes[0],
            EventOutcome::PendingRetry {
                object: object("busy.jpg"),
                failure: EventFailure::Analysis(AnalysisError::ServiceThrottled(
                    "rate exceeded".into()
                ))
            }
        );
        assert_eq!(report.stored(), 1);
        assert_eq!(store.get("busy.jpg").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_terminal_analysis_failures_are_dropped() {
        let mut analysis = MockAnalysisClient::new();
        analysis.expect_analyze().returning(|_, key| match key {
            "gone.jpg" => Err(AnalysisError::ObjectNotFound(key.into())),
            "doc.pdf" => Err(AnalysisError::UnsupportedFormat(key.into())),
            _ => Err(AnalysisError::PermissionDenied(key.into())),
        });

        let store = Arc::new(MemoryResultStore::new());
        let handler = IngestionHandler::new(Arc::new(analysis), store.clone(), config());

        let report = handler
            .handle_batch(&batch(&["gone.jpg", "doc.pdf", "secret.jpg"]))
            .await
            .unwrap();

        assert_eq!(report.dropped(), 3);
        assert!(store.is_empty());
        assert!(report.redelivery(&batch(&["gone.jpg", "doc.pdf", "secret.jpg"])).is_none());
    }

    #[tokio::test]
    async fn test_store_unavailable_is_pending_retry() {
        let mut analysis = MockAnalysisClient::new();
        analysis.expect_analyze().returning(|_, _| Ok(person_labels()));

        let mut store = MockResultStore::new();
        store
            .expect_put()
            .returning(|_| Err(StoreError::Unavailable("connection refused".into())));

        let handler = IngestionHandler::new(Arc::new(analysis), Arc::new(store), config());

        let err = handler
            .handle_batch(&batch(&["sample.jpg"]))
            .await
            .unwrap_err();

        assert!(err.report().is_fatal());
        assert_eq!(err.report().pending_retry(), 1);
    }

    #[tokio::test]
    async fn test_store_rejection_is_dropped() {
        let mut analysis = MockAnalysisClient::new();
        analysis.expect_analyze().returning(|_, _| Ok(vec![]));

        let mut store = MockResultStore::new();
        store
            .expect_put()
            .returning(|_| Err(StoreError::InvalidRecord("empty key".into())));

        let handler = IngestionHandler::new(Arc::new(analysis), Arc::new(store), config());

        let report = handler.handle_batch(&batch(&["sample.jpg"])).await.unwrap();
        assert_eq!(report.dropped(), 1);
        assert!(!report.is_fatal());
    }

    #[tokio::test]
    async fn test_batch_fails_only_when_every_event_is_transient() {
        let mut analysis = MockAnalysisClient::new();
        analysis
            .expect_analyze()
            .returning(|_, _| Err(AnalysisError::ServiceUnavailable("down".into())));

        let handler = IngestionHandler::new(
            Arc::new(analysis),
            Arc::new(MemoryResultStore::new()),
            config(),
        );

        let notification = batch(&["a.jpg", "b.jpg"]);
        let err = handler.handle_batch(&notification).await.unwrap_err();
        let IngestionError::BatchFailed(report) = err;

        assert_eq!(report.pending_retry(), 2);
        assert_eq!(report.redelivery(&notification), Some(notification.clone()));

        // A malformed event in the same batch keeps it from being fatal
        let mut mixed = notification.clone();
        mixed.records.push(NotificationRecord::default());
        let report = handler.handle_batch(&mixed).await.unwrap();
        assert_eq!(report.pending_retry(), 2);
        assert_eq!(report.dropped(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_is_not_fatal() {
        let handler = IngestionHandler::new(
            Arc::new(MockAnalysisClient::new()),
            Arc::new(MemoryResultStore::new()),
            config(),
        );

        let report = handler
            .handle_batch(&UploadNotification::default())
            .await
            .unwrap();
        assert!(report.is_empty());
    }

    #[test]
    fn test_redelivery_keeps_only_pending_records() {
        let notification = batch(&["a.jpg", "b.jpg", "c.jpg"]);
        let report = BatchReport {
            outcomes: vec![
                EventOutcome::Stored {
                    object: object("a.jpg"),
                    label_count: 1,
                },
                EventOutcome::PendingRetry {
                    object: object("b.jpg"),
                    failure: AnalysisError::ServiceThrottled("slow down".into()).into(),
                },
                EventOutcome::Dropped {
                    object: Some(object("c.jpg")),
                    failure: AnalysisError::ObjectNotFound("c.jpg".into()).into(),
                },
            ],
        };

        let redelivery = report.redelivery(&notification).unwrap();
        assert_eq!(redelivery, batch(&["b.jpg"]));
    }

    struct SlowAnalysis;

    #[async_trait]
    impl AnalysisClient for SlowAnalysis {
        async fn analyze(
            &self,
            _bucket: &str,
            _object_key: &str,
        ) -> Result<Vec<LabelScore>, AnalysisError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_analysis_timeout_is_pending_retry() {
        let store = Arc::new(MemoryResultStore::new());
        let handler = IngestionHandler::new(Arc::new(SlowAnalysis), store.clone(), config());

        let outcome = handler.ingest_object(object("slow.jpg")).await;

        assert!(matches!(
            outcome,
            EventOutcome::PendingRetry {
                failure: EventFailure::Analysis(AnalysisError::ServiceUnavailable(_)),
                ..
            }
        ));
        assert!(store.is_empty());
    }

    struct SlowStore;

    #[async_trait]
    impl ResultStore for SlowStore {
        async fn put(&self, _record: ResultRecord) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        async fn get(&self, _object_key: &str) -> Result<Option<ResultRecord>, StoreError> {
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_write_timeout_is_pending_retry() {
        let mut analysis = MockAnalysisClient::new();
        analysis.expect_analyze().returning(|_, _| Ok(person_labels()));

        let handler = IngestionHandler::new(Arc::new(analysis), Arc::new(SlowStore), config());

        let outcome = handler.ingest_object(object("sample.jpg")).await;

        assert!(matches!(
            outcome,
            EventOutcome::PendingRetry {
                failure: EventFailure::Store(StoreError::Unavailable(_)),
                ..
            }
        ));
    }
}
