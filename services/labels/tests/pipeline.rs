//! End-to-end ingestion → retrieval through the public API of the crate.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use label_service::config::{ApiConfig, IngestionConfig};
use label_service::retrieval::create_router;
use label_service::{
    AnalysisClient, AnalysisError, AppState, IngestionHandler, LabelScore, MemoryResultStore,
    NotificationRecord, ResultStore, RetrievalHandler, UploadNotification,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

/// Analysis double answering from a per-key script
#[derive(Default)]
struct ScriptedAnalysis {
    answers: Mutex<HashMap<String, Result<Vec<LabelScore>, AnalysisError>>>,
}

impl ScriptedAnalysis {
    fn answer(&self, key: &str, result: Result<Vec<LabelScore>, AnalysisError>) {
        self.answers.lock().insert(key.to_string(), result);
    }
}

#[async_trait]
impl AnalysisClient for ScriptedAnalysis {
    async fn analyze(
        &self,
        _bucket: &str,
        object_key: &str,
    ) -> Result<Vec<LabelScore>, AnalysisError> {
        self.answers
            .lock()
            .get(object_key)
            .cloned()
            .unwrap_or_else(|| Err(AnalysisError::ObjectNotFound(object_key.to_string())))
    }
}

struct Harness {
    analysis: Arc<ScriptedAnalysis>,
    store: Arc<MemoryResultStore>,
    ingestion: IngestionHandler,
    router: Router,
}

impl Harness {
    fn new() -> Self {
        let analysis = Arc::new(ScriptedAnalysis::default());
        let store = Arc::new(MemoryResultStore::new());

        let ingestion = IngestionHandler::new(
            analysis.clone(),
            store.clone(),
            IngestionConfig::default(),
        );

        let state = AppState {
            retrieval: RetrievalHandler::new(store.clone(), Duration::from_secs(5)),
        };
        let router = create_router(state, &ApiConfig::default());

        Self {
            analysis,
            store,
            ingestion,
            router,
        }
    }

    async fn get(&self, uri: &str) -> (StatusCode, String) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }
}

fn notification(records: Vec<NotificationRecord>) -> UploadNotification {
    UploadNotification::new(records)
}

#[tokio::test]
async fn worked_example_round_trips_exact_body() {
    let harness = Harness::new();
    harness.analysis.answer(
        "sample.jpg",
        Ok(vec![
            LabelScore::new("Person", 98.12),
            LabelScore::new("Portrait", 94.33),
        ]),
    );

    let payload = r#"{"Records":[{"eventName":"ObjectCreated:Put","s3":{"bucket":{"name":"uploads"},"object":{"key":"sample.jpg"}}}]}"#;
    let batch: UploadNotification = serde_json::from_str(payload).unwrap();

    let report = harness.ingestion.handle_batch(&batch).await.unwrap();
    assert_eq!(report.stored(), 1);

    let (status, body) = harness.get("/results?key=sample.jpg").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        r#"{"objectKey":"sample.jpg","bucket":"uploads","labels":[{"Name":"Person","Confidence":98.12},{"Name":"Portrait","Confidence":94.33}]}"#
    );
}

#[tokio::test]
async fn never_ingested_key_is_not_found() {
    let harness = Harness::new();
    let (status, _) = harness.get("/results?key=unknown.jpg").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn missing_key_parameter_is_bad_request() {
    let harness = Harness::new();
    let (status, body) = harness.get("/results").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!body.is_empty());
}

#[tokio::test]
async fn reingestion_replaces_previous_labels() {
    let harness = Harness::new();
    let batch = notification(vec![NotificationRecord::object_created("uploads", "pet.png")]);

    harness.analysis.answer(
        "pet.png",
        Ok(vec![LabelScore::new("Cat", 91.0), LabelScore::new("Pet", 90.0)]),
    );
    harness.ingestion.handle_batch(&batch).await.unwrap();

    harness
        .analysis
        .answer("pet.png", Ok(vec![LabelScore::new("Dog", 88.5)]));
    harness.ingestion.handle_batch(&batch).await.unwrap();

    let record = harness.store.get("pet.png").await.unwrap().unwrap();
    assert_eq!(record.labels, vec![LabelScore::new("Dog", 88.5)]);

    let (status, body) = harness.get("/results?key=pet.png").await;
    assert_eq!(status, StatusCode::OK);
    assert!(!body.contains("Cat"));
}

#[tokio::test]
async fn malformed_event_is_dropped_and_valid_event_is_served() {
    let harness = Harness::new();
    harness
        .analysis
        .answer("team photo.jpg", Ok(vec![LabelScore::new("Group", 97.0)]));

    let mut missing_key = NotificationRecord::object_created("uploads", "ignored.jpg");
    missing_key.s3.as_mut().unwrap().object = None;

    let batch = notification(vec![
        missing_key,
        NotificationRecord::object_created("uploads", "team+photo.jpg"),
    ]);

    let report = harness.ingestion.handle_batch(&batch).await.unwrap();
    assert_eq!(report.dropped(), 1);
    assert_eq!(report.stored(), 1);

    let (status, body) = harness.get("/results?key=team%20photo.jpg").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains(r#""objectKey":"team photo.jpg""#));
}

#[tokio::test]
async fn throttled_event_is_pending_and_never_written() {
    let harness = Harness::new();
    harness.analysis.answer(
        "busy.jpg",
        Err(AnalysisError::ServiceThrottled("rate exceeded".to_string())),
    );
    harness
        .analysis
        .answer("ok.jpg", Ok(vec![LabelScore::new("Sky", 75.0)]));

    let batch = notification(vec![
        NotificationRecord::object_created("uploads", "busy.jpg"),
        NotificationRecord::object_created("uploads", "ok.jpg"),
    ]);

    let report = harness.ingestion.handle_batch(&batch).await.unwrap();
    assert_eq!(report.pending_retry(), 1);

    let redelivery = report.redelivery(&batch).unwrap();
    assert_eq!(redelivery.records[0].parse().unwrap().object_key, "busy.jpg");

    let (status, _) = harness.get("/results?key=busy.jpg").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
