//! Label Service
//!
//! Image label ingestion and retrieval for uploaded objects. The service
//! consumes object-created notifications from Kafka, has each uploaded image
//! analyzed by Rekognition, stores the resulting labels in PostgreSQL keyed by
//! object key, and serves them back over HTTP.
//!
//! ## Architecture
//!
//! ```text
//! Kafka Topic                 Rekognition
//! ┌──────────────┐           ┌──────────────┐
//! │ Upload       │           │ DetectLabels │
//! │ Notifications│           └──────────────┘
//! └──────────────┘                  ▲
//!        │                          │
//!        ▼                          │
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ Ingestion    │──────────▶│ Analysis     │          │ PostgreSQL   │
//! │ Handler      │           │ Client       │          │ label_results│
//! └──────────────┘           └──────────────┘          └──────────────┘
//!        │                                                    ▲   │
//!        │ retry-pending events                               │   │
//!        ▼                                           put      │   │ get
//! ┌──────────────┐                                            │   ▼
//! │ Retry Topic  │           ┌──────────────┐          ┌──────────────┐
//! └──────────────┘           │ GET /results │◀─────────│ Retrieval    │
//!                            │   ?key=...   │          │ Handler      │
//!                            └──────────────┘          └──────────────┘
//! ```
//!
//! Each notification record is processed on its own. Terminal failures are
//! dropped, transient ones are republished for redelivery with a growing delay
//! and a cap on attempts; the handlers never retry internally.

pub mod analysis;
pub mod config;
pub mod ingestion;
pub mod kafka_consumer;
pub mod notification;
pub mod record;
pub mod redelivery;
pub mod result_store;
pub mod retrieval;

pub use analysis::{AnalysisClient, AnalysisError, RekognitionAnalysisClient};
pub use config::Config;
pub use ingestion::{BatchReport, EventFailure, EventOutcome, IngestionError, IngestionHandler};
pub use kafka_consumer::UploadKafkaConsumer;
pub use notification::{NotificationRecord, ObjectRef, ParseError, UploadNotification};
pub use record::{LabelScore, ResultRecord};
pub use redelivery::{RedeliveryPolicy, RedeliveryStamp};
pub use result_store::{MemoryResultStore, PgResultStore, ResultStore, StoreError};
pub use retrieval::{AppState, RetrievalHandler, RetrievalResponse};
