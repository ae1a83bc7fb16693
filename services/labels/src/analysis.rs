use crate::config::AnalysisConfig;
use crate::record::LabelScore;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_rekognition::error::{DisplayErrorContext, SdkError as RekognitionSdkError};
use aws_sdk_rekognition::operation::detect_labels::DetectLabelsError;
use aws_sdk_rekognition::types::{Image, S3Object};
use aws_sdk_rekognition::Client as RekognitionClient;
use aws_sdk_s3::error::SdkError as S3SdkError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::Client as S3Client;
use std::cmp::Ordering;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Typed failures of the image analysis capability
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("analysis service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("analysis service throttled: {0}")]
    ServiceThrottled(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl AnalysisError {
    /// Whether redelivering the event later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AnalysisError::ServiceUnavailable(_) | AnalysisError::ServiceThrottled(_)
        )
    }
}

/// Turns a reference to a stored image into labels.
///
/// Implementations return labels with confidence at or above the configured
/// minimum, at most the configured count, in descending confidence order.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AnalysisClient: Send + Sync {
    async fn analyze(&self, bucket: &str, object_key: &str)
        -> Result<Vec<LabelScore>, AnalysisError>;
}

/// Analysis client backed by Rekognition `DetectLabels`
pub struct RekognitionAnalysisClient {
    rekognition: RekognitionClient,
    s3: S3Client,
    config: AnalysisConfig,
}

impl RekognitionAnalysisClient {
    /// Create a new client sharing one AWS configuration for both services
    pub async fn new(config: &AnalysisConfig) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut rekognition_builder = aws_sdk_rekognition::config::Builder::from(&aws_config);
        let mut s3_builder = aws_sdk_s3::config::Builder::from(&aws_config);

        // Configure custom endpoint for LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            rekognition_builder = rekognition_builder.endpoint_url(endpoint_url);
            s3_builder = s3_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_builder = s3_builder.force_path_style(true);
        }

        info!(
            region = %config.region,
            min_confidence = config.min_confidence,
            max_labels = config.max_labels,
            "Rekognition analysis client initialized"
        );

        Ok(Self {
            rekognition: RekognitionClient::from_conf(rekognition_builder.build()),
            s3: S3Client::from_conf(s3_builder.build()),
            config: config.clone(),
        })
    }

    /// Check that the object exists, is readable and looks like a supported image
    async fn verify_object_exists(
        &self,
        bucket: &str,
        object_key: &str,
    ) -> Result<(), AnalysisError> {
        let head = self
            .s3
            .head_object()
            .bucket(bucket)
            .key(object_key)
            .send()
            .await
            .map_err(|e| classify_head_object_error(&e))?;

        let content_type = head.content_type().unwrap_or_default();
        if !is_supported_image(content_type, object_key) {
            return Err(AnalysisError::UnsupportedFormat(format!(
                "content type {content_type:?} for {object_key}"
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl AnalysisClient for RekognitionAnalysisClient {
    #[instrument(skip(self))]
    async fn analyze(
        &self,
        bucket: &str,
        object_key: &str,
    ) -> Result<Vec<LabelScore>, AnalysisError> {
        if self.config.verify_object {
            self.verify_object_exists(bucket, object_key).await?;
        }

        let image = Image::builder()
            .s3_object(S3Object::builder().bucket(bucket).name(object_key).build())
            .build();

        let output = self
            .rekognition
            .detect_labels()
            .image(image)
            .max_labels(i32::try_from(self.config.max_labels).unwrap_or(i32::MAX))
            .min_confidence(self.config.min_confidence)
            .send()
            .await
            .map_err(|e| classify_detect_labels_error(&e))?;

        let labels = output
            .labels()
            .iter()
            .filter_map(|label| Some(LabelScore::new(label.name()?, label.confidence()?)))
            .collect();

        let labels = bound_labels(labels, self.config.min_confidence, self.config.max_labels);

        debug!(label_count = labels.len(), "Labels detected");

        Ok(labels)
    }
}

/// Apply the confidence floor, descending order and count limit
pub fn bound_labels(
    mut labels: Vec<LabelScore>,
    min_confidence: f32,
    max_labels: usize,
) -> Vec<LabelScore> {
    labels.retain(|l| l.confidence >= min_confidence);
    labels.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });
    labels.truncate(max_labels);
    labels
}

/// Rekognition reads JPEG and PNG only. Generic or missing content types
/// fall back to the key's extension.
fn is_supported_image(content_type: &str, object_key: &str) -> bool {
    let content_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match content_type.as_str() {
        "image/jpeg" | "image/jpg" | "image/png" => true,
        "" | "application/octet-stream" | "binary/octet-stream" => {
            let extension = object_key
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_ascii_lowercase())
                .unwrap_or_default();
            matches!(extension.as_str(), "jpg" | "jpeg" | "png")
        }
        _ => false,
    }
}

fn classify_head_object_error(err: &S3SdkError<HeadObjectError>) -> AnalysisError {
    let message = aws_sdk_s3::error::DisplayErrorContext(err).to_string();

    if err
        .as_service_error()
        .map(|e| e.is_not_found())
        .unwrap_or(false)
    {
        return AnalysisError::ObjectNotFound(message);
    }

    match err.raw_response().map(|r| r.status().as_u16()) {
        Some(404) => AnalysisError::ObjectNotFound(message),
        Some(401) | Some(403) => AnalysisError::PermissionDenied(message),
        Some(429) | Some(503) => AnalysisError::ServiceThrottled(message),
        _ => AnalysisError::ServiceUnavailable(message),
    }
}

fn classify_detect_labels_error(err: &RekognitionSdkError<DetectLabelsError>) -> AnalysisError {
    let message = DisplayErrorContext(err).to_string();

    let Some(service_error) = err.as_service_error() else {
        // Timeouts, dispatch and response failures never reached the service logic
        return AnalysisError::ServiceUnavailable(message);
    };

    if service_error.is_invalid_s3_object_exception() {
        AnalysisError::ObjectNotFound(message)
    } else if service_error.is_invalid_image_format_exception()
        || service_error.is_image_too_large_exception()
        || service_error.is_invalid_parameter_exception()
    {
        AnalysisError::UnsupportedFormat(message)
    } else if service_error.is_access_denied_exception() {
        AnalysisError::PermissionDenied(message)
    } else if service_error.is_throttling_exception()
        || service_error.is_provisioned_throughput_exceeded_exception()
    {
        AnalysisError::ServiceThrottled(message)
    } else {
        AnalysisError::ServiceUnavailable(message)
    }
}
