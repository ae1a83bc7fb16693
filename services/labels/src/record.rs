use serde::{Deserialize, Serialize};

/// Highest confidence a label can carry
pub const MAX_CONFIDENCE: f32 = 100.0;

/// A single detected label with its confidence score (0-100)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelScore {
    /// Label name as reported by the analysis service
    #[serde(rename = "Name")]
    pub name: String,
    /// Confidence in percent
    #[serde(rename = "Confidence")]
    pub confidence: f32,
}

impl LabelScore {
    /// Create a label, clamping the confidence into `0..=100`.
    /// NaN is treated as zero confidence.
    pub fn new(name: impl Into<String>, confidence: f32) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, MAX_CONFIDENCE)
        };

        Self {
            name: name.into(),
            confidence,
        }
    }
}

/// Persisted outcome of analyzing one uploaded object.
///
/// Serialized as `{"objectKey": .., "bucket": .., "labels": [..]}`, which is
/// both the stored document shape and the retrieval response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    /// Object key, unique per record
    pub object_key: String,
    /// Bucket the object was uploaded to
    pub bucket: String,
    /// Labels in descending confidence order; empty when nothing was detected
    pub labels: Vec<LabelScore>,
}

impl ResultRecord {
    pub fn new(
        bucket: impl Into<String>,
        object_key: impl Into<String>,
        labels: Vec<LabelScore>,
    ) -> Self {
        Self {
            object_key: object_key.into(),
            bucket: bucket.into(),
            labels,
        }
    }
}
