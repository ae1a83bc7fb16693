//! Upload notifications in the S3 event notification format.
//!
//! Every field is optional at the type level. [`NotificationRecord::parse`] is
//! the only place that decides whether a record names an object.

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Event name prefix of object creation notifications
const OBJECT_CREATED_PREFIX: &str = "ObjectCreated:";

/// A batch of upload notification records.
///
/// Payloads without `Records` (such as the `s3:TestEvent` sent when a
/// notification target is configured) decode to an empty batch. Records are
/// decoded one by one, so a record with wrong-typed fields does not keep its
/// siblings from decoding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadNotification {
    #[serde(rename = "Records", default, deserialize_with = "deserialize_records")]
    pub records: Vec<NotificationRecord>,
}

fn deserialize_records<'de, D>(deserializer: D) -> Result<Vec<NotificationRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Vec::<Value>::deserialize(deserializer)?;
    Ok(values.into_iter().map(NotificationRecord::from_value).collect())
}

/// One entry of an upload notification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Entity>,
    /// Fields this service does not interpret, kept so redelivered records
    /// match what the trigger sent
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    /// Set when the record could not be decoded; `parse` reports it
    #[serde(skip)]
    pub malformed: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct S3Entity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<BucketEntity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectEntity>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketEntity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectEntity {
    /// Percent-encoded object key, `+` standing for a space
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A parsed, decoded reference to an uploaded object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub bucket: String,
    pub object_key: String,
}

/// Reasons a notification record does not name an object
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("record has no bucket name")]
    MissingBucket,

    #[error("record has no object key")]
    MissingKey,

    #[error("object key is not valid percent-encoding: {0}")]
    InvalidKeyEncoding(String),

    #[error("not an object creation event: {0}")]
    UnsupportedEvent(String),

    #[error("record could not be decoded: {0}")]
    Malformed(String),
}

impl UploadNotification {
    pub fn new(records: Vec<NotificationRecord>) -> Self {
        Self { records }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

impl NotificationRecord {
    /// Build an object-created record for a bucket and a raw (encoded) key
    pub fn object_created(bucket: impl Into<String>, encoded_key: impl Into<String>) -> Self {
        Self {
            event_name: Some(format!("{OBJECT_CREATED_PREFIX}Put")),
            s3: Some(S3Entity {
                bucket: Some(BucketEntity {
                    name: Some(bucket.into()),
                    ..Default::default()
                }),
                object: Some(ObjectEntity {
                    key: Some(encoded_key.into()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Decode one raw record. A record that does not fit the schema is kept,
    /// with its raw fields, as a malformed record.
    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value::<NotificationRecord>(value.clone()) {
            Ok(record) => record,
            Err(e) => {
                let extra = match value {
                    Value::Object(fields) => fields,
                    other => Map::from_iter([("raw".to_string(), other)]),
                };
                Self {
                    extra,
                    malformed: Some(e.to_string()),
                    ..Default::default()
                }
            }
        }
    }

    /// Extract the bucket and decoded object key
    pub fn parse(&self) -> Result<ObjectRef, ParseError> {
        if let Some(ref reason) = self.malformed {
            return Err(ParseError::Malformed(reason.clone()));
        }

        if let Some(ref event_name) = self.event_name {
            if !event_name.starts_with(OBJECT_CREATED_PREFIX) {
                return Err(ParseError::UnsupportedEvent(event_name.clone()));
            }
        }

        let s3 = self.s3.as_ref();

        let bucket = s3
            .and_then(|s3| s3.bucket.as_ref())
            .and_then(|b| b.name.as_deref())
            .filter(|name| !name.is_empty())
            .ok_or(ParseError::MissingBucket)?;

        let raw_key = s3
            .and_then(|s3| s3.object.as_ref())
            .and_then(|o| o.key.as_deref())
            .filter(|key| !key.is_empty())
            .ok_or(ParseError::MissingKey)?;

        let object_key = decode_object_key(raw_key)?;
        if object_key.is_empty() {
            return Err(ParseError::MissingKey);
        }

        Ok(ObjectRef {
            bucket: bucket.to_string(),
            object_key,
        })
    }
}

/// Decode an object key as it appears in notifications.
///
/// `+` is a space; every `%` must start a two-digit hex escape and the
/// decoded bytes must be UTF-8.
pub fn decode_object_key(raw: &str) -> Result<String, ParseError> {
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes.len() > i + 2
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !valid {
                return Err(ParseError::InvalidKeyEncoding(format!(
                    "truncated escape at byte {i} in {raw:?}"
                )));
            }
            i += 3;
        } else {
            i += 1;
        }
    }

    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|e| ParseError::InvalidKeyEncoding(e.to_string()))
}
