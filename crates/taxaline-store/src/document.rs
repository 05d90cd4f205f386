//! Stored document shape and store errors

use std::fmt;
use std::ops::AddAssign;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use taxaline_core::{categorize_message, ErrorCategory};

/// A keyed JSON document.
///
/// `partition` groups documents written by one provider so that older
/// versions can be dropped together; `version` is the dataset or pipeline
/// version the document was produced under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub partition: Option<String>,
    pub version: Option<String>,
    pub body: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, body: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            partition: None,
            version: None,
            body,
        }
    }

    /// Build a document from any value that serializes to a JSON object.
    pub fn from_serializable<T: Serialize>(
        id: impl Into<String>,
        value: &T,
    ) -> Result<Self, StoreError> {
        let id = id.into();
        match serde_json::to_value(value)? {
            Value::Object(body) => Ok(Self::new(id, body)),
            other => Err(StoreError::InvalidDocument {
                id,
                reason: format!("body must be a JSON object, got {}", json_kind(&other)),
            }),
        }
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(Value::Object(self.body.clone()))?)
    }

    pub fn body_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string(&self.body)?)
    }

    /// Approximate on-the-wire size: serialized body plus key columns.
    pub fn encoded_len(&self) -> Result<usize, StoreError> {
        let body = serde_json::to_vec(&self.body)?.len();
        Ok(body
            + self.id.len()
            + self.partition.as_ref().map_or(0, String::len)
            + self.version.as_ref().map_or(0, String::len))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Hard limits of a store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    pub max_document_bytes: usize,
    pub max_batch_bytes: usize,
    pub max_batch_ops: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_document_bytes: 16 * 1024 * 1024,
            max_batch_bytes: 48 * 1024 * 1024,
            max_batch_ops: 100_000,
        }
    }
}

impl StoreLimits {
    /// Reject a batch the backend would refuse, before touching it.
    pub fn check_batch(&self, docs: &[Document]) -> Result<usize, StoreError> {
        if docs.len() > self.max_batch_ops {
            return Err(StoreError::BatchTooLarge {
                docs: docs.len(),
                bytes: 0,
            });
        }
        let mut total = 0usize;
        for doc in docs {
            if doc.id.is_empty() {
                return Err(StoreError::InvalidDocument {
                    id: String::new(),
                    reason: "empty id".to_string(),
                });
            }
            let bytes = doc.encoded_len()?;
            if bytes > self.max_document_bytes {
                return Err(StoreError::DocTooLarge {
                    id: doc.id.clone(),
                    bytes,
                    limit: self.max_document_bytes,
                });
            }
            total += bytes;
        }
        if total > self.max_batch_bytes {
            return Err(StoreError::BatchTooLarge {
                docs: docs.len(),
                bytes: total,
            });
        }
        Ok(total)
    }
}

/// Counts returned by a bulk upsert.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    pub inserted: u64,
    pub updated: u64,
}

impl WriteSummary {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated
    }
}

impl AddAssign for WriteSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
    }
}

/// Errors raised by a [`DocumentStore`](crate::DocumentStore).
#[derive(Debug)]
pub enum StoreError {
    DocTooLarge {
        id: String,
        bytes: usize,
        limit: usize,
    },
    BatchTooLarge {
        docs: usize,
        bytes: usize,
    },
    InvalidDocument {
        id: String,
        reason: String,
    },
    InvalidCollection(String),
    Serialization(serde_json::Error),
    Backend(String),
}

impl StoreError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::DocTooLarge { .. } | Self::InvalidDocument { .. } | Self::Serialization(_) => {
                ErrorCategory::Record
            }
            Self::BatchTooLarge { .. } | Self::InvalidCollection(_) => ErrorCategory::Write,
            Self::Backend(msg) => categorize_message(msg).unwrap_or(ErrorCategory::Write),
        }
    }

    /// Whether retrying with a smaller batch can help.
    pub fn is_splittable(&self) -> bool {
        !matches!(self, Self::InvalidCollection(_))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DocTooLarge { id, bytes, limit } => {
                write!(f, "document {id} is {bytes} bytes, limit is {limit}")
            }
            Self::BatchTooLarge { docs, bytes } => {
                write!(f, "batch of {docs} documents ({bytes} bytes) exceeds store limits")
            }
            Self::InvalidDocument { id, reason } => write!(f, "invalid document '{id}': {reason}"),
            Self::InvalidCollection(name) => write!(f, "invalid collection name '{name}'"),
            Self::Serialization(e) => write!(f, "serialization: {e}"),
            Self::Backend(msg) => write!(f, "store backend: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

impl From<duckdb::Error> for StoreError {
    fn from(e: duckdb::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, payload: &str) -> Document {
        let body = json!({ "payload": payload });
        Document::from_serializable(id, &body).unwrap()
    }

    #[test]
    fn non_object_body_rejected() {
        let err = Document::from_serializable("x", &json!([1, 2])).unwrap_err();
        assert!(matches!(err, StoreError::InvalidDocument { .. }));
        assert_eq!(err.category(), ErrorCategory::Record);
    }

    #[test]
    fn decode_round_trip_struct() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Probe {
            name: String,
            n: u32,
        }
        let probe = Probe {
            name: "a".into(),
            n: 3,
        };
        let d = Document::from_serializable("p", &probe).unwrap();
        assert_eq!(d.decode::<Probe>().unwrap(), probe);
        assert_eq!(d.get_str("name"), Some("a"));
    }

    #[test]
    fn check_batch_flags_oversize_document() {
        let limits = StoreLimits {
            max_document_bytes: 64,
            ..StoreLimits::default()
        };
        let docs = vec![doc("a", "small"), doc("b", &"x".repeat(200))];
        match limits.check_batch(&docs) {
            Err(StoreError::DocTooLarge { id, .. }) => assert_eq!(id, "b"),
            other => panic!("expected DocTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn check_batch_flags_op_count() {
        let limits = StoreLimits {
            max_batch_ops: 1,
            ..StoreLimits::default()
        };
        let err = limits.check_batch(&[doc("a", "1"), doc("b", "2")]).unwrap_err();
        assert!(matches!(err, StoreError::BatchTooLarge { docs: 2, .. }));
    }

    #[test]
    fn empty_id_rejected() {
        let err = StoreLimits::default()
            .check_batch(&[doc("", "1")])
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidDocument { .. }));
    }

    #[test]
    fn backend_errors_categorized() {
        let e = StoreError::Backend("IO Error: connection reset".into());
        assert_eq!(e.category(), ErrorCategory::Transport);
        let e = StoreError::Backend("Constraint Error".into());
        assert_eq!(e.category(), ErrorCategory::Write);
    }

    #[test]
    fn write_summary_adds() {
        let mut s = WriteSummary {
            inserted: 1,
            updated: 2,
        };
        s += WriteSummary {
            inserted: 3,
            updated: 0,
        };
        assert_eq!(s.total(), 6);
    }
}
