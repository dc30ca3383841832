//! Abstract document-store interface consumed by the entity store, the import
//! ledger and the backup manager.

use std::cmp::Ordering;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::retry::RetryDisposition;

/// Write-batch ceiling shared by the bundled backends.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put {
        collection: String,
        id: String,
        doc: Value,
    },
    Delete {
        collection: String,
        id: String,
    },
}

impl WriteOp {
    pub fn put(collection: &str, id: impl Into<String>, doc: Value) -> Self {
        Self::Put {
            collection: collection.to_string(),
            id: id.into(),
            doc,
        }
    }

    pub fn delete(collection: &str, id: impl Into<String>) -> Self {
        Self::Delete {
            collection: collection.to_string(),
            id: id.into(),
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            Self::Put { collection, .. } | Self::Delete { collection, .. } => collection,
        }
    }
}

/// Equality / inclusive-range predicates over top-level document fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq {
        field: String,
        value: Value,
    },
    Range {
        field: String,
        from: Option<Value>,
        to: Option<Value>,
    },
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self::Eq {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn range(field: &str, from: Option<Value>, to: Option<Value>) -> Self {
        Self::Range {
            field: field.to_string(),
            from,
            to,
        }
    }

    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Self::All => true,
            Self::Eq { field, value } => doc.get(field) == Some(value),
            Self::Range { field, from, to } => {
                let Some(actual) = doc.get(field) else {
                    return false;
                };
                let lower_ok = from.as_ref().map_or(true, |bound| {
                    matches!(
                        compare_values(actual, bound),
                        Some(Ordering::Greater | Ordering::Equal)
                    )
                });
                let upper_ok = to.as_ref().map_or(true, |bound| {
                    matches!(
                        compare_values(actual, bound),
                        Some(Ordering::Less | Ordering::Equal)
                    )
                });
                lower_ok && upper_ok
            }
            Self::And(filters) => filters.iter().all(|f| f.matches(doc)),
        }
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("document {collection}/{id} already exists")]
    AlreadyExists { collection: String, id: String },
    #[error("conflict on {collection}/{id}: {reason}")]
    Conflict {
        collection: String,
        id: String,
        reason: String,
    },
    #[error("invalid collection name '{0}'")]
    InvalidCollection(String),
    #[error("serializing {collection}/{id}: {source}")]
    Serialization {
        collection: String,
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Transient(_) => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError>;

    async fn get_many(&self, collection: &str, ids: &[String]) -> Result<Vec<Document>, StoreError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(body) = self.get(collection, id).await? {
                out.push(Document {
                    id: id.clone(),
                    body,
                });
            }
        }
        Ok(out)
    }

    async fn put(&self, collection: &str, id: &str, doc: Value) -> Result<(), StoreError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    async fn query(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError>;

    /// Documents ordered by id, strictly after `after`, at most `limit` of them.
    async fn page(
        &self,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError>;

    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError>;

    async fn count(&self, collection: &str) -> Result<u64, StoreError>;

    fn max_batch_size(&self) -> usize {
        DEFAULT_MAX_BATCH_SIZE
    }
}

pub fn to_document<T: Serialize>(collection: &str, id: &str, value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|source| StoreError::Serialization {
        collection: collection.to_string(),
        id: id.to_string(),
        source,
    })
}

pub fn from_document<T: DeserializeOwned>(
    collection: &str,
    id: &str,
    body: Value,
) -> Result<T, StoreError> {
    serde_json::from_value(body).map_err(|source| StoreError::Serialization {
        collection: collection.to_string(),
        id: id.to_string(),
        source,
    })
}

pub(crate) fn validate_collection(collection: &str) -> Result<(), StoreError> {
    let valid = !collection.is_empty()
        && collection
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidCollection(collection.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn range_filter_compares_iso_dates_as_strings() {
        let filter = Filter::range(
            "snapshot_date",
            Some(json!("2025-07-01")),
            Some(json!("2025-07-31")),
        );
        assert!(filter.matches(&json!({"snapshot_date": "2025-07-15"})));
        assert!(filter.matches(&json!({"snapshot_date": "2025-07-31"})));
        assert!(!filter.matches(&json!({"snapshot_date": "2025-08-01"})));
        assert!(!filter.matches(&json!({"other": "2025-07-15"})));
    }

    #[test]
    fn and_filter_requires_every_clause() {
        let filter = Filter::And(vec![
            Filter::eq("file_name", "Lawley_01082025.csv"),
            Filter::eq("status", "completed"),
        ]);
        assert!(filter.matches(&json!({"file_name": "Lawley_01082025.csv", "status": "completed"})));
        assert!(!filter.matches(&json!({"file_name": "Lawley_01082025.csv", "status": "pending"})));
    }

    #[test]
    fn numeric_ranges_do_not_match_strings() {
        let filter = Filter::range("total_records", Some(json!(10)), None);
        assert!(filter.matches(&json!({"total_records": 12})));
        assert!(!filter.matches(&json!({"total_records": "12"})));
    }

    #[test]
    fn collection_names_are_path_safe() {
        assert!(validate_collection("backup__bk-20250801__entities").is_ok());
        assert!(validate_collection("../etc").is_err());
        assert!(validate_collection("").is_err());
    }
}
