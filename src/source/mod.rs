//! The collector contract every external source implements.

pub mod error;
pub mod http;

use std::collections::BTreeMap;
use std::future::Future;

use serde::{Deserialize, Serialize};

pub use error::CollectorError;
pub use http::HttpCollector;

use crate::work::SearchQuery;

/// One record as returned by a source, before fingerprinting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub title: String,
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl RawRecord {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// A searchable bibliographic source.
///
/// Implementations must be read-only: the orchestrator re-issues queries for
/// units whose completion is in doubt after a crash.
pub trait CollectorAdapter: Send + Sync + 'static {
    fn search(
        &self,
        query: &SearchQuery,
    ) -> impl Future<Output = Result<Vec<RawRecord>, CollectorError>> + Send;
}
