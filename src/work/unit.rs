use std::fmt;

use serde::{Deserialize, Serialize};

use super::status::UnitStatus;
use crate::error::{HarvestError, Result};

/// One slice of the corpus: a research domain, optionally narrowed to a year.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub domain: String,
    pub year: Option<u16>,
}

impl Partition {
    pub fn new(domain: impl Into<String>, year: Option<u16>) -> Self {
        Self {
            domain: domain.into(),
            year,
        }
    }

    /// Stable key, `domain:year` or just `domain`.
    pub fn key(&self) -> String {
        match self.year {
            Some(year) => format!("{}:{year}", self.domain),
            None => self.domain.clone(),
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Query handed to a [`CollectorAdapter`](crate::source::CollectorAdapter).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Source the query is addressed to (primary or fallback).
    pub source: String,
    pub terms: String,
    pub year: Option<u16>,
    pub max_results: u32,
}

/// Smallest schedulable piece of collection work: one source × one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: String,
    pub source: String,
    pub partition: Partition,
    pub status: UnitStatus,
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Source that actually satisfied the unit, when a fallback was used.
    #[serde(default)]
    pub completed_via: Option<String>,
}

impl WorkUnit {
    pub fn new(source: impl Into<String>, partition: Partition) -> Self {
        let source = source.into();
        Self {
            id: Self::make_id(&source, &partition),
            source,
            partition,
            status: UnitStatus::Pending,
            retry_count: 0,
            last_error: None,
            completed_via: None,
        }
    }

    pub fn make_id(source: &str, partition: &Partition) -> String {
        format!("{source}/{}", partition.key())
    }

    /// Apply a status transition, rejecting anything the lifecycle forbids.
    pub fn transition(&mut self, next: UnitStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(HarvestError::InvalidTransition {
                unit_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Build the query for this unit, addressed to `source`.
    pub fn query_for(&self, source: &str, max_results: u32) -> SearchQuery {
        SearchQuery {
            source: source.to_string(),
            terms: self.partition.domain.clone(),
            year: self.partition.year,
            max_results,
        }
    }
}
