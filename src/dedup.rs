//! Fingerprint-based merge of records collected from several sources.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::HarvestConfig;
use crate::source::RawRecord;

/// A record as stored in the session log and the final corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectedRecord {
    pub fingerprint: String,
    /// Source whose values won the merge (or the only source).
    pub source: String,
    /// Every source that contributed, most trusted first.
    pub sources: Vec<String>,
    pub title: String,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    pub collected_at: DateTime<Utc>,
}

impl CollectedRecord {
    pub fn from_raw(raw: RawRecord, source: &str, collected_at: DateTime<Utc>) -> Self {
        let fingerprint = fingerprint(&raw.title, &raw.fields);
        Self {
            fingerprint,
            source: source.to_string(),
            sources: vec![source.to_string()],
            title: raw.title,
            fields: raw.fields,
            collected_at,
        }
    }

    /// Whether the stored fingerprint still matches the record's content.
    pub fn is_intact(&self) -> bool {
        fingerprint(&self.title, &self.fields) == self.fingerprint
    }
}

/// Lowercase and keep only alphanumerics.
pub fn normalize_title(title: &str) -> String {
    title
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// SHA-256 hex of the normalized title, or of the canonical field JSON when
/// the title normalizes to nothing.
pub fn fingerprint(title: &str, fields: &BTreeMap<String, Value>) -> String {
    let normalized = normalize_title(title);
    let mut hasher = Sha256::new();
    if normalized.is_empty() {
        // BTreeMap serializes with sorted keys
        let canonical = serde_json::to_string(fields).unwrap_or_default();
        hasher.update(b"fields:");
        hasher.update(canonical.as_bytes());
    } else {
        hasher.update(normalized.as_bytes());
    }
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

pub struct Deduplicator {
    trust: HashMap<String, u32>,
}

impl Deduplicator {
    pub fn new(trust: HashMap<String, u32>) -> Self {
        Self { trust }
    }

    pub fn from_config(config: &HarvestConfig) -> Self {
        Self::new(
            config
                .sources
                .iter()
                .map(|(name, source)| (name.clone(), source.trust_rank))
                .collect(),
        )
    }

    fn rank(&self, source: &str) -> u32 {
        self.trust.get(source).copied().unwrap_or(0)
    }

    /// Merge duplicates, keeping first-appearance order. Idempotent.
    pub fn merge(&self, records: Vec<CollectedRecord>) -> Vec<CollectedRecord> {
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<CollectedRecord>> = HashMap::new();
        for record in records {
            let group = groups.entry(record.fingerprint.clone()).or_default();
            if group.is_empty() {
                order.push(record.fingerprint.clone());
            }
            group.push(record);
        }

        order
            .into_iter()
            .filter_map(|fp| groups.remove(&fp))
            .map(|mut group| {
                if group.len() == 1 {
                    group.remove(0)
                } else {
                    self.merge_group(group)
                }
            })
            .collect()
    }

    fn merge_group(&self, group: Vec<CollectedRecord>) -> CollectedRecord {
        let primary = self.most_trusted(&group, |_| true);

        let title_idx = self.most_trusted(&group, |r| !r.title.trim().is_empty());
        let title = group[title_idx].title.clone();

        let mut fields = BTreeMap::new();
        let keys: Vec<&String> = {
            let mut keys: Vec<&String> = group.iter().flat_map(|r| r.fields.keys()).collect();
            keys.sort();
            keys.dedup();
            keys
        };
        for key in keys {
            let idx = self.most_trusted(&group, |r| {
                r.fields.get(key).is_some_and(|v| !is_empty_value(v))
            });
            // nothing non-empty: keep whatever the first holder had
            let value = group[idx]
                .fields
                .get(key)
                .or_else(|| group.iter().find_map(|r| r.fields.get(key)))
                .cloned()
                .unwrap_or(Value::Null);
            fields.insert(key.clone(), value);
        }

        let mut sources: Vec<String> = Vec::new();
        for record in &group {
            for source in &record.sources {
                if !sources.contains(source) {
                    sources.push(source.clone());
                }
            }
        }
        // stable sort keeps first appearance among equal ranks
        sources.sort_by_key(|s| std::cmp::Reverse(self.rank(s)));

        let collected_at = group
            .iter()
            .map(|r| r.collected_at)
            .min()
            .unwrap_or_else(Utc::now);

        CollectedRecord {
            fingerprint: group[primary].fingerprint.clone(),
            source: group[primary].source.clone(),
            sources,
            title,
            fields,
            collected_at,
        }
    }

    /// Index of the highest-trust record satisfying `eligible`; ties go to the
    /// earliest. Falls back to index 0 when none qualifies.
    fn most_trusted(
        &self,
        group: &[CollectedRecord],
        eligible: impl Fn(&CollectedRecord) -> bool,
    ) -> usize {
        let mut best: Option<(usize, u32)> = None;
        for (idx, record) in group.iter().enumerate() {
            if !eligible(record) {
                continue;
            }
            let rank = self.rank(&record.source);
            if best.is_none_or(|(_, r)| rank > r) {
                best = Some((idx, rank));
            }
        }
        best.map_or(0, |(idx, _)| idx)
    }
}
