use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::unit::{Partition, WorkUnit};
use crate::error::{HarvestError, Result};

/// Ordered set of work units making up one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkPlan {
    units: Vec<WorkUnit>,
}

impl WorkPlan {
    /// Build a plan from explicit units, rejecting duplicate ids.
    pub fn new(units: Vec<WorkUnit>) -> Result<Self> {
        let mut seen = HashSet::new();
        for unit in &units {
            if !seen.insert(unit.id.as_str()) {
                return Err(HarvestError::InvalidPlan(format!(
                    "duplicate work unit id {}",
                    unit.id
                )));
            }
        }
        Ok(Self { units })
    }

    /// Full grid of `sources × domains × years`. An empty `years` slice
    /// yields one year-less partition per domain.
    pub fn grid(sources: &[String], domains: &[String], years: &[u16]) -> Result<Self> {
        let mut units = Vec::new();
        for source in sources {
            for domain in domains {
                if years.is_empty() {
                    units.push(WorkUnit::new(source.clone(), Partition::new(domain.clone(), None)));
                }
                for year in years {
                    units.push(WorkUnit::new(
                        source.clone(),
                        Partition::new(domain.clone(), Some(*year)),
                    ));
                }
            }
        }
        Self::new(units)
    }

    pub fn units(&self) -> &[WorkUnit] {
        &self.units
    }

    pub fn into_units(self) -> Vec<WorkUnit> {
        self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn grid_builds_cartesian_product() {
        let plan = WorkPlan::grid(
            &strings(&["arxiv", "crossref"]),
            &strings(&["nlp", "vision"]),
            &[2020, 2021],
        )
        .unwrap();
        assert_eq!(plan.len(), 8);
        assert_eq!(plan.units()[0].id, "arxiv/nlp:2020");
        assert_eq!(plan.units()[7].id, "crossref/vision:2021");
    }

    #[test]
    fn grid_without_years() {
        let plan = WorkPlan::grid(&strings(&["dblp"]), &strings(&["ir", "db"]), &[]).unwrap();
        let ids: Vec<_> = plan.units().iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["dblp/ir", "dblp/db"]);
    }

    #[test]
    fn duplicate_ids_rejected() {
        let unit = WorkUnit::new("dblp", Partition::new("ir", None));
        let err = WorkPlan::new(vec![unit.clone(), unit]).unwrap_err();
        assert!(matches!(err, HarvestError::InvalidPlan(_)));
    }
}
