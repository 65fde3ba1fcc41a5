//! Impact calculator
//!
//! Maps changed paths to impacted slice types through the rule set's impact
//! map. A watched prefix `p` (trailing `/` trimmed) matches `path` iff
//! `path == p` or `path` starts with `p + "/"`, so `/brand/` matches
//! `/brand` and `/brand/id` but not `/brandName`.
//!
//! Fail-closed: a changed path that no prefix matches aborts the whole
//! calculation with `UnmappedChangePath`.

use std::collections::BTreeMap;

use tracing::warn;

use crate::changeset::{ChangeSet, ChangeType, ImpactDetail};
use crate::contract::RuleSetContract;
use crate::error::{EngineError, Result};

pub const REASON_CREATED: &str = "entity_created";
pub const REASON_DELETED: &str = "entity_deleted";
pub const REASON_PATHS_CHANGED: &str = "paths_changed";

pub fn prefix_matches(path: &str, prefix: &str) -> bool {
    let p = prefix.trim_end_matches('/');
    path == p
        || path
            .strip_prefix(p)
            .is_some_and(|rest| rest.starts_with('/'))
}

pub struct ImpactCalculator;

impl ImpactCalculator {
    pub fn calculate(
        change_set: &ChangeSet,
        contract: &RuleSetContract,
    ) -> Result<BTreeMap<String, ImpactDetail>> {
        match change_set.change_type {
            ChangeType::NoChange => Ok(BTreeMap::new()),
            ChangeType::Create => Ok(Self::all_slices(contract, REASON_CREATED)),
            ChangeType::Delete => Ok(Self::all_slices(contract, REASON_DELETED)),
            ChangeType::Update => Self::map_paths(change_set, contract),
        }
    }

    /// Compute and attach the impact to `change_set`.
    pub fn apply(change_set: ChangeSet, contract: &RuleSetContract) -> Result<ChangeSet> {
        let impact = Self::calculate(&change_set, contract)?;
        Ok(change_set.with_impact(impact))
    }

    fn all_slices(contract: &RuleSetContract, reason: &str) -> BTreeMap<String, ImpactDetail> {
        contract
            .slice_types()
            .into_iter()
            .map(|slice_type| {
                (
                    slice_type,
                    ImpactDetail {
                        reason: reason.to_string(),
                        matched_paths: Vec::new(),
                    },
                )
            })
            .collect()
    }

    fn map_paths(
        change_set: &ChangeSet,
        contract: &RuleSetContract,
    ) -> Result<BTreeMap<String, ImpactDetail>> {
        let mut impact: BTreeMap<String, ImpactDetail> = BTreeMap::new();
        let mut unmapped = Vec::new();

        for path in change_set.paths() {
            let mut matched = false;
            for (slice_type, prefixes) in &contract.impact_map {
                if prefixes.iter().any(|p| prefix_matches(path, p)) {
                    matched = true;
                    impact
                        .entry(slice_type.clone())
                        .or_insert_with(|| ImpactDetail {
                            reason: REASON_PATHS_CHANGED.to_string(),
                            matched_paths: Vec::new(),
                        })
                        .matched_paths
                        .push(path.to_string());
                }
            }
            if !matched {
                unmapped.push(path.to_string());
            }
        }

        if !unmapped.is_empty() {
            warn!(
                rule_set = %contract.reference(),
                entity_key = %change_set.entity_key,
                unmapped = ?unmapped,
                "change paths not covered by impact map"
            );
            return Err(EngineError::UnmappedChangePath {
                rule_set: contract.reference().to_string(),
                paths: unmapped,
            });
        }
        Ok(impact)
    }
}
