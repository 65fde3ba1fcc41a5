//! Slicing engine
//!
//! `slice_with_contract` is the pure transform: raw document + contract →
//! slices + inverted-index entries. No clock, no I/O; identical inputs give
//! byte-identical output, sorted by slice type and by index key.
//!
//! `SlicingEngine` resolves the contract through the `ContractLoader` and
//! then calls the pure transform.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use slicegraph_storage::{content_hash, InvertedIndexEntry, RawDataRecord, SliceRecord};
use tracing::debug;

use crate::cache::ContractLoader;
use crate::contract::{IndexRule, RuleSetContract, RuleSetRef, SliceRule};
use crate::error::{EngineError, Result};
use crate::pointer::{self, Lookup};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SlicingOutput {
    pub slices: Vec<SliceRecord>,
    pub index_entries: Vec<InvertedIndexEntry>,
}

impl SlicingOutput {
    pub fn slice(&self, slice_type: &str) -> Option<&SliceRecord> {
        self.slices.iter().find(|s| s.slice_type == slice_type)
    }
}

/// Slice `raw` under `contract`, restricted to `only` when given.
///
/// Index entries are always computed: they describe the entity's current
/// version regardless of which slices changed.
pub fn slice_with_contract(
    raw: &RawDataRecord,
    contract: &RuleSetContract,
    only: Option<&BTreeSet<String>>,
) -> Result<SlicingOutput> {
    if raw.entity_type != contract.entity_type {
        return Err(EngineError::validation(format!(
            "rule set {} slices {} entities, got {} for {}",
            contract.reference(),
            contract.entity_type,
            raw.entity_type,
            raw.display_id()
        )));
    }

    if let Some(only) = only {
        let declared = contract.slice_types();
        if let Some(unknown) = only.iter().find(|t| !declared.contains(*t)) {
            return Err(EngineError::validation(format!(
                "slice type {} is not declared by rule set {}",
                unknown,
                contract.reference()
            )));
        }
    }

    let mut rules: Vec<&SliceRule> = contract
        .slices
        .iter()
        .filter(|r| only.map_or(true, |o| o.contains(&r.slice_type)))
        .collect();
    rules.sort_by(|a, b| a.slice_type.cmp(&b.slice_type));

    let mut slices = Vec::with_capacity(rules.len());
    for rule in rules {
        let payload = if raw.is_tombstone() {
            Value::Null
        } else {
            build_slice_payload(&raw.payload, rule)?
        };
        slices.push(SliceRecord {
            tenant_id: raw.tenant_id.clone(),
            entity_key: raw.entity_key.clone(),
            entity_type: raw.entity_type.clone(),
            version: raw.version,
            slice_type: rule.slice_type.clone(),
            slice_hash: content_hash(&payload),
            payload,
            rule_set_id: contract.id.clone(),
            rule_set_version: contract.version.clone(),
            tombstone: raw.is_tombstone(),
        });
    }

    let index_entries = if raw.is_tombstone() {
        Vec::new()
    } else {
        build_index_entries(raw, &contract.indexes)?
    };

    Ok(SlicingOutput {
        slices,
        index_entries,
    })
}

fn build_slice_payload(document: &Value, rule: &SliceRule) -> Result<Value> {
    let mut payload = Value::Object(Map::new());
    for field in &rule.fields {
        let value = match pointer::lookup(document, &field.source)? {
            Lookup::Found(v) if !v.is_null() => Some(v.clone()),
            Lookup::ThroughScalar { depth, scalar } => {
                debug!(
                    slice_type = %rule.slice_type,
                    path = %field.source,
                    depth,
                    scalar = %scalar,
                    "field path runs through a scalar; treating as absent"
                );
                field.default.clone()
            }
            _ => field.default.clone(),
        };
        match value {
            Some(v) => pointer::set(&mut payload, field.target_path(), v)?,
            None if field.required => {
                return Err(EngineError::MissingRequiredField {
                    slice_type: rule.slice_type.clone(),
                    path: field.source.clone(),
                })
            }
            None => {}
        }
    }
    Ok(payload)
}

fn index_value(selector: &str, value: &Value) -> Result<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Bool(_) | Value::Number(_) => Ok(Some(value.to_string())),
        Value::Array(_) | Value::Object(_) => Err(EngineError::InvalidFieldPath {
            path: selector.to_string(),
            reason: "index selector must resolve to a scalar or an array of scalars".to_string(),
        }),
    }
}

fn build_index_entries(raw: &RawDataRecord, rules: &[IndexRule]) -> Result<Vec<InvertedIndexEntry>> {
    let mut keys: BTreeSet<(String, String)> = BTreeSet::new();
    for rule in rules {
        let Some(found) = pointer::get(&raw.payload, &rule.selector)? else {
            continue;
        };
        let values = match found {
            Value::Array(items) => items
                .iter()
                .map(|item| index_value(&rule.selector, item))
                .collect::<Result<Vec<_>>>()?,
            scalar => vec![index_value(&rule.selector, scalar)?],
        };
        for value in values.into_iter().flatten() {
            keys.insert((rule.index_type.clone(), value));
        }
    }

    Ok(keys
        .into_iter()
        .map(|(index_type, index_value)| InvertedIndexEntry {
            tenant_id: raw.tenant_id.clone(),
            index_type,
            index_value,
            entity_key: raw.entity_key.clone(),
            entity_type: raw.entity_type.clone(),
            current_version: raw.version,
        })
        .collect())
}

pub struct SlicingEngine {
    loader: Arc<ContractLoader>,
}

impl SlicingEngine {
    pub fn new(loader: Arc<ContractLoader>) -> Self {
        Self { loader }
    }

    pub fn loader(&self) -> &Arc<ContractLoader> {
        &self.loader
    }

    /// Every declared slice plus index entries.
    pub async fn slice(&self, raw: &RawDataRecord, rule_set: &RuleSetRef) -> Result<SlicingOutput> {
        let contract = self.loader.load(rule_set).await?;
        let output = slice_with_contract(raw, &contract, None)?;
        debug!(
            entity = %raw.display_id(),
            rule_set = %rule_set,
            slices = output.slices.len(),
            index_entries = output.index_entries.len(),
            "sliced entity"
        );
        Ok(output)
    }

    /// Only the `impacted` slice types plus index entries.
    pub async fn slice_partial(
        &self,
        raw: &RawDataRecord,
        rule_set: &RuleSetRef,
        impacted: &BTreeSet<String>,
    ) -> Result<SlicingOutput> {
        let contract = self.loader.load(rule_set).await?;
        let output = slice_with_contract(raw, &contract, Some(impacted))?;
        debug!(
            entity = %raw.display_id(),
            rule_set = %rule_set,
            slices = output.slices.len(),
            "partially sliced entity"
        );
        Ok(output)
    }
}
