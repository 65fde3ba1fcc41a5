//! RuleSet contracts
//!
//! A contract is versioned and immutable. It declares, for one entity type:
//!
//! - the slices to materialize (field mappings from raw document to slice)
//! - the inverted-index selectors
//! - the impact map: slice type → watched JSON-pointer prefixes

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::pointer;

/// `(id, version)` reference to one immutable contract
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleSetRef {
    pub id: String,
    pub version: String,
}

impl RuleSetRef {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }

    /// Parse `id@version`.
    pub fn parse(s: &str) -> Result<Self> {
        match s.rsplit_once('@') {
            Some((id, version)) if !id.is_empty() && !version.is_empty() => {
                Ok(Self::new(id, version))
            }
            _ => Err(EngineError::validation(format!(
                "rule set reference must look like id@version, got {:?}",
                s
            ))),
        }
    }
}

impl fmt::Display for RuleSetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// Copy one value from the raw document into a slice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Pointer into the raw document
    pub source: String,
    /// Pointer into the slice; defaults to `source`
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub required: bool,
    /// Used when the source is absent or null
    #[serde(default)]
    pub default: Option<Value>,
}

impl FieldMapping {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: None,
            required: false,
            default: None,
        }
    }

    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn or_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn target_path(&self) -> &str {
        self.target.as_deref().unwrap_or(&self.source)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceRule {
    pub slice_type: String,
    pub fields: Vec<FieldMapping>,
}

impl SliceRule {
    pub fn new(slice_type: impl Into<String>, fields: Vec<FieldMapping>) -> Self {
        Self {
            slice_type: slice_type.into(),
            fields,
        }
    }
}

/// Inverted-index selector: `index_type` keyed by the value at `selector`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRule {
    pub index_type: String,
    pub selector: String,
}

impl IndexRule {
    pub fn new(index_type: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            index_type: index_type.into(),
            selector: selector.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSetContract {
    pub id: String,
    pub version: String,
    pub entity_type: String,
    pub slices: Vec<SliceRule>,
    #[serde(default)]
    pub indexes: Vec<IndexRule>,
    /// slice type → watched path prefixes
    #[serde(default)]
    pub impact_map: BTreeMap<String, Vec<String>>,
}

impl RuleSetContract {
    pub fn reference(&self) -> RuleSetRef {
        RuleSetRef::new(&self.id, &self.version)
    }

    pub fn slice_types(&self) -> BTreeSet<String> {
        self.slices.iter().map(|s| s.slice_type.clone()).collect()
    }

    pub fn slice_rule(&self, slice_type: &str) -> Option<&SliceRule> {
        self.slices.iter().find(|s| s.slice_type == slice_type)
    }

    /// Structural checks run once when a contract is loaded.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() || self.version.is_empty() || self.entity_type.is_empty() {
            return Err(EngineError::validation(format!(
                "contract {} must declare id, version and entity_type",
                self.reference()
            )));
        }

        let mut seen = BTreeSet::new();
        for rule in &self.slices {
            if !seen.insert(rule.slice_type.as_str()) {
                return Err(EngineError::validation(format!(
                    "contract {} declares slice type {} twice",
                    self.reference(),
                    rule.slice_type
                )));
            }
            for field in &rule.fields {
                pointer::parse(&field.source)?;
                pointer::parse(field.target_path())?;
            }
        }

        for index in &self.indexes {
            pointer::parse(&index.selector)?;
        }

        for (slice_type, prefixes) in &self.impact_map {
            if !seen.contains(slice_type.as_str()) {
                return Err(EngineError::validation(format!(
                    "contract {} impact map references undeclared slice type {}",
                    self.reference(),
                    slice_type
                )));
            }
            for prefix in prefixes {
                if !prefix.starts_with('/') {
                    return Err(EngineError::InvalidFieldPath {
                        path: prefix.clone(),
                        reason: "impact prefix must start with '/'".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Registry port
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait ContractRegistry: Send + Sync {
    async fn load_rule_set_contract(&self, reference: &RuleSetRef) -> Result<Arc<RuleSetContract>>;
}

/// Registry backed by a map, with a load counter and optional latency
#[derive(Default)]
pub struct InMemoryContractRegistry {
    contracts: RwLock<HashMap<RuleSetRef, Arc<RuleSetContract>>>,
    loads: AtomicU64,
    latency: Option<Duration>,
}

impl InMemoryContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every load.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn register(&self, contract: RuleSetContract) {
        self.contracts
            .write()
            .insert(contract.reference(), Arc::new(contract));
    }

    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContractRegistry for InMemoryContractRegistry {
    async fn load_rule_set_contract(&self, reference: &RuleSetRef) -> Result<Arc<RuleSetContract>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.contracts
            .read()
            .get(reference)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("rule set {}", reference)))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// ORDER contract with SUMMARY and DETAIL slices
    pub fn order_contract() -> RuleSetContract {
        RuleSetContract {
            id: "orders".into(),
            version: "1".into(),
            entity_type: "ORDER".into(),
            slices: vec![
                SliceRule::new(
                    "SUMMARY",
                    vec![
                        FieldMapping::new("/name").required(),
                        FieldMapping::new("/status").or_default(Value::from("NEW")),
                    ],
                ),
                SliceRule::new(
                    "DETAIL",
                    vec![
                        FieldMapping::new("/items").to("/lines"),
                        FieldMapping::new("/brand"),
                    ],
                ),
            ],
            indexes: vec![IndexRule::new("brand", "/brand"), IndexRule::new("tag", "/tags")],
            impact_map: BTreeMap::from([
                ("SUMMARY".to_string(), vec!["/name".to_string(), "/status".to_string()]),
                (
                    "DETAIL".to_string(),
                    vec!["/items".to_string(), "/brand/".to_string(), "/tags".to_string()],
                ),
            ]),
        }
    }
}
