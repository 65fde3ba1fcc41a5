//! ChangeSet builder
//!
//! Classifies a version transition and, for updates, walks both documents
//! to find the changed JSON pointers. Objects are compared by sorted field
//! name and arrays by index; the result is sorted by path.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use slicegraph_storage::{content_hash, RawDataRecord};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::pointer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
    NoChange,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Create => "CREATE",
            ChangeType::Update => "UPDATE",
            ChangeType::Delete => "DELETE",
            ChangeType::NoChange => "NO_CHANGE",
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One changed location; `value_hash` is `None` when the value was removed
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangedPath {
    pub path: String,
    pub value_hash: Option<String>,
}

/// Why a slice type is impacted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactDetail {
    pub reason: String,
    pub matched_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub change_set_id: Uuid,
    pub tenant_id: String,
    pub entity_type: String,
    pub entity_key: String,
    pub from_version: Option<i64>,
    pub to_version: i64,
    pub change_type: ChangeType,
    pub changed_paths: Vec<ChangedPath>,
    pub impacted_slice_types: BTreeSet<String>,
    pub impact_map: BTreeMap<String, ImpactDetail>,
    pub payload_hash: String,
}

impl ChangeSet {
    pub fn with_impact(mut self, impact_map: BTreeMap<String, ImpactDetail>) -> Self {
        self.impacted_slice_types = impact_map.keys().cloned().collect();
        self.impact_map = impact_map;
        self
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.changed_paths.iter().map(|c| c.path.as_str())
    }
}

pub struct ChangeSetBuilder;

impl ChangeSetBuilder {
    /// Diff `from` (the previous version, if any) against `to`.
    pub fn build(from: Option<&RawDataRecord>, to: &RawDataRecord) -> Result<ChangeSet> {
        if let Some(from) = from {
            if from.tenant_id != to.tenant_id || from.entity_key != to.entity_key {
                return Err(EngineError::invariant(format!(
                    "cannot diff {} against {}",
                    from.display_id(),
                    to.display_id()
                )));
            }
            if from.version >= to.version {
                return Err(EngineError::invariant(format!(
                    "diff must move forward: {} -> {}",
                    from.version, to.version
                )));
            }
        }

        let previous = from.filter(|r| !r.is_tombstone());
        let change_type = match (previous, to.is_tombstone()) {
            (None, true) => ChangeType::NoChange,
            (None, false) => ChangeType::Create,
            (Some(_), true) => ChangeType::Delete,
            (Some(prev), false) if prev.payload_hash == to.payload_hash => ChangeType::NoChange,
            (Some(_), false) => ChangeType::Update,
        };

        let changed_paths = match (change_type, previous) {
            (ChangeType::Update, Some(prev)) => diff_documents(&prev.payload, &to.payload),
            _ => Vec::new(),
        };

        let from_version = from.map(|r| r.version);
        Ok(ChangeSet {
            change_set_id: change_set_id(to, from_version),
            tenant_id: to.tenant_id.clone(),
            entity_type: to.entity_type.clone(),
            entity_key: to.entity_key.clone(),
            from_version,
            to_version: to.version,
            change_type,
            changed_paths,
            impacted_slice_types: BTreeSet::new(),
            impact_map: BTreeMap::new(),
            payload_hash: to.payload_hash.clone(),
        })
    }
}

fn change_set_id(to: &RawDataRecord, from_version: Option<i64>) -> Uuid {
    let name = format!(
        "{}|{}|{}|{}|{}",
        to.tenant_id,
        to.entity_key,
        from_version.map_or_else(|| "-".to_string(), |v| v.to_string()),
        to.version,
        to.payload_hash
    );
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

/// Changed paths between two documents, sorted by path.
pub fn diff_documents(from: &Value, to: &Value) -> Vec<ChangedPath> {
    let mut out = Vec::new();
    diff_at("", from, to, &mut out);
    out.sort();
    out
}

fn diff_at(path: &str, from: &Value, to: &Value, out: &mut Vec<ChangedPath>) {
    match (from, to) {
        (Value::Object(a), Value::Object(b)) => {
            let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            for key in keys {
                let child = pointer::push(path, key);
                diff_child(&child, a.get(key), b.get(key), out);
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            for i in 0..a.len().max(b.len()) {
                let child = pointer::push(path, &i.to_string());
                diff_child(&child, a.get(i), b.get(i), out);
            }
        }
        _ if from != to => out.push(ChangedPath {
            path: path.to_string(),
            value_hash: Some(content_hash(to)),
        }),
        _ => {}
    }
}

fn diff_child(path: &str, from: Option<&Value>, to: Option<&Value>, out: &mut Vec<ChangedPath>) {
    match (from, to) {
        (Some(a), Some(b)) => diff_at(path, a, b, out),
        (None, Some(b)) => out.push(ChangedPath {
            path: path.to_string(),
            value_hash: Some(content_hash(b)),
        }),
        (Some(_), None) => out.push(ChangedPath {
            path: path.to_string(),
            value_hash: None,
        }),
        (None, None) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(version: i64, payload: Value) -> RawDataRecord {
        RawDataRecord::new("t1", "o-1", "ORDER", version, payload)
    }

    #[test]
    fn test_create_has_no_paths() {
        let cs = ChangeSetBuilder::build(None, &raw(1, json!({"name": "A"}))).unwrap();
        assert_eq!(cs.change_type, ChangeType::Create);
        assert!(cs.changed_paths.is_empty());
        assert_eq!(cs.from_version, None);
    }

    #[test]
    fn test_delete_on_tombstone() {
        let v1 = raw(1, json!({"name": "A"}));
        let v2 = RawDataRecord::tombstone("t1", "o-1", "ORDER", 2);
        let cs = ChangeSetBuilder::build(Some(&v1), &v2).unwrap();
        assert_eq!(cs.change_type, ChangeType::Delete);
        assert!(cs.changed_paths.is_empty());
    }

    #[test]
    fn test_recreate_after_tombstone_is_create() {
        let v1 = RawDataRecord::tombstone("t1", "o-1", "ORDER", 1);
        let v2 = raw(2, json!({"name": "A"}));
        assert_eq!(
            ChangeSetBuilder::build(Some(&v1), &v2).unwrap().change_type,
            ChangeType::Create
        );
    }

    #[test]
    fn test_equal_hash_is_no_change() {
        let v1 = raw(1, json!({"a": 1, "b": 2}));
        let v2 = raw(2, json!({"b": 2, "a": 1}));
        let cs = ChangeSetBuilder::build(Some(&v1), &v2).unwrap();
        assert_eq!(cs.change_type, ChangeType::NoChange);
        assert!(cs.changed_paths.is_empty());
    }

    #[test]
    fn test_update_paths_sorted_with_hashes() {
        let v1 = raw(1, json!({"name": "A", "items": [1, 2], "gone": true}));
        let v2 = raw(2, json!({"name": "B", "items": [1, 3, 4], "added": {"x": 1}}));
        let cs = ChangeSetBuilder::build(Some(&v1), &v2).unwrap();
        assert_eq!(cs.change_type, ChangeType::Update);

        let paths: Vec<_> = cs.paths().collect();
        assert_eq!(paths, vec!["/added", "/gone", "/items/1", "/items/2", "/name"]);

        let gone = &cs.changed_paths[1];
        assert_eq!(gone.value_hash, None);
        let name = &cs.changed_paths[4];
        assert_eq!(name.value_hash, Some(content_hash(&json!("B"))));
    }

    #[test]
    fn test_nested_keys_are_escaped() {
        let v1 = raw(1, json!({"a/b": {"c~d": 1}}));
        let v2 = raw(2, json!({"a/b": {"c~d": 2}}));
        let cs = ChangeSetBuilder::build(Some(&v1), &v2).unwrap();
        assert_eq!(cs.paths().collect::<Vec<_>>(), vec!["/a~1b/c~0d"]);
    }

    #[test]
    fn test_change_set_id_is_deterministic() {
        let v1 = raw(1, json!({"name": "A"}));
        let v2 = raw(2, json!({"name": "B"}));
        let a = ChangeSetBuilder::build(Some(&v1), &v2).unwrap();
        let b = ChangeSetBuilder::build(Some(&v1), &v2).unwrap();
        assert_eq!(a.change_set_id, b.change_set_id);
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_backwards_diff() {
        let v1 = raw(2, json!({}));
        let v2 = raw(1, json!({}));
        assert!(matches!(
            ChangeSetBuilder::build(Some(&v1), &v2),
            Err(EngineError::InvariantViolation(_))
        ));
    }
}
