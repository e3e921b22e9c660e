//! Structural, order-insensitive differences between two JSON documents.
//!
//! Object keys are matched by name. Sequences are compared as multisets:
//! an element present on both sides (in any position) is unchanged, anything
//! else is reported as added or removed. Paths use the `root['key'][index]`
//! notation, with indexes referring to the side the element was found on.
use crate::utils::canonical_json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub old_value: Value,
    pub new_value: Value,
}

/// JSON-serializable change-set. Empty categories are omitted, so an empty
/// change-set serializes as `{}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub added: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub removed: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values_changed: BTreeMap<String, Change>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub types_changed: BTreeMap<String, Change>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.values_changed.is_empty()
            && self.types_changed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.values_changed.len() + self.types_changed.len()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

pub fn diff(old: &Value, new: &Value) -> ChangeSet {
    let mut changes = ChangeSet::default();
    walk("root".to_string(), old, new, &mut changes);
    changes
}

fn walk(path: String, old: &Value, new: &Value, changes: &mut ChangeSet) {
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, old_child) in a {
                let child_path = format!("{path}['{key}']");
                match b.get(key) {
                    Some(new_child) => walk(child_path, old_child, new_child, changes),
                    None => {
                        changes.removed.insert(child_path, old_child.clone());
                    }
                }
            }
            for (key, new_child) in b {
                if !a.contains_key(key) {
                    changes.added.insert(format!("{path}['{key}']"), new_child.clone());
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => compare_unordered(&path, a, b, changes),
        _ if type_name(old) == type_name(new) => {
            if old != new {
                changes.values_changed.insert(
                    path,
                    Change {
                        old_value: old.clone(),
                        new_value: new.clone(),
                    },
                );
            }
        }
        _ => {
            changes.types_changed.insert(
                path,
                Change {
                    old_value: old.clone(),
                    new_value: new.clone(),
                },
            );
        }
    }
}

fn compare_unordered(path: &str, old: &[Value], new: &[Value], changes: &mut ChangeSet) {
    let mut remaining: HashMap<String, usize> = HashMap::new();
    for item in new {
        *remaining.entry(canonical_json(item)).or_default() += 1;
    }

    let mut unmatched_old = Vec::new();
    for (index, item) in old.iter().enumerate() {
        match remaining.get_mut(&canonical_json(item)) {
            Some(count) if *count > 0 => *count -= 1,
            _ => unmatched_old.push(index),
        }
    }

    for index in unmatched_old {
        changes
            .removed
            .insert(format!("{path}[{index}]"), old[index].clone());
    }

    for (index, item) in new.iter().enumerate() {
        if let Some(count) = remaining.get_mut(&canonical_json(item)) {
            if *count > 0 {
                *count -= 1;
                changes.added.insert(format!("{path}[{index}]"), item.clone());
            }
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
