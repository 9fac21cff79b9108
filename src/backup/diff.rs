use bon::Builder;
use derive_more::Display;
use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug, Display, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    #[display("added")]
    Added,
    #[display("removed")]
    Removed,
    #[display("changed")]
    Changed,
}

/// One difference between two configuration trees, keyed by dotted path.
#[skip_serializing_none]
#[derive(Clone, Debug, Builder, Getters, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct DiffEntry {
    #[builder(into)]
    key_path: String,
    change_kind: ChangeKind,
    #[builder(into)]
    old_value: Option<Value>,
    #[builder(into)]
    new_value: Option<Value>,
}

/// Compares two parsed configuration trees. Object keys are walked in
/// sorted order so the same inputs always produce the same entry order.
/// A key present on only one side is reported once at its subtree root,
/// scalars and arrays that differ become a single `Changed` entry.
pub fn diff_trees(old: &Value, new: &Value) -> Vec<DiffEntry> {
    let mut entries = Vec::new();
    walk(String::new(), Some(old), Some(new), &mut entries);
    entries
}

fn walk(path: String, old: Option<&Value>, new: Option<&Value>, entries: &mut Vec<DiffEntry>) {
    match (old, new) {
        (Some(old), None) => entries.push(
            DiffEntry::builder()
                .key_path(path)
                .change_kind(ChangeKind::Removed)
                .old_value(old.clone())
                .build(),
        ),
        (None, Some(new)) => entries.push(
            DiffEntry::builder()
                .key_path(path)
                .change_kind(ChangeKind::Added)
                .new_value(new.clone())
                .build(),
        ),
        (Some(Value::Object(old)), Some(Value::Object(new))) => {
            let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
            for key in keys {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                walk(child, old.get(key), new.get(key), entries);
            }
        }
        (Some(old), Some(new)) => {
            if old != new {
                entries.push(
                    DiffEntry::builder()
                        .key_path(path)
                        .change_kind(ChangeKind::Changed)
                        .old_value(old.clone())
                        .new_value(new.clone())
                        .build(),
                );
            }
        }
        (None, None) => (),
    }
}
