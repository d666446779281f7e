//! Typed mutation history for transaction records.
//!
//! The first entry is always a full snapshot of the record at creation;
//! every later entry is a list of field-level operations against the
//! record's json form (the `history` field itself is excluded). Replaying
//! the entries in order against the snapshot reproduces the live record.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::TellerError;
use crate::transaction::TransactionRecord;

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize, PartialEq)]
#[serde(tag = "entry", rename_all = "lowercase")]
pub enum HistoryEntry {
    Snapshot {
        time: DateTime<Utc>,
        record: Box<TransactionRecord>,
    },
    Diff {
        time: DateTime<Utc>,
        /// Caller annotation naming the mutation site.
        note: Option<String>,
        ops: Vec<HistoryOp>,
    },
}

#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HistoryOpKind {
    Add,
    Replace,
    Remove,
}

/// A single field-level change, addressed by json pointer.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize, PartialEq)]
pub struct HistoryOp {
    pub op: HistoryOpKind,
    pub path: String,
    pub value: Option<Value>,
}

/// Json form of a record with the history field stripped; the base both
/// diffs and replays operate on.
pub(crate) fn snapshot_value(record: &TransactionRecord) -> Result<Value, TellerError> {
    let mut value = serde_json::to_value(record)
        .map_err(|err| TellerError::HistoryReplay(err.to_string()))?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("history");
    }
    Ok(value)
}

pub(crate) fn snapshot_entry(record: &TransactionRecord) -> HistoryEntry {
    let mut flat = record.clone();
    flat.history = Vec::new();
    HistoryEntry::Snapshot {
        time: Utc::now(),
        record: Box::new(flat),
    }
}

pub(crate) fn diff_entry(
    base: &Value,
    next: &Value,
    note: Option<String>,
) -> Option<HistoryEntry> {
    let ops = diff_values(base, next);
    if ops.is_empty() {
        return None;
    }
    Some(HistoryEntry::Diff {
        time: Utc::now(),
        note,
        ops,
    })
}

/// Field-level difference between two json objects. Objects are walked
/// recursively; arrays and scalars are replaced wholesale, which keeps
/// replay exhaustive without index arithmetic.
pub(crate) fn diff_values(base: &Value, next: &Value) -> Vec<HistoryOp> {
    let mut ops = Vec::new();
    diff_into(base, next, "", &mut ops);
    ops
}

fn diff_into(base: &Value, next: &Value, path: &str, ops: &mut Vec<HistoryOp>) {
    match (base, next) {
        (Value::Object(a), Value::Object(b)) => {
            for key in a.keys() {
                if !b.contains_key(key) {
                    ops.push(HistoryOp {
                        op: HistoryOpKind::Remove,
                        path: format!("{path}/{key}"),
                        value: None,
                    });
                }
            }
            for (key, next_child) in b {
                let child_path = format!("{path}/{key}");
                match a.get(key) {
                    Some(base_child) if base_child == next_child => {}
                    Some(base_child) => diff_into(base_child, next_child, &child_path, ops),
                    None => ops.push(HistoryOp {
                        op: HistoryOpKind::Add,
                        path: child_path,
                        value: Some(next_child.clone()),
                    }),
                }
            }
        }
        _ => {
            if base != next {
                ops.push(HistoryOp {
                    op: HistoryOpKind::Replace,
                    path: path.to_string(),
                    value: Some(next.clone()),
                });
            }
        }
    }
}

pub(crate) fn apply_ops(root: &mut Value, ops: &[HistoryOp]) -> Result<(), TellerError> {
    for op in ops {
        let (parent_path, key) = split_pointer(&op.path)?;
        let parent = root
            .pointer_mut(parent_path)
            .ok_or_else(|| TellerError::HistoryReplay(format!("missing path {}", op.path)))?;
        let object = parent.as_object_mut().ok_or_else(|| {
            TellerError::HistoryReplay(format!("path {parent_path} is not an object"))
        })?;
        match op.op {
            HistoryOpKind::Add | HistoryOpKind::Replace => {
                let value = op.value.clone().ok_or_else(|| {
                    TellerError::HistoryReplay(format!("op at {} has no value", op.path))
                })?;
                object.insert(key.to_string(), value);
            }
            HistoryOpKind::Remove => {
                object.remove(key);
            }
        }
    }
    Ok(())
}

fn split_pointer(path: &str) -> Result<(&str, &str), TellerError> {
    path.rsplit_once('/')
        .ok_or_else(|| TellerError::HistoryReplay(format!("malformed path {path}")))
}

/// Rebuild a record from its history. The round-trip law requires the
/// result to equal the live record, history excluded.
pub(crate) fn replay(history: &[HistoryEntry]) -> Result<TransactionRecord, TellerError> {
    let mut entries = history.iter();
    let mut value = match entries.next() {
        Some(HistoryEntry::Snapshot { record, .. }) => snapshot_value(record)?,
        _ => {
            return Err(TellerError::HistoryReplay(
                "history must begin with a snapshot".to_string(),
            ))
        }
    };
    for entry in entries {
        match entry {
            HistoryEntry::Diff { ops, .. } => apply_ops(&mut value, ops)?,
            HistoryEntry::Snapshot { .. } => {
                return Err(TellerError::HistoryReplay(
                    "unexpected snapshot after the first entry".to_string(),
                ))
            }
        }
    }
    serde_json::from_value(value).map_err(|err| TellerError::HistoryReplay(err.to_string()))
}
