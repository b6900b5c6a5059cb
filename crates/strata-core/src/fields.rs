// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-type field metadata and the generic patch merge.
//!
//! Each document type declares a static table of [`FieldSpec`]s naming the
//! fields that are required at start, fixed after creation, or merged as
//! monotonic counters. Fields not listed are optional, mutable and replaced
//! by a patch.

use serde_json::{Map, Value};
use strata_protocol::document::META_FIELDS;

use crate::error::{CoreError, Result};

/// How a patched value is combined with the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    /// The patched value replaces the current one.
    Replace,
    /// The larger of current and patched wins; negative patched values are
    /// ignored.
    ///
    /// The merge is commutative, idempotent and monotonic, so redelivered or
    /// reordered patches cannot move a counter backward.
    MonotonicMax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub required: bool,
    pub immutable: bool,
    pub merge: MergeRule,
}

impl FieldSpec {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            required: false,
            immutable: false,
            merge: MergeRule::Replace,
        }
    }

    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub const fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    pub const fn monotonic_max(mut self) -> Self {
        self.merge = MergeRule::MonotonicMax;
        self
    }
}

fn lookup<'a>(fields: &'a [FieldSpec], name: &str) -> Option<&'a FieldSpec> {
    fields.iter().find(|f| f.name == name)
}

fn present<'a>(object: &'a Value, name: &str) -> Option<&'a Value> {
    object.get(name).filter(|v| !v.is_null())
}

/// Every required field must be present and non-null.
pub fn validate_required(document: &Value, fields: &[FieldSpec]) -> Result<()> {
    for field in fields.iter().filter(|f| f.required) {
        if present(document, field.name).is_none() {
            return Err(CoreError::validation(format!("{} cannot be null", field.name)));
        }
    }
    Ok(())
}

/// A patch may not set an immutable field to anything but its current value.
pub fn validate_immutable(current: &Value, patch: &Value, fields: &[FieldSpec]) -> Result<()> {
    for field in fields.iter().filter(|f| f.immutable) {
        if let Some(patched) = present(patch, field.name)
            && present(current, field.name) != Some(patched)
        {
            return Err(CoreError::ImmutableFieldViolation {
                field: field.name.to_string(),
            });
        }
    }
    Ok(())
}

/// Counter merge: the larger value wins, negative patches keep the current
/// value.
pub fn merge_max(current: Option<i64>, patched: i64) -> Option<i64> {
    if patched < 0 {
        return current;
    }
    Some(current.map_or(patched, |c| c.max(patched)))
}

/// Apply the non-null top-level fields of `patch` to `current`.
///
/// Host-owned metadata fields in the patch are ignored.
pub fn merge_patch(current: &mut Value, patch: &Value, fields: &[FieldSpec]) -> Result<()> {
    let Some(patch) = patch.as_object() else {
        return Err(CoreError::BadRequest("patch body must be an object".to_string()));
    };
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    let Some(target) = current.as_object_mut() else {
        return Ok(());
    };

    for (name, value) in patch {
        if value.is_null() || META_FIELDS.contains(&name.as_str()) {
            continue;
        }
        let rule = lookup(fields, name).map_or(MergeRule::Replace, |f| f.merge);
        match rule {
            MergeRule::Replace => {
                target.insert(name.clone(), value.clone());
            }
            MergeRule::MonotonicMax => {
                let patched = value.as_i64().ok_or_else(|| {
                    CoreError::validation(format!("{} must be an integer", name))
                })?;
                let existing = target.get(name).and_then(Value::as_i64);
                match merge_max(existing, patched) {
                    Some(merged) => {
                        target.insert(name.clone(), Value::from(merged));
                    }
                    None => {
                        target.remove(name);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Drop host-owned metadata fields from a producer-supplied body.
pub fn strip_meta(body: &Value) -> Value {
    match body.as_object() {
        Some(object) => Value::Object(
            object
                .iter()
                .filter(|(k, _)| !META_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        None => body.clone(),
    }
}
