// src/order.rs
//
// =============================================================================
// DATALAB: ORDER / VISIBILITY STORE
// =============================================================================
//
// A projection over the union of all step fields, decoupled from pipeline
// order. It is the only place column position, visibility and pinning live.
//
// Invariant: the set of `(step_index, field)` in `order` equals
// `Build::field_set()` after every public operation.

use crate::core::{Build, Label, OrderEntry};
use crate::error::{LabError, LabResult};
use std::collections::BTreeSet;

/// A column as the table renderer sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub step_index: usize,
    pub field: String,
    pub label: Label,
    pub pinned: bool,
}

// ============================================================================
// 1. USER OPERATIONS
// ============================================================================

pub fn move_field(build: &Build, from: usize, to: usize) -> LabResult<Build> {
    let len = build.order.len();
    if from >= len || to >= len {
        return Err(LabError::structural(format!(
            "Cannot move column {from} to {to}: only {len} columns exist"
        )));
    }
    let mut next = build.clone();
    let entry = next.order.remove(from);
    next.order.insert(to, entry);
    Ok(next)
}

pub fn set_visible(build: &Build, label: &str, visible: bool) -> LabResult<Build> {
    update_entry(build, label, |e| e.visible = visible)
}

pub fn set_pinned(build: &Build, label: &str, pinned: bool) -> LabResult<Build> {
    update_entry(build, label, |e| e.pinned = pinned)
}

fn update_entry(build: &Build, label: &str, f: impl FnOnce(&mut OrderEntry)) -> LabResult<Build> {
    let (step_index, field) = build
        .locate_label(label)
        .ok_or_else(|| LabError::structural(format!("Unknown field '{label}'")))?;
    let mut next = build.clone();
    let entry = next
        .order
        .iter_mut()
        .find(|e| e.step_index == step_index && e.field == field)
        .ok_or_else(|| LabError::structural(format!("Field '{label}' is missing from order")))?;
    f(entry);
    Ok(next)
}

// ============================================================================
// 2. QUERIES
// ============================================================================

/// Visible columns, pinned first, otherwise in `order` sequence.
pub fn columns(build: &Build) -> Vec<Column> {
    let visible = build.order.iter().filter(|e| e.visible).filter_map(|e| {
        build.steps.get(e.step_index).map(|s| Column {
            step_index: e.step_index,
            field: e.field.clone(),
            label: s.label_of(&e.field),
            pinned: e.pinned,
        })
    });
    let (mut pinned, rest): (Vec<Column>, Vec<Column>) = visible.partition(|c| c.pinned);
    pinned.extend(rest);
    pinned
}

pub fn is_consistent(build: &Build) -> bool {
    let ordered: Vec<(usize, String)> = build
        .order
        .iter()
        .map(|e| (e.step_index, e.field.clone()))
        .collect();
    let unique: BTreeSet<(usize, String)> = ordered.iter().cloned().collect();
    unique.len() == ordered.len() && unique == build.field_set()
}

/// Repairs `order` for documents loaded from outside the session:
/// drops orphans and duplicates, appends missing fields with defaults.
pub fn sync(build: &Build) -> Build {
    let mut next = build.clone();
    let expected = build.field_set();
    let mut seen = BTreeSet::new();
    next.order.retain(|e| {
        let key = (e.step_index, e.field.clone());
        expected.contains(&key) && seen.insert(key)
    });
    for (i, step) in build.steps.iter().enumerate() {
        for field in step.fields() {
            if !seen.contains(&(i, field.clone())) {
                next.order.push(OrderEntry::new(i, field));
            }
        }
    }
    next
}

// ============================================================================
// 3. TRANSACTION HELPERS (used by step mutations on their working copy)
// ============================================================================

pub(crate) fn insert_entry(build: &mut Build, step_index: usize, field: &str) {
    let exists = build
        .order
        .iter()
        .any(|e| e.step_index == step_index && e.field == field);
    if !exists {
        build.order.push(OrderEntry::new(step_index, field));
    }
}

pub(crate) fn remove_entry(build: &mut Build, step_index: usize, field: &str) {
    build
        .order
        .retain(|e| !(e.step_index == step_index && e.field == field));
}

pub(crate) fn rename_entry(build: &mut Build, step_index: usize, from: &str, to: &str) {
    for e in build.order.iter_mut() {
        if e.step_index == step_index && e.field == from {
            e.field = to.to_string();
        }
    }
}

pub(crate) fn remove_step_entries(build: &mut Build, step_index: usize) {
    build.order.retain(|e| e.step_index != step_index);
}
