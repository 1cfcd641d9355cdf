// src/dependency.rs
//
// =============================================================================
// DATALAB: DEPENDENCY TRACKER
// =============================================================================
//
// References only ever point backward in step order: a later step names a
// label produced by an earlier one. A field referenced by a later step cannot
// be renamed or removed until that reference is gone.

use crate::core::{Build, Label, Step};
use crate::error::{LabError, LabResult};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyRole {
    /// Datasource joined on this label.
    Matching,
    /// Form keyed by this label.
    FormPrimary,
    Permission,
    VisibleField,
    /// Computed formula input.
    FormulaColumn,
}

impl fmt::Display for DependencyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DependencyRole::Matching => "matching field",
            DependencyRole::FormPrimary => "form primary key",
            DependencyRole::Permission => "web form permission",
            DependencyRole::VisibleField => "web form visible field",
            DependencyRole::FormulaColumn => "formula column",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependent {
    pub step_index: usize,
    pub role: DependencyRole,
}

/// Every later step that references `field` of `step_index`.
pub fn dependents(build: &Build, step_index: usize, field: &str) -> Vec<Dependent> {
    let Some(owner) = build.steps.get(step_index) else {
        return Vec::new();
    };
    let label = owner.label_of(field);

    let mut out = Vec::new();
    for (i, step) in build.steps.iter().enumerate().skip(step_index + 1) {
        for role in roles_referencing(step, &label) {
            out.push(Dependent {
                step_index: i,
                role,
            });
        }
    }
    out
}

pub fn has_dependency(build: &Build, step_index: usize, field: &str) -> bool {
    !dependents(build, step_index, field).is_empty()
}

/// Rejects with a user-facing error when the field is still referenced.
pub fn ensure_free(build: &Build, step_index: usize, field: &str, action: &str) -> LabResult<()> {
    let deps = dependents(build, step_index, field);
    if let Some(first) = deps.first() {
        let label = build.steps[step_index].label_of(field);
        return Err(LabError::structural(format!(
            "Cannot {action} '{label}': it is used as the {} of step {}. Remove that reference first.",
            first.role,
            first.step_index + 1
        )));
    }
    Ok(())
}

fn roles_referencing(step: &Step, label: &Label) -> Vec<DependencyRole> {
    let mut roles = Vec::new();
    match step {
        Step::Datasource { datasource } => {
            if datasource.matching.as_ref() == Some(label) {
                roles.push(DependencyRole::Matching);
            }
        }
        Step::Form { form } => {
            if form.primary.as_ref() == Some(label) {
                roles.push(DependencyRole::FormPrimary);
            }
            if form.web_form.permission.as_ref() == Some(label) {
                roles.push(DependencyRole::Permission);
            }
            if form.web_form.visible_fields.contains(label) {
                roles.push(DependencyRole::VisibleField);
            }
        }
        Step::Computed { computed } => {
            if computed
                .fields
                .iter()
                .any(|f| f.formula.columns.contains(label))
            {
                roles.push(DependencyRole::FormulaColumn);
            }
        }
    }
    roles
}
