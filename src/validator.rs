// src/validator.rs
//
// =============================================================================
// DATALAB: BUILD VALIDATOR
// =============================================================================
//
// Completeness checks run once per transaction and again at save time.
// Problems are collected, not thrown: the result has the same shape as
// `Build::errors` so the UI renders per-field indicators from one tree.

use crate::core::{Build, BuildErrors, Label, Step, StepErrors, StepKind};
use crate::order;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: BuildErrors,
}

pub fn validate(build: &Build) -> ValidationReport {
    let mut errors = BuildErrors::default();

    if build.name.trim().is_empty() {
        errors.name = Some("Name is required".into());
    }
    if !order::is_consistent(build) {
        errors.order = Some("Column order is out of sync with the modules".into());
    }

    for (i, step) in build.steps.iter().enumerate() {
        errors.steps.push(validate_step(build, i, step));
    }

    ValidationReport {
        is_valid: errors.is_empty(),
        errors,
    }
}

/// Returns the build with its `errors` tree refreshed.
pub fn with_errors(build: Build) -> Build {
    let errors = validate(&build).errors;
    Build { errors, ..build }
}

fn validate_step(build: &Build, index: usize, step: &Step) -> StepErrors {
    let mut errs = StepErrors::new();
    let earlier = build.labels_before(index);
    let resolves = |label: &str| earlier.iter().any(|l| l == label);

    if index == 0 && step.kind() != StepKind::Datasource {
        errs.insert("type".into(), "The first module must be a datasource".into());
    }

    let taken = duplicate_labels(&earlier, step);
    if !taken.is_empty() {
        let path = match step.kind() {
            StepKind::Datasource => "datasource.labels",
            StepKind::Form => "form.fields",
            StepKind::Computed => "computed.fields",
        };
        let quoted: Vec<String> = taken.iter().map(|l| format!("'{l}'")).collect();
        errs.insert(
            path.into(),
            format!("Already used by another field: {}", quoted.join(", ")),
        );
    }

    match step {
        Step::Datasource { datasource } => {
            if datasource.id.as_deref().map_or(true, |s| s.trim().is_empty()) {
                errs.insert("datasource.id".into(), "Datasource is required".into());
            }
            if datasource.primary.is_none() {
                errs.insert("datasource.primary".into(), "Primary key is required".into());
            }
            if datasource.fields.is_empty() {
                errs.insert(
                    "datasource.fields".into(),
                    "At least one field must be added".into(),
                );
            }
            if index > 0 {
                match &datasource.matching {
                    None => {
                        errs.insert(
                            "datasource.matching".into(),
                            "Matching field is required".into(),
                        );
                    }
                    Some(label) if !resolves(label) => {
                        errs.insert(
                            "datasource.matching".into(),
                            format!("'{label}' is not produced by an earlier module"),
                        );
                    }
                    Some(_) => {}
                }
            }
        }
        Step::Form { form } => {
            match &form.primary {
                None => {
                    errs.insert("form.primary".into(), "Primary key is required".into());
                }
                Some(label) if !resolves(label) => {
                    errs.insert(
                        "form.primary".into(),
                        format!("'{label}' is not produced by an earlier module"),
                    );
                }
                Some(_) => {}
            }
            if form.name.trim().is_empty() {
                errs.insert("form.name".into(), "Name is required".into());
            }
            if form.fields.is_empty() {
                errs.insert("form.fields".into(), "At least one field must be added".into());
            }
            if let (Some(from), Some(to)) = (form.active_from, form.active_to) {
                if to < from {
                    errs.insert(
                        "form.activeTo".into(),
                        "Active to date must be after the active from date".into(),
                    );
                }
            }
            for (j, field) in form.fields.iter().enumerate() {
                if let crate::core::FormFieldKind::List { options, .. } = &field.kind {
                    if options.is_empty() {
                        errs.insert(
                            format!("form.fields.{j}.options"),
                            "At least one option is required".into(),
                        );
                    }
                }
            }
        }
        Step::Computed { computed } => {
            if computed.fields.is_empty() {
                errs.insert(
                    "computed.fields".into(),
                    "At least one field must be added".into(),
                );
            }
            for (j, field) in computed.fields.iter().enumerate() {
                if field.name.trim().is_empty() {
                    errs.insert(format!("computed.fields.{j}.name"), "Name is required".into());
                }
                if field.formula.columns.is_empty() {
                    errs.insert(
                        format!("computed.fields.{j}.formula"),
                        "At least one column is required".into(),
                    );
                } else if let Some(bad) = field.formula.columns.iter().find(|c| !resolves(c)) {
                    errs.insert(
                        format!("computed.fields.{j}.formula"),
                        format!("'{bad}' is not produced by an earlier module"),
                    );
                }
            }
        }
    }

    errs
}

/// Labels of `step` that an earlier module, or the step itself, already uses.
fn duplicate_labels(earlier: &[Label], step: &Step) -> Vec<Label> {
    let own = step.labels();
    let mut seen: HashSet<&str> = earlier.iter().map(String::as_str).collect();
    let mut taken: Vec<Label> = Vec::new();
    for label in &own {
        if !seen.insert(label.as_str()) && !taken.contains(label) {
            taken.push(label.clone());
        }
    }
    taken
}
