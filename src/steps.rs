// src/steps.rs
//
// =============================================================================
// DATALAB: STEP MODEL (Mutations)
// =============================================================================
//
// All mutations are copy-on-write: they borrow the current Build and return
// its successor, or a structural error with the original left untouched.
//
// Rules enforced here:
// 1. Anchor: step 0 is a datasource.
// 2. Tail discipline: only the last step can be removed.
// 3. Label namespace: every field gets a unique label.
// 4. Order sync: adding/removing a field adds/removes its order entry.
// 5. Dependency gate: referenced labels cannot be renamed or removed.

use crate::core::{
    Build, ComputedField, DatasourceStep, FieldType, FormField, FormLayout, FormStep, Label,
    Step, StepErrors, StepKind,
};
use crate::dependency::ensure_free;
use crate::error::{LabError, LabResult};
use crate::labels::LabelNamespace;
use crate::order;
use chrono::{DateTime, Utc};

// ============================================================================
// 1. EDITS (typed `path = value` pairs)
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum StepEdit {
    // --- datasource ---
    SetSource(String),
    SetPrimary(String),
    SetMatching(Option<Label>),
    AddField { field: String, field_type: FieldType },
    RemoveField(String),
    RenameLabel { field: String, label: Label },
    SetFieldType { field: String, field_type: FieldType },

    // --- form ---
    SetFormName(String),
    SetFormPrimary(Option<Label>),
    SetActiveFrom(Option<DateTime<Utc>>),
    SetActiveTo(Option<DateTime<Utc>>),
    AddFormField(FormField),
    UpdateFormField { name: String, field: FormField },
    RemoveFormField(String),
    SetWebFormActive(bool),
    SetPermission(Option<Label>),
    SetVisibleFields(Vec<Label>),
    SetLayout(FormLayout),
    SetShowAll(bool),

    // --- computed ---
    AddComputedField(ComputedField),
    UpdateComputedField { name: String, field: ComputedField },
    RemoveComputedField(String),
}

impl StepEdit {
    /// The prompt to show before applying a destructive edit, if any.
    pub fn confirmation(&self, build: &Build, step_index: usize) -> Option<String> {
        let step = build.steps.get(step_index)?;
        match self {
            StepEdit::SetSource(id) => {
                let ds = step.as_datasource()?;
                if ds.fields.is_empty() || ds.id.as_deref() == Some(id.as_str()) {
                    None
                } else {
                    Some(format!(
                        "Changing the source of step {} clears its {} selected field(s). Continue?",
                        step_index + 1,
                        ds.fields.len()
                    ))
                }
            }
            StepEdit::RemoveField(f)
            | StepEdit::RemoveFormField(f)
            | StepEdit::RemoveComputedField(f) => Some(format!(
                "Remove '{}' from the DataLab?",
                step.label_of(f)
            )),
            StepEdit::RenameLabel { field, label } => {
                let current = step.label_of(field);
                (current != *label).then(|| format!("Rename '{current}' to '{label}'?"))
            }
            StepEdit::UpdateFormField { name, field } if field.name != *name => {
                Some(format!("Rename '{name}' to '{}'?", field.name))
            }
            StepEdit::UpdateComputedField { name, field } if field.name != *name => {
                Some(format!("Rename '{name}' to '{}'?", field.name))
            }
            _ => None,
        }
    }
}

// ============================================================================
// 2. PIPELINE SHAPE
// ============================================================================

pub fn add_step(build: &Build, kind: StepKind) -> LabResult<Build> {
    if build.steps.is_empty() && kind != StepKind::Datasource {
        return Err(LabError::structural(format!(
            "The first module of a DataLab must be a datasource, not a {kind}"
        )));
    }
    let mut next = build.clone();
    next.steps.push(Step::empty(kind));
    next.errors.steps.resize(next.steps.len(), StepErrors::new());
    Ok(next)
}

/// Removes the tail step. Nothing can depend on it, since references only
/// point backward.
pub fn remove_last_step(build: &Build) -> LabResult<Build> {
    let last = build
        .steps
        .len()
        .checked_sub(1)
        .ok_or_else(|| LabError::structural("There is no module to remove"))?;
    let mut next = build.clone();
    next.steps.truncate(last);
    order::remove_step_entries(&mut next, last);
    next.errors.steps.truncate(last);
    Ok(next)
}

// ============================================================================
// 3. STEP EDITS
// ============================================================================

pub fn update_step_field(build: &Build, step_index: usize, edit: StepEdit) -> LabResult<Build> {
    let step = build.steps.get(step_index).ok_or_else(|| {
        LabError::structural(format!("Module {} does not exist", step_index + 1))
    })?;
    let mut next = build.clone();

    match edit {
        StepEdit::SetSource(id) => {
            let ds = expect_datasource(step, step_index)?;
            if ds.id.as_deref() == Some(id.as_str()) {
                return Ok(next);
            }
            for field in &ds.fields {
                ensure_free(build, step_index, field, "replace the source of")?;
            }
            next.steps[step_index] = Step::Datasource {
                datasource: DatasourceStep {
                    id: Some(id),
                    ..Default::default()
                },
            };
            order::remove_step_entries(&mut next, step_index);
        }
        StepEdit::SetPrimary(field) => {
            let ds = datasource_mut(&mut next, step_index)?;
            if ds.primary.as_deref() != Some(field.as_str()) {
                ds.primary = Some(field);
                ds.discrepancies = None;
            }
        }
        StepEdit::SetMatching(matching) => {
            expect_datasource(step, step_index)?;
            if let Some(label) = &matching {
                if step_index == 0 {
                    return Err(LabError::structural(
                        "The first datasource anchors the DataLab and has no matching field",
                    ));
                }
                ensure_earlier(build, step_index, label, "matching field")?;
            }
            let ds = datasource_mut(&mut next, step_index)?;
            if ds.matching != matching {
                ds.matching = matching;
                ds.discrepancies = None;
            }
        }
        StepEdit::AddField { field, field_type } => {
            let ds = expect_datasource(step, step_index)?;
            if ds.fields.contains(&field) {
                return Ok(next);
            }
            let label = LabelNamespace::of(build).reserve(&field);
            let ds = datasource_mut(&mut next, step_index)?;
            ds.fields.push(field.clone());
            ds.labels.insert(field.clone(), label);
            ds.types.insert(field.clone(), field_type);
            order::insert_entry(&mut next, step_index, &field);
        }
        StepEdit::RemoveField(field) => {
            let ds = expect_datasource(step, step_index)?;
            if !ds.fields.contains(&field) {
                return Err(unknown_field(&field, step_index));
            }
            ensure_free(build, step_index, &field, "remove")?;
            let ds = datasource_mut(&mut next, step_index)?;
            ds.fields.retain(|f| *f != field);
            ds.labels.remove(&field);
            ds.types.remove(&field);
            order::remove_entry(&mut next, step_index, &field);
        }
        StepEdit::RenameLabel { field, label } => {
            let ds = expect_datasource(step, step_index)?;
            if !ds.fields.contains(&field) {
                return Err(unknown_field(&field, step_index));
            }
            let label = non_empty(&label, "Label")?;
            if ds.label_of(&field) == label {
                return Ok(next);
            }
            ensure_free(build, step_index, &field, "rename")?;
            ensure_unclaimed(&LabelNamespace::excluding(build, step_index, &field), &label)?;
            datasource_mut(&mut next, step_index)?
                .labels
                .insert(field, label);
        }
        StepEdit::SetFieldType { field, field_type } => {
            let ds = datasource_mut(&mut next, step_index)?;
            if !ds.fields.contains(&field) {
                return Err(unknown_field(&field, step_index));
            }
            ds.types.insert(field, field_type);
        }

        StepEdit::SetFormName(name) => form_mut(&mut next, step_index)?.name = name,
        StepEdit::SetFormPrimary(primary) => {
            expect_form(step, step_index)?;
            if let Some(label) = &primary {
                ensure_earlier(build, step_index, label, "primary key")?;
            }
            form_mut(&mut next, step_index)?.primary = primary;
        }
        StepEdit::SetActiveFrom(at) => form_mut(&mut next, step_index)?.active_from = at,
        StepEdit::SetActiveTo(at) => form_mut(&mut next, step_index)?.active_to = at,
        StepEdit::AddFormField(field) => {
            expect_form(step, step_index)?;
            let name = non_empty(&field.name, "Field name")?;
            ensure_unclaimed(&LabelNamespace::of(build), &name)?;
            form_mut(&mut next, step_index)?.fields.push(FormField { name: name.clone(), ..field });
            order::insert_entry(&mut next, step_index, &name);
        }
        StepEdit::UpdateFormField { name, field } => {
            let form = expect_form(step, step_index)?;
            let pos = form
                .fields
                .iter()
                .position(|f| f.name == name)
                .ok_or_else(|| unknown_field(&name, step_index))?;
            let new_name = non_empty(&field.name, "Field name")?;
            if new_name != name {
                ensure_free(build, step_index, &name, "rename")?;
                ensure_unclaimed(&LabelNamespace::excluding(build, step_index, &name), &new_name)?;
                order::rename_entry(&mut next, step_index, &name, &new_name);
            }
            form_mut(&mut next, step_index)?.fields[pos] = FormField { name: new_name, ..field };
        }
        StepEdit::RemoveFormField(name) => {
            let form = expect_form(step, step_index)?;
            if !form.fields.iter().any(|f| f.name == name) {
                return Err(unknown_field(&name, step_index));
            }
            ensure_free(build, step_index, &name, "remove")?;
            form_mut(&mut next, step_index)?.fields.retain(|f| f.name != name);
            order::remove_entry(&mut next, step_index, &name);
        }
        StepEdit::SetWebFormActive(active) => form_mut(&mut next, step_index)?.web_form.active = active,
        StepEdit::SetPermission(permission) => {
            expect_form(step, step_index)?;
            if let Some(label) = &permission {
                ensure_earlier(build, step_index, label, "permission field")?;
            }
            form_mut(&mut next, step_index)?.web_form.permission = permission;
        }
        StepEdit::SetVisibleFields(labels) => {
            expect_form(step, step_index)?;
            for label in &labels {
                ensure_earlier(build, step_index, label, "visible field")?;
            }
            form_mut(&mut next, step_index)?.web_form.visible_fields = labels;
        }
        StepEdit::SetLayout(layout) => form_mut(&mut next, step_index)?.web_form.layout = layout,
        StepEdit::SetShowAll(show) => form_mut(&mut next, step_index)?.web_form.show_all = show,

        StepEdit::AddComputedField(field) => {
            expect_kind(step, step_index, StepKind::Computed)?;
            let name = non_empty(&field.name, "Field name")?;
            ensure_unclaimed(&LabelNamespace::of(build), &name)?;
            for column in &field.formula.columns {
                ensure_earlier(build, step_index, column, "formula column")?;
            }
            computed_mut(&mut next, step_index)?
                .fields
                .push(ComputedField { name: name.clone(), ..field });
            order::insert_entry(&mut next, step_index, &name);
        }
        StepEdit::UpdateComputedField { name, field } => {
            expect_kind(step, step_index, StepKind::Computed)?;
            if !step.fields().contains(&name) {
                return Err(unknown_field(&name, step_index));
            }
            let new_name = non_empty(&field.name, "Field name")?;
            for column in &field.formula.columns {
                ensure_earlier(build, step_index, column, "formula column")?;
            }
            if new_name != name {
                ensure_free(build, step_index, &name, "rename")?;
                ensure_unclaimed(&LabelNamespace::excluding(build, step_index, &name), &new_name)?;
                order::rename_entry(&mut next, step_index, &name, &new_name);
            }
            let computed = computed_mut(&mut next, step_index)?;
            if let Some(slot) = computed.fields.iter_mut().find(|f| f.name == name) {
                *slot = ComputedField { name: new_name, ..field };
            }
        }
        StepEdit::RemoveComputedField(name) => {
            expect_kind(step, step_index, StepKind::Computed)?;
            if !step.fields().contains(&name) {
                return Err(unknown_field(&name, step_index));
            }
            ensure_free(build, step_index, &name, "remove")?;
            computed_mut(&mut next, step_index)?.fields.retain(|f| f.name != name);
            order::remove_entry(&mut next, step_index, &name);
        }
    }

    Ok(next)
}

// ============================================================================
// 4. HELPERS
// ============================================================================

fn expect_kind(step: &Step, step_index: usize, kind: StepKind) -> LabResult<()> {
    if step.kind() != kind {
        return Err(LabError::structural(format!(
            "Module {} is a {}, not a {kind}",
            step_index + 1,
            step.kind()
        )));
    }
    Ok(())
}

fn expect_datasource(step: &Step, step_index: usize) -> LabResult<&DatasourceStep> {
    expect_kind(step, step_index, StepKind::Datasource)?;
    step.as_datasource()
        .ok_or_else(|| LabError::structural("datasource payload missing"))
}

fn expect_form(step: &Step, step_index: usize) -> LabResult<&FormStep> {
    expect_kind(step, step_index, StepKind::Form)?;
    step.as_form()
        .ok_or_else(|| LabError::structural("form payload missing"))
}

fn datasource_mut(build: &mut Build, step_index: usize) -> LabResult<&mut DatasourceStep> {
    let step = &mut build.steps[step_index];
    expect_kind(step, step_index, StepKind::Datasource)?;
    step.as_datasource_mut()
        .ok_or_else(|| LabError::structural("datasource payload missing"))
}

fn form_mut(build: &mut Build, step_index: usize) -> LabResult<&mut FormStep> {
    let step = &mut build.steps[step_index];
    expect_kind(step, step_index, StepKind::Form)?;
    step.as_form_mut()
        .ok_or_else(|| LabError::structural("form payload missing"))
}

fn computed_mut(build: &mut Build, step_index: usize) -> LabResult<&mut crate::core::ComputedStep> {
    let step = &mut build.steps[step_index];
    expect_kind(step, step_index, StepKind::Computed)?;
    step.as_computed_mut()
        .ok_or_else(|| LabError::structural("computed payload missing"))
}

/// References must point at labels produced by earlier steps.
fn ensure_earlier(build: &Build, step_index: usize, label: &str, role: &str) -> LabResult<()> {
    if !build.labels_before(step_index).iter().any(|l| l == label) {
        return Err(LabError::structural(format!(
            "'{label}' cannot be used as the {role} of module {}: it is not produced by an earlier module",
            step_index + 1
        )));
    }
    Ok(())
}

fn ensure_unclaimed(ns: &LabelNamespace, label: &str) -> LabResult<()> {
    if ns.is_used(label) {
        return Err(LabError::structural(format!(
            "A field named '{label}' already exists in this DataLab (try '{}')",
            ns.reserve(label)
        )));
    }
    Ok(())
}

fn non_empty(value: &str, what: &str) -> LabResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LabError::structural(format!("{what} must not be empty")));
    }
    Ok(trimmed.to_string())
}

fn unknown_field(field: &str, step_index: usize) -> LabError {
    LabError::structural(format!(
        "Module {} has no field '{field}'",
        step_index + 1
    ))
}
