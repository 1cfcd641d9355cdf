// src/core.rs
//
// =============================================================================
// DATALAB: CORE SCHEMA AUTHORITY
// =============================================================================
//
// The shared vocabulary of the build.
// This file defines the document exchanged between the edit session
// (client model) and the server collaborator that computes rows.
//
// Design Principles:
// 1. Sum Types: a Step is exactly one of datasource | form | computed.
// 2. Wire Shape: `{ "type": "datasource", "datasource": { ... } }`.
// 3. Copy-on-Write: a Build is replaced whole, never patched in place
//    by callers outside this crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A unique display name for a field, shared across the whole build.
pub type Label = String;

/// Opaque primary-key value as reported by the server.
pub type Key = serde_json::Value;

/// Per-step error slot: payload path -> message.
pub type StepErrors = BTreeMap<String, String>;

// ============================================================================
// 1. FIELD TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    Text,
    Number,
    Date,
    Boolean,
    List,
}

impl FieldType {
    /// Infers a type from a sample value (used when importing source rows).
    pub fn infer(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Bool(_) => FieldType::Boolean,
            serde_json::Value::Number(_) => FieldType::Number,
            serde_json::Value::Array(_) => FieldType::List,
            serde_json::Value::String(s) if DateTime::parse_from_rfc3339(s).is_ok() => {
                FieldType::Date
            }
            _ => FieldType::Text,
        }
    }
}

// ============================================================================
// 2. DATASOURCE STEP
// ============================================================================

/// How the user settled a key mismatch for one join.
///
/// `primary`: keys only in the incoming source (`true` = Add, `false` = Drop).
/// `matching`: keys only in the existing build (`true` = Keep, `false` = Ignore).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resolution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matching: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Discrepancies {
    pub values: Resolution,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasourceStep {
    /// Source id in the container.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub primary: Option<String>,
    /// Label of an earlier field this source's primary is joined against.
    #[serde(default)]
    pub matching: Option<Label>,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, Label>,
    #[serde(default)]
    pub types: BTreeMap<String, FieldType>,
    // Wire name keeps the historical spelling.
    #[serde(
        default,
        rename = "discrepencies",
        skip_serializing_if = "Option::is_none"
    )]
    pub discrepancies: Option<Discrepancies>,
}

impl DatasourceStep {
    pub fn label_of(&self, field: &str) -> Label {
        self.labels
            .get(field)
            .cloned()
            .unwrap_or_else(|| field.to_string())
    }
}

// ============================================================================
// 3. FORM STEP
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FormFieldKind {
    Text {
        #[serde(default, rename = "maxLength")]
        max_length: Option<usize>,
    },
    Number {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
        #[serde(default)]
        precision: Option<u32>,
    },
    Date,
    Checkbox,
    List {
        #[serde(default)]
        options: Vec<String>,
        #[serde(default)]
        multiple: bool,
    },
}

impl FormFieldKind {
    pub fn field_type(&self) -> FieldType {
        match self {
            FormFieldKind::Text { .. } => FieldType::Text,
            FormFieldKind::Number { .. } => FieldType::Number,
            FormFieldKind::Date => FieldType::Date,
            FormFieldKind::Checkbox => FieldType::Boolean,
            FormFieldKind::List { .. } => FieldType::List,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormField {
    pub name: String,
    #[serde(flatten)]
    pub kind: FormFieldKind,
}

impl FormField {
    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FormFieldKind::Text { max_length: None },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FormLayout {
    #[default]
    Vertical,
    Table,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebForm {
    #[serde(default)]
    pub active: bool,
    /// Label whose value identifies who may open a record.
    #[serde(default)]
    pub permission: Option<Label>,
    #[serde(default)]
    pub visible_fields: Vec<Label>,
    #[serde(default)]
    pub layout: FormLayout,
    #[serde(default)]
    pub show_all: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FormStep {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub primary: Option<Label>,
    #[serde(default)]
    pub active_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub active_to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fields: Vec<FormField>,
    #[serde(default)]
    pub web_form: WebForm,
}

// ============================================================================
// 4. COMPUTED STEP
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Sum,
    Average,
    Minimum,
    Maximum,
    Count,
    Concat,
}

impl Operation {
    pub fn result_type(&self) -> FieldType {
        match self {
            Operation::Concat => FieldType::Text,
            _ => FieldType::Number,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Formula {
    pub operation: Operation,
    #[serde(default)]
    pub columns: Vec<Label>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComputedField {
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    pub formula: Formula,
}

impl ComputedField {
    pub fn new(name: impl Into<String>, operation: Operation, columns: Vec<Label>) -> Self {
        Self {
            name: name.into(),
            field_type: operation.result_type(),
            formula: Formula { operation, columns },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComputedStep {
    #[serde(default)]
    pub fields: Vec<ComputedField>,
}

// ============================================================================
// 5. THE STEP (Tagged Union)
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Datasource,
    Form,
    Computed,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepKind::Datasource => "datasource",
            StepKind::Form => "form",
            StepKind::Computed => "computed",
        };
        f.write_str(s)
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "datasource" => Ok(StepKind::Datasource),
            "form" => Ok(StepKind::Form),
            "computed" => Ok(StepKind::Computed),
            other => Err(format!("unknown step type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Step {
    Datasource { datasource: DatasourceStep },
    Form { form: FormStep },
    Computed { computed: ComputedStep },
}

impl Step {
    pub fn empty(kind: StepKind) -> Self {
        match kind {
            StepKind::Datasource => Step::Datasource {
                datasource: DatasourceStep::default(),
            },
            StepKind::Form => Step::Form {
                form: FormStep::default(),
            },
            StepKind::Computed => Step::Computed {
                computed: ComputedStep::default(),
            },
        }
    }

    pub fn kind(&self) -> StepKind {
        match self {
            Step::Datasource { .. } => StepKind::Datasource,
            Step::Form { .. } => StepKind::Form,
            Step::Computed { .. } => StepKind::Computed,
        }
    }

    /// Raw field names owned by this step, in declaration order.
    pub fn fields(&self) -> Vec<String> {
        match self {
            Step::Datasource { datasource } => datasource.fields.clone(),
            Step::Form { form } => form.fields.iter().map(|f| f.name.clone()).collect(),
            Step::Computed { computed } => {
                computed.fields.iter().map(|f| f.name.clone()).collect()
            }
        }
    }

    /// Resolves a raw field name to its build-wide label.
    /// Only datasources indirect through `labels`.
    pub fn label_of(&self, field: &str) -> Label {
        match self {
            Step::Datasource { datasource } => datasource.label_of(field),
            Step::Form { .. } | Step::Computed { .. } => field.to_string(),
        }
    }

    pub fn labels(&self) -> Vec<Label> {
        self.fields().iter().map(|f| self.label_of(f)).collect()
    }

    /// Reverse of `label_of` over this step's own fields.
    pub fn field_for_label(&self, label: &str) -> Option<String> {
        self.fields().into_iter().find(|f| self.label_of(f) == label)
    }

    pub fn field_type(&self, field: &str) -> Option<FieldType> {
        match self {
            Step::Datasource { datasource } => datasource.types.get(field).copied(),
            Step::Form { form } => form
                .fields
                .iter()
                .find(|f| f.name == field)
                .map(|f| f.kind.field_type()),
            Step::Computed { computed } => computed
                .fields
                .iter()
                .find(|f| f.name == field)
                .map(|f| f.field_type),
        }
    }

    pub fn as_datasource(&self) -> Option<&DatasourceStep> {
        match self {
            Step::Datasource { datasource } => Some(datasource),
            _ => None,
        }
    }

    pub fn as_datasource_mut(&mut self) -> Option<&mut DatasourceStep> {
        match self {
            Step::Datasource { datasource } => Some(datasource),
            _ => None,
        }
    }

    pub fn as_form(&self) -> Option<&FormStep> {
        match self {
            Step::Form { form } => Some(form),
            _ => None,
        }
    }

    pub fn as_form_mut(&mut self) -> Option<&mut FormStep> {
        match self {
            Step::Form { form } => Some(form),
            _ => None,
        }
    }

    pub fn as_computed_mut(&mut self) -> Option<&mut ComputedStep> {
        match self {
            Step::Computed { computed } => Some(computed),
            _ => None,
        }
    }
}

// ============================================================================
// 6. ORDER & ERRORS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OrderEntry {
    pub step_index: usize,
    pub field: String,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default)]
    pub pinned: bool,
}

fn default_true() -> bool {
    true
}

impl OrderEntry {
    pub fn new(step_index: usize, field: impl Into<String>) -> Self {
        Self {
            step_index,
            field: field.into(),
            visible: true,
            pinned: false,
        }
    }
}

/// Validation state, shaped like the Build so the UI can look errors up by path.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildErrors {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepErrors>,
}

impl BuildErrors {
    pub fn count(&self) -> usize {
        self.name.iter().count()
            + self.order.iter().count()
            + self.steps.iter().map(|s| s.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Flat "path: message" lines, for CLI output and notifications.
    pub fn lines(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(msg) = &self.name {
            out.push(format!("name: {msg}"));
        }
        if let Some(msg) = &self.order {
            out.push(format!("order: {msg}"));
        }
        for (i, step) in self.steps.iter().enumerate() {
            for (path, msg) in step {
                out.push(format!("steps[{i}].{path}: {msg}"));
            }
        }
        out
    }
}

// ============================================================================
// 7. THE BUILD (Aggregate Root)
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Build {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub order: Vec<OrderEntry>,
    #[serde(default)]
    pub errors: BuildErrors,
}

impl Build {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Every label in pipeline order.
    pub fn labels(&self) -> Vec<Label> {
        self.steps.iter().flat_map(|s| s.labels()).collect()
    }

    /// Labels produced by steps strictly before `step_index`.
    pub fn labels_before(&self, step_index: usize) -> Vec<Label> {
        self.steps
            .iter()
            .take(step_index)
            .flat_map(|s| s.labels())
            .collect()
    }

    /// Finds the step and raw field that own `label`.
    pub fn locate_label(&self, label: &str) -> Option<(usize, String)> {
        self.steps
            .iter()
            .enumerate()
            .find_map(|(i, s)| s.field_for_label(label).map(|f| (i, f)))
    }

    /// `(step_index, field)` for every field of every step.
    pub fn field_set(&self) -> BTreeSet<(usize, String)> {
        self.steps
            .iter()
            .enumerate()
            .flat_map(|(i, s)| s.fields().into_iter().map(move |f| (i, f)))
            .collect()
    }

    /// The build as it stood before `step_index` was attached.
    pub fn partial(&self, step_index: usize) -> Build {
        let cut = step_index.min(self.steps.len());
        let mut errors = self.errors.clone();
        errors.steps.truncate(cut);
        Build {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            steps: self.steps[..cut].to_vec(),
            order: self
                .order
                .iter()
                .filter(|e| e.step_index < cut)
                .cloned()
                .collect(),
            errors,
        }
    }
}

// ============================================================================
// 8. SERVER RESULTS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SavedDataLab {
    pub id: Uuid,
    pub name: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Uniqueness {
    pub is_unique: bool,
}
