#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use datalab::config::LabConfig;
use datalab::core::{Build, FieldType, Resolution, SavedDataLab, Step, StepKind, Uniqueness};
use datalab::discrepancy::DiscrepancyReport;
use datalab::session::{Decision, LabSession, Prompter};
use datalab::steps::{self, StepEdit};
use datalab::transport::DataLabServer;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Builds
// ----------------------------------------------------------------------------

pub fn edit(build: &Build, step: usize, e: StepEdit) -> Build {
    steps::update_step_field(build, step, e).expect("edit applies")
}

pub fn add_field(build: &Build, step: usize, field: &str) -> Build {
    edit(
        build,
        step,
        StepEdit::AddField {
            field: field.into(),
            field_type: FieldType::Text,
        },
    )
}

/// Step 0: `students` (sid, name). Step 1: `grades` (student, name, grade),
/// no matching field yet.
pub fn two_sources() -> Build {
    let b = Build::new("Roster");
    let b = steps::add_step(&b, StepKind::Datasource).unwrap();
    let b = edit(&b, 0, StepEdit::SetSource("students".into()));
    let b = edit(&b, 0, StepEdit::SetPrimary("sid".into()));
    let b = add_field(&b, 0, "sid");
    let b = add_field(&b, 0, "name");

    let b = steps::add_step(&b, StepKind::Datasource).unwrap();
    let b = edit(&b, 1, StepEdit::SetSource("grades".into()));
    let b = edit(&b, 1, StepEdit::SetPrimary("student".into()));
    let b = add_field(&b, 1, "student");
    let b = add_field(&b, 1, "name");
    edit(
        &b,
        1,
        StepEdit::AddField {
            field: "grade".into(),
            field_type: FieldType::Number,
        },
    )
}

pub fn datasource(build: &Build, step: usize) -> &datalab::core::DatasourceStep {
    build.steps[step].as_datasource().expect("datasource step")
}

// ----------------------------------------------------------------------------
// Fake server
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeServer {
    pub reports: Mutex<VecDeque<Result<DiscrepancyReport, String>>>,
    pub unique: Mutex<VecDeque<Result<bool, String>>>,
    pub saves: Mutex<Vec<Build>>,
    pub requests: Mutex<Vec<(usize, Step)>>,
}

impl FakeServer {
    pub fn with_reports(reports: Vec<Result<DiscrepancyReport, String>>) -> Arc<Self> {
        Arc::new(Self {
            reports: Mutex::new(reports.into()),
            ..Default::default()
        })
    }

    pub fn push_unique(&self, answer: Result<bool, String>) {
        self.unique.lock().unwrap().push_back(answer);
    }

    pub fn saved(&self) -> Vec<Build> {
        self.saves.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataLabServer for FakeServer {
    async fn check_discrepancies(
        &self,
        partial: &Build,
        candidate: &Step,
    ) -> Result<DiscrepancyReport> {
        self.requests
            .lock()
            .unwrap()
            .push((partial.steps.len(), candidate.clone()));
        match self.reports.lock().unwrap().pop_front() {
            Some(Ok(r)) => Ok(r),
            Some(Err(e)) => Err(anyhow!(e)),
            None => Ok(DiscrepancyReport::default()),
        }
    }

    async fn check_uniqueness(&self, _partial: &Build, _label: &str) -> Result<Uniqueness> {
        match self.unique.lock().unwrap().pop_front() {
            Some(Ok(is_unique)) => Ok(Uniqueness { is_unique }),
            Some(Err(e)) => Err(anyhow!(e)),
            None => Ok(Uniqueness { is_unique: true }),
        }
    }

    async fn save_build(&self, build: &Build) -> Result<SavedDataLab> {
        self.saves.lock().unwrap().push(build.clone());
        Ok(SavedDataLab {
            id: build.id.unwrap_or_else(Uuid::new_v4),
            name: build.name.clone(),
            updated_at: Utc::now(),
        })
    }
}

// ----------------------------------------------------------------------------
// Scripted prompter
// ----------------------------------------------------------------------------

pub struct Scripted {
    pub decision: Decision,
    pub resolution: Option<Resolution>,
    pub prompts: Arc<Mutex<Vec<String>>>,
}

impl Scripted {
    pub fn confirming(resolution: Option<Resolution>) -> Self {
        Self {
            decision: Decision::Confirm,
            resolution,
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn cancelling() -> Self {
        Self {
            decision: Decision::Cancel,
            resolution: None,
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Prompter for Scripted {
    async fn confirm(&self, prompt: &str) -> Decision {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.decision
    }

    async fn reconcile(&self, _step_index: usize, _report: &DiscrepancyReport) -> Option<Resolution> {
        self.resolution
    }
}

pub fn session(
    build: Build,
    server: Arc<FakeServer>,
    prompter: Scripted,
) -> LabSession<Arc<FakeServer>, Scripted> {
    LabSession::open(build, server, prompter, &LabConfig::default())
}
