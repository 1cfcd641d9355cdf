// src/matching.rs
//
// =============================================================================
// DATALAB: JOIN / MATCHING RESOLVER
// =============================================================================
//
// Associates each non-first step with a key already present in the build.
// The client never joins rows itself; it asks the server to validate the key
// sets a choice implies.
//
// Protocol:
// 1. `begin_*` stores the choice optimistically and returns a tagged request.
// 2. The caller sends the request to the server.
// 3. `complete_*` accepts the response only if its tag is still current.
//
// At most one check is in flight per step. A newer choice replaces the older
// entry, so the older response no longer matches and is discarded.

use crate::core::{Build, Label, Step, StepKind, Uniqueness};
use crate::discrepancy::DiscrepancyReport;
use crate::error::{LabError, LabResult};
use crate::fingerprint;
use crate::steps::{self, StepEdit};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// 1. REQUESTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTag {
    pub step_index: usize,
    pub choice: Label,
    /// Hash of the step's join-relevant state at request time.
    pub fingerprint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    /// A new matching field for a datasource.
    Matching,
    /// "Manage discrepancies": re-run for an already settled matching field.
    Recheck,
    /// A form primary key.
    Uniqueness,
}

/// Scope: the build up to (not including) the step, plus the step itself.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscrepancyRequest {
    pub tag: RequestTag,
    pub partial: Build,
    pub candidate: Step,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UniquenessRequest {
    pub tag: RequestTag,
    pub partial: Build,
    pub label: Label,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// Key sets agree; the choice is final.
    Settled,
    /// Mismatches found; the reconciler must run before the choice settles.
    NeedsResolution(DiscrepancyReport),
    /// Uniqueness failed; the prior choice has been restored.
    Rejected(Build),
    /// A newer request or edit superseded this one. Nothing changed.
    Stale,
}

#[derive(Debug, Clone)]
struct Pending {
    tag: RequestTag,
    kind: CheckKind,
    /// The step as it was before the optimistic write.
    previous: Step,
    /// Mismatches received for this request, awaiting reconciliation.
    report: Option<DiscrepancyReport>,
}

/// Labels a step may join against.
pub fn matching_candidates(build: &Build, step_index: usize) -> Vec<Label> {
    build.labels_before(step_index)
}

// ============================================================================
// 2. THE RESOLVER
// ============================================================================

#[derive(Debug, Default)]
pub struct MatchingResolver {
    inflight: HashMap<usize, Pending>,
}

impl MatchingResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self, step_index: usize) -> Option<&RequestTag> {
        self.inflight.get(&step_index).map(|p| &p.tag)
    }

    pub fn kind_of(&self, step_index: usize) -> Option<CheckKind> {
        self.inflight.get(&step_index).map(|p| p.kind)
    }

    /// Drops every in-flight check (navigation away).
    pub fn clear(&mut self) {
        self.inflight.clear();
    }

    /// A response is current only if its tag is the registered one and the
    /// step still holds the state the request was built from.
    pub fn is_current(&self, build: &Build, tag: &RequestTag) -> bool {
        let registered = self
            .inflight
            .get(&tag.step_index)
            .is_some_and(|p| p.tag == *tag);
        registered
            && build
                .steps
                .get(tag.step_index)
                .is_some_and(|s| join_fingerprint(s) == tag.fingerprint)
    }

    // ------------------------------------------------------------------------
    // Matching field (datasource)
    // ------------------------------------------------------------------------

    pub fn begin_matching(
        &mut self,
        build: &Build,
        step_index: usize,
        field: Label,
    ) -> LabResult<(Build, DiscrepancyRequest)> {
        let previous = datasource_step(build, step_index)?.clone();
        let optimistic =
            steps::update_step_field(build, step_index, StepEdit::SetMatching(Some(field.clone())))?;
        let request = self.register_discrepancy(&optimistic, step_index, field, CheckKind::Matching, previous);
        Ok((optimistic, request))
    }

    /// Re-runs the check for the step's current matching field.
    pub fn begin_recheck(&mut self, build: &Build, step_index: usize) -> LabResult<DiscrepancyRequest> {
        let step = datasource_step(build, step_index)?;
        let field = step
            .as_datasource()
            .and_then(|d| d.matching.clone())
            .ok_or_else(|| {
                LabError::structural(format!(
                    "Module {} has no matching field to check",
                    step_index + 1
                ))
            })?;
        let previous = step.clone();
        Ok(self.register_discrepancy(build, step_index, field, CheckKind::Recheck, previous))
    }

    /// Applies a discrepancy response. A non-empty report is kept with the
    /// check until it is reconciled under the same tag.
    pub fn complete_discrepancies(
        &mut self,
        build: &Build,
        tag: &RequestTag,
        report: DiscrepancyReport,
    ) -> CheckOutcome {
        if !self.is_current(build, tag) {
            log::debug!(
                "Discarding stale discrepancy response for step {} ({})",
                tag.step_index,
                tag.choice
            );
            return CheckOutcome::Stale;
        }
        if report.is_empty() {
            self.inflight.remove(&tag.step_index);
            return CheckOutcome::Settled;
        }
        if let Some(pending) = self.inflight.get_mut(&tag.step_index) {
            pending.report = Some(report.clone());
        }
        CheckOutcome::NeedsResolution(report)
    }

    /// The mismatches awaiting reconciliation under `tag`. `None` once the
    /// tag is superseded or before its response has arrived.
    pub fn open_report(&self, build: &Build, tag: &RequestTag) -> Option<(CheckKind, &DiscrepancyReport)> {
        if !self.is_current(build, tag) {
            return None;
        }
        let pending = self.inflight.get(&tag.step_index)?;
        pending.report.as_ref().map(|r| (pending.kind, r))
    }

    /// Ends the check registered under `tag`. A newer check is left alone.
    pub fn finish(&mut self, tag: &RequestTag) {
        if self.in_flight(tag.step_index) == Some(tag) {
            self.inflight.remove(&tag.step_index);
        }
    }

    /// Forgets whatever is in flight for `step_index` (the step is gone).
    pub fn forget(&mut self, step_index: usize) {
        self.inflight.remove(&step_index);
    }

    // ------------------------------------------------------------------------
    // Form primary key
    // ------------------------------------------------------------------------

    pub fn begin_form_primary(
        &mut self,
        build: &Build,
        step_index: usize,
        label: Label,
    ) -> LabResult<(Build, UniquenessRequest)> {
        let previous = build
            .steps
            .get(step_index)
            .filter(|s| s.kind() == StepKind::Form)
            .cloned()
            .ok_or_else(|| {
                LabError::structural(format!("Module {} is not a form", step_index + 1))
            })?;
        let optimistic =
            steps::update_step_field(build, step_index, StepEdit::SetFormPrimary(Some(label.clone())))?;
        let tag = self.register(&optimistic, step_index, label.clone(), CheckKind::Uniqueness, previous);
        let request = UniquenessRequest {
            tag,
            partial: optimistic.partial(step_index),
            label,
        };
        Ok((optimistic, request))
    }

    pub fn complete_uniqueness(
        &mut self,
        build: &Build,
        tag: &RequestTag,
        response: Uniqueness,
    ) -> CheckOutcome {
        if !self.is_current(build, tag) {
            log::debug!("Discarding stale uniqueness response for step {}", tag.step_index);
            return CheckOutcome::Stale;
        }
        let Some(pending) = self.inflight.remove(&tag.step_index) else {
            return CheckOutcome::Stale;
        };
        if response.is_unique {
            CheckOutcome::Settled
        } else {
            CheckOutcome::Rejected(restore_choice(build, tag.step_index, &pending.previous))
        }
    }

    // ------------------------------------------------------------------------
    // Failure
    // ------------------------------------------------------------------------

    /// Transport failure: returns the build with the optimistic choice undone,
    /// or `None` if the request was already superseded.
    pub fn fail(&mut self, build: &Build, tag: &RequestTag) -> Option<Build> {
        if !self.is_current(build, tag) {
            return None;
        }
        let pending = self.inflight.remove(&tag.step_index)?;
        Some(restore_choice(build, tag.step_index, &pending.previous))
    }

    fn register_discrepancy(
        &mut self,
        build: &Build,
        step_index: usize,
        field: Label,
        kind: CheckKind,
        previous: Step,
    ) -> DiscrepancyRequest {
        let tag = self.register(build, step_index, field, kind, previous);
        DiscrepancyRequest {
            tag,
            partial: build.partial(step_index),
            candidate: build.steps[step_index].clone(),
        }
    }

    fn register(
        &mut self,
        build: &Build,
        step_index: usize,
        choice: Label,
        kind: CheckKind,
        previous: Step,
    ) -> RequestTag {
        let tag = RequestTag {
            step_index,
            choice,
            fingerprint: join_fingerprint(&build.steps[step_index]),
        };
        // A superseded choice was never confirmed; keep the older baseline.
        let previous = self
            .inflight
            .get(&step_index)
            .map(|p| p.previous.clone())
            .unwrap_or(previous);
        let replaced = self.inflight.insert(
            step_index,
            Pending {
                tag: tag.clone(),
                kind,
                previous,
                report: None,
            },
        );
        if let Some(old) = replaced {
            log::debug!(
                "Check for step {} ({}) superseded by ({})",
                step_index,
                old.tag.choice,
                tag.choice
            );
        }
        tag
    }
}

// ============================================================================
// 3. HELPERS
// ============================================================================

/// Hash of the parts of a step that decide how it joins.
fn join_fingerprint(step: &Step) -> String {
    match step {
        Step::Datasource { datasource } => fingerprint::of(&(
            "datasource",
            &datasource.id,
            &datasource.primary,
            &datasource.matching,
        )),
        Step::Form { form } => fingerprint::of(&("form", &form.primary)),
        Step::Computed { .. } => fingerprint::of(&"computed"),
    }
}

/// Puts back the join-relevant parts of `previous`, keeping any other edits.
fn restore_choice(build: &Build, step_index: usize, previous: &Step) -> Build {
    let mut next = build.clone();
    match (&mut next.steps[step_index], previous) {
        (Step::Datasource { datasource }, Step::Datasource { datasource: prev }) => {
            datasource.matching = prev.matching.clone();
            datasource.discrepancies = prev.discrepancies.clone();
        }
        (Step::Form { form }, Step::Form { form: prev }) => {
            form.primary = prev.primary.clone();
        }
        _ => {}
    }
    next
}

fn datasource_step(build: &Build, step_index: usize) -> LabResult<&Step> {
    let step = build.steps.get(step_index).ok_or_else(|| {
        LabError::structural(format!("Module {} does not exist", step_index + 1))
    })?;
    if step.kind() != StepKind::Datasource {
        return Err(LabError::structural(format!(
            "Module {} is a {}; only datasources have a matching field",
            step_index + 1,
            step.kind()
        )));
    }
    Ok(step)
}
