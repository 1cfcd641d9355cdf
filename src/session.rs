// src/session.rs
//
// =============================================================================
// DATALAB: EDIT SESSION (Controller)
// =============================================================================
//
// Owns the single in-memory Build for one DataLab being created or edited.
//
// Responsibilities:
// 1. Run every user action as one transaction: compute the successor build,
//    confirm if destructive, commit, refresh validation errors once.
// 2. Drive the server checks that gate matching fields and form keys.
// 3. Surface rejected actions and failed requests as notifications.
//
// There is one writer. Methods take `&mut self`, so a pending save (or any
// other await) blocks further edits by construction.

use crate::config::LabConfig;
use crate::core::{Build, BuildErrors, Label, Resolution, SavedDataLab, StepKind, Uniqueness};
use crate::dependency;
use crate::discrepancy::{self, DiscrepancyReport, Recheck};
use crate::error::{LabError, LabResult};
use crate::labels;
use crate::logs::NotificationBuffer;
use crate::matching::{
    self, CheckKind, CheckOutcome, DiscrepancyRequest, MatchingResolver, RequestTag,
    UniquenessRequest,
};
use crate::order::{self, Column};
use crate::steps::{self, StepEdit};
use crate::transport::DataLabServer;
use crate::validator;
use async_trait::async_trait;

// ============================================================================
// 1. INJECTED CAPABILITIES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Confirm,
    Cancel,
}

/// The user, as seen from the core: confirmation dialogs and the
/// discrepancy reconciler.
#[async_trait]
pub trait Prompter: Send + Sync {
    async fn confirm(&self, prompt: &str) -> Decision;

    /// `None` cancels the reconciliation.
    async fn reconcile(&self, step_index: usize, report: &DiscrepancyReport) -> Option<Resolution>;
}

/// Confirms everything and answers the reconciler with a fixed resolution.
/// Used by the CLI, where decisions come from flags.
#[derive(Debug, Clone, Default)]
pub struct FixedPrompter {
    pub resolution: Option<Resolution>,
}

#[async_trait]
impl Prompter for FixedPrompter {
    async fn confirm(&self, prompt: &str) -> Decision {
        log::debug!("auto-confirm: {}", prompt);
        Decision::Confirm
    }

    async fn reconcile(&self, _step_index: usize, _report: &DiscrepancyReport) -> Option<Resolution> {
        self.resolution
    }
}

/// How a join-affecting action ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    /// Key sets agree.
    Settled,
    /// Mismatches found and a resolution was stored.
    Resolved(Resolution),
    /// A re-check found no mismatches; the stored resolution was removed.
    Cleared,
    Cancelled,
    /// A newer request for the same step replaced this one.
    Superseded,
}

// ============================================================================
// 2. THE SESSION
// ============================================================================

pub struct LabSession<S: DataLabServer, P: Prompter> {
    build: Build,
    server: S,
    prompter: P,
    resolver: MatchingResolver,
    notifications: NotificationBuffer,
    confirm_destructive: bool,
    closed: bool,
}

impl<S: DataLabServer, P: Prompter> LabSession<S, P> {
    /// Opens an existing build. A document whose `order` drifted from its
    /// steps is repaired before anything else happens.
    pub fn open(build: Build, server: S, prompter: P, config: &LabConfig) -> Self {
        let build = if order::is_consistent(&build) {
            build
        } else {
            log::warn!("Column order of '{}' was out of sync; repaired", build.name);
            order::sync(&build)
        };
        Self {
            build: validator::with_errors(build),
            server,
            prompter,
            resolver: MatchingResolver::new(),
            notifications: NotificationBuffer::new(config.notification_capacity),
            confirm_destructive: config.confirm_destructive,
            closed: false,
        }
    }

    pub fn create(name: impl Into<String>, server: S, prompter: P, config: &LabConfig) -> Self {
        Self::open(Build::new(name), server, prompter, config)
    }

    // ------------------------------------------------------------------------
    // Queries (what the UI reads)
    // ------------------------------------------------------------------------

    pub fn build(&self) -> &Build {
        &self.build
    }

    pub fn errors(&self) -> &BuildErrors {
        &self.build.errors
    }

    pub fn notifications(&self) -> &NotificationBuffer {
        &self.notifications
    }

    pub fn server(&self) -> &S {
        &self.server
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn has_dependency(&self, step_index: usize, field: &str) -> bool {
        dependency::has_dependency(&self.build, step_index, field)
    }

    pub fn is_used(&self, label: &str) -> bool {
        labels::is_used(&self.build, label)
    }

    pub fn matching_candidates(&self, step_index: usize) -> Vec<Label> {
        matching::matching_candidates(&self.build, step_index)
    }

    pub fn columns(&self) -> Vec<Column> {
        order::columns(&self.build)
    }

    pub fn in_flight(&self, step_index: usize) -> Option<&RequestTag> {
        self.resolver.in_flight(step_index)
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    fn ensure_open(&self) -> LabResult<()> {
        if self.closed {
            return Err(LabError::Closed);
        }
        Ok(())
    }

    fn commit(&mut self, next: Build) {
        self.build = validator::with_errors(next);
    }

    /// Commits a successor or reports why it was rejected.
    fn apply(&mut self, result: LabResult<Build>) -> LabResult<()> {
        self.ensure_open()?;
        match result {
            Ok(next) => {
                self.commit(next);
                Ok(())
            }
            Err(e) => Err(self.reject(e)),
        }
    }

    fn reject(&self, err: LabError) -> LabError {
        match &err {
            LabError::Transport(_) => self.notifications.error(err.to_string()),
            _ => self.notifications.warn(err.to_string()),
        }
        err
    }

    async fn confirmed(&self, prompt: Option<String>) -> bool {
        match prompt {
            Some(p) if self.confirm_destructive => self.prompter.confirm(&p).await == Decision::Confirm,
            _ => true,
        }
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> LabResult<()> {
        let next = Build {
            name: name.into(),
            ..self.build.clone()
        };
        self.apply(Ok(next))
    }

    pub fn set_description(&mut self, description: impl Into<String>) -> LabResult<()> {
        let next = Build {
            description: description.into(),
            ..self.build.clone()
        };
        self.apply(Ok(next))
    }

    /// Appends a step and returns its index.
    pub fn add_step(&mut self, kind: StepKind) -> LabResult<usize> {
        let result = steps::add_step(&self.build, kind);
        self.apply(result)?;
        log::info!("Added {} module #{}", kind, self.build.steps.len());
        Ok(self.build.steps.len() - 1)
    }

    /// Returns `false` if the user cancelled.
    pub async fn remove_last_step(&mut self) -> LabResult<bool> {
        self.ensure_open()?;
        let next = match steps::remove_last_step(&self.build) {
            Ok(next) => next,
            Err(e) => return Err(self.reject(e)),
        };
        let last = self.build.steps.len() - 1;
        let prompt = format!(
            "Remove module {} ({})? Its fields will be removed from the DataLab.",
            last + 1,
            self.build.steps[last].kind()
        );
        if !self.confirmed(Some(prompt)).await {
            return Ok(false);
        }
        self.resolver.forget(last);
        self.commit(next);
        log::info!("Removed module #{}", last + 1);
        Ok(true)
    }

    /// Applies one step edit. Rejected edits leave the build unchanged;
    /// returns `false` if the user cancelled a destructive edit.
    ///
    /// Matching fields and form primary keys with a value are chosen through
    /// `choose_matching_field` / `choose_form_primary`, which check them.
    pub async fn edit(&mut self, step_index: usize, edit: StepEdit) -> LabResult<bool> {
        self.ensure_open()?;
        if matches!(edit, StepEdit::SetMatching(Some(_)) | StepEdit::SetFormPrimary(Some(_))) {
            return Err(self.reject(LabError::structural(
                "Join keys are chosen with a server check; use choose_matching_field or choose_form_primary",
            )));
        }
        let prompt = edit.confirmation(&self.build, step_index);
        let next = match steps::update_step_field(&self.build, step_index, edit) {
            Ok(next) => next,
            Err(e) => return Err(self.reject(e)),
        };
        if !self.confirmed(prompt).await {
            return Ok(false);
        }
        self.commit(next);
        Ok(true)
    }

    pub fn move_field(&mut self, from: usize, to: usize) -> LabResult<()> {
        let result = order::move_field(&self.build, from, to);
        self.apply(result)
    }

    pub fn set_visible(&mut self, label: &str, visible: bool) -> LabResult<()> {
        let result = order::set_visible(&self.build, label, visible);
        self.apply(result)
    }

    pub fn set_pinned(&mut self, label: &str, pinned: bool) -> LabResult<()> {
        let result = order::set_pinned(&self.build, label, pinned);
        self.apply(result)
    }

    // ------------------------------------------------------------------------
    // Matching field: split protocol
    // ------------------------------------------------------------------------

    /// Stores the choice optimistically and returns the check to send.
    pub fn request_matching(&mut self, step_index: usize, field: Label) -> LabResult<DiscrepancyRequest> {
        self.ensure_open()?;
        match self.resolver.begin_matching(&self.build, step_index, field) {
            Ok((optimistic, request)) => {
                self.commit(optimistic);
                Ok(request)
            }
            Err(e) => Err(self.reject(e)),
        }
    }

    /// Re-runs the check for a settled matching field.
    pub fn request_recheck(&mut self, step_index: usize) -> LabResult<DiscrepancyRequest> {
        self.ensure_open()?;
        self.resolver
            .begin_recheck(&self.build, step_index)
            .map_err(|e| self.reject(e))
    }

    /// Feeds a server response (or failure) back into the session.
    pub fn apply_discrepancy_response(
        &mut self,
        tag: &RequestTag,
        response: anyhow::Result<DiscrepancyReport>,
    ) -> LabResult<CheckOutcome> {
        self.ensure_open()?;
        let report = match response {
            Ok(report) => report,
            Err(e) => {
                if let Some(restored) = self.resolver.fail(&self.build, tag) {
                    self.commit(restored);
                }
                return Err(self.reject(LabError::transport(e)));
            }
        };

        let kind = self.resolver.kind_of(tag.step_index);
        let outcome = self.resolver.complete_discrepancies(&self.build, tag, report);
        if outcome == CheckOutcome::Settled {
            if kind == Some(CheckKind::Recheck) {
                match discrepancy::recheck(&self.build, tag.step_index, DiscrepancyReport::default()) {
                    Ok(Recheck::Cleared(next)) => self.commit(next),
                    Ok(Recheck::Reopen(_)) => {}
                    Err(e) => return Err(self.reject(e)),
                }
                self.notifications.info(format!(
                    "Module {}: discrepancies no longer apply",
                    tag.step_index + 1
                ));
            } else {
                // A settled choice never keeps a resolution from an older check.
                match discrepancy::clear(&self.build, tag.step_index) {
                    Ok(next) => self.commit(next),
                    Err(e) => return Err(self.reject(e)),
                }
                self.notifications.info(format!(
                    "Module {} joined on '{}'",
                    tag.step_index + 1,
                    tag.choice
                ));
            }
        }
        Ok(outcome)
    }

    /// Records the user's reconciliation for the check `tag` came from, or
    /// cancels it with `None`. The mismatches are the ones the server
    /// reported for that check.
    ///
    /// Returns `false` when a newer choice or edit has superseded `tag`;
    /// nothing changes then. Cancelling a new matching choice rolls the field
    /// back to none; cancelling a re-check keeps the existing resolution.
    pub fn resolve_discrepancies(
        &mut self,
        tag: &RequestTag,
        resolution: Option<Resolution>,
    ) -> LabResult<bool> {
        self.ensure_open()?;
        if !self.resolver.is_current(&self.build, tag) {
            log::debug!(
                "Discarding stale reconciliation for step {} ({})",
                tag.step_index,
                tag.choice
            );
            return Ok(false);
        }
        let (kind, report) = match self.resolver.open_report(&self.build, tag) {
            Some((kind, report)) => (kind, report.clone()),
            None => {
                return Err(self.reject(LabError::structural(format!(
                    "Module {} has no discrepancies awaiting resolution",
                    tag.step_index + 1
                ))))
            }
        };
        let step_index = tag.step_index;

        match resolution {
            None => {
                if kind == CheckKind::Matching {
                    let rollback =
                        steps::update_step_field(&self.build, step_index, StepEdit::SetMatching(None));
                    match rollback {
                        Ok(next) => self.commit(next),
                        Err(e) => return Err(self.reject(e)),
                    }
                    self.notifications
                        .warn(format!("Module {}: matching field cleared", step_index + 1));
                }
                self.resolver.finish(tag);
            }
            Some(resolution) => {
                let next = discrepancy::apply_resolution(&self.build, step_index, &report, resolution)
                    .map_err(|e| self.reject(e))?;
                self.commit(next);
                self.resolver.finish(tag);
            }
        }
        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Matching field: one-shot flows
    // ------------------------------------------------------------------------

    pub async fn choose_matching_field(&mut self, step_index: usize, field: Label) -> LabResult<JoinOutcome> {
        let request = self.request_matching(step_index, field)?;
        let response = self
            .server
            .check_discrepancies(&request.partial, &request.candidate)
            .await;
        let outcome = self.apply_discrepancy_response(&request.tag, response)?;
        self.settle(&request.tag, outcome, CheckKind::Matching).await
    }

    /// "Manage discrepancies": re-validates against current source data.
    pub async fn manage_discrepancies(&mut self, step_index: usize) -> LabResult<JoinOutcome> {
        let request = self.request_recheck(step_index)?;
        let response = self
            .server
            .check_discrepancies(&request.partial, &request.candidate)
            .await;
        let outcome = self.apply_discrepancy_response(&request.tag, response)?;
        self.settle(&request.tag, outcome, CheckKind::Recheck).await
    }

    async fn settle(&mut self, tag: &RequestTag, outcome: CheckOutcome, kind: CheckKind) -> LabResult<JoinOutcome> {
        match outcome {
            CheckOutcome::Settled if kind == CheckKind::Recheck => Ok(JoinOutcome::Cleared),
            CheckOutcome::Settled => Ok(JoinOutcome::Settled),
            CheckOutcome::Stale => Ok(JoinOutcome::Superseded),
            CheckOutcome::Rejected(_) => Ok(JoinOutcome::Cancelled),
            CheckOutcome::NeedsResolution(report) => {
                let decision = self.prompter.reconcile(tag.step_index, &report).await;
                match decision {
                    None => {
                        self.resolve_discrepancies(tag, None)?;
                        Ok(JoinOutcome::Cancelled)
                    }
                    Some(resolution) => {
                        if let Err(e) = self.resolve_discrepancies(tag, Some(resolution)) {
                            // One-shot flow: an incomplete answer counts as a cancel.
                            self.resolve_discrepancies(tag, None)?;
                            return Err(e);
                        }
                        Ok(JoinOutcome::Resolved(discrepancy::settle(&report, resolution)?))
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Form primary key
    // ------------------------------------------------------------------------

    pub fn request_form_primary(&mut self, step_index: usize, label: Label) -> LabResult<UniquenessRequest> {
        self.ensure_open()?;
        match self.resolver.begin_form_primary(&self.build, step_index, label) {
            Ok((optimistic, request)) => {
                self.commit(optimistic);
                Ok(request)
            }
            Err(e) => Err(self.reject(e)),
        }
    }

    pub fn apply_uniqueness_response(
        &mut self,
        tag: &RequestTag,
        response: anyhow::Result<Uniqueness>,
    ) -> LabResult<CheckOutcome> {
        self.ensure_open()?;
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                if let Some(restored) = self.resolver.fail(&self.build, tag) {
                    self.commit(restored);
                }
                return Err(self.reject(LabError::transport(e)));
            }
        };
        let outcome = self.resolver.complete_uniqueness(&self.build, tag, response);
        if let CheckOutcome::Rejected(restored) = &outcome {
            self.commit(restored.clone());
            return Err(self.reject(LabError::NotUnique(tag.choice.clone())));
        }
        Ok(outcome)
    }

    pub async fn choose_form_primary(&mut self, step_index: usize, label: Label) -> LabResult<JoinOutcome> {
        let request = self.request_form_primary(step_index, label)?;
        let response = self
            .server
            .check_uniqueness(&request.partial, &request.label)
            .await;
        match self.apply_uniqueness_response(&request.tag, response)? {
            CheckOutcome::Stale => Ok(JoinOutcome::Superseded),
            _ => Ok(JoinOutcome::Settled),
        }
    }

    // ------------------------------------------------------------------------
    // Save / discard
    // ------------------------------------------------------------------------

    /// Validates and persists. On success the session is closed.
    pub async fn save(&mut self) -> LabResult<SavedDataLab> {
        self.ensure_open()?;
        let report = validator::validate(&self.build);
        if !report.is_valid {
            self.build.errors = report.errors.clone();
            return Err(self.reject(LabError::Validation(report.errors)));
        }

        let saved = self
            .server
            .save_build(&self.build)
            .await
            .map_err(|e| self.reject(LabError::transport(e)))?;

        self.build.id = Some(saved.id);
        self.resolver.clear();
        self.closed = true;
        self.notifications.info(format!("Saved DataLab '{}'", saved.name));
        Ok(saved)
    }

    /// Navigation away: drops the build and every in-flight check.
    pub fn discard(mut self) {
        self.resolver.clear();
        log::info!("Discarded edits to '{}'", self.build.name);
    }
}
