// src/discrepancy.rs
//
// =============================================================================
// DATALAB: DISCREPANCY RECONCILER
// =============================================================================
//
// When a source is attached, its primary keys and the build's matching keys
// may not line up. The server reports both one-sided sets; the user decides
// one policy per non-empty side and the decision is stored on the step.
//
//   primary  (incoming only):  true = Add,  false = Drop
//   matching (build only):     true = Keep, false = Ignore

use crate::core::{Build, Discrepancies, Key, Resolution};
use crate::error::{LabError, LabResult};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// 1. SERVER PAYLOAD
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiscrepancyReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<Vec<Key>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matching: Option<Vec<Key>>,
}

impl DiscrepancyReport {
    pub fn has_primary(&self) -> bool {
        self.primary.as_ref().is_some_and(|k| !k.is_empty())
    }

    pub fn has_matching(&self) -> bool {
        self.matching.as_ref().is_some_and(|k| !k.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        !self.has_primary() && !self.has_matching()
    }
}

// ============================================================================
// 2. POLICIES (display names for the two boolean decisions)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryPolicy {
    Add,
    Drop,
}

impl From<bool> for PrimaryPolicy {
    fn from(add: bool) -> Self {
        if add {
            PrimaryPolicy::Add
        } else {
            PrimaryPolicy::Drop
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchingPolicy {
    Keep,
    Ignore,
}

impl From<bool> for MatchingPolicy {
    fn from(keep: bool) -> Self {
        if keep {
            MatchingPolicy::Keep
        } else {
            MatchingPolicy::Ignore
        }
    }
}

impl fmt::Display for PrimaryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryPolicy::Add => f.write_str("add"),
            PrimaryPolicy::Drop => f.write_str("drop"),
        }
    }
}

impl fmt::Display for MatchingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchingPolicy::Keep => f.write_str("keep"),
            MatchingPolicy::Ignore => f.write_str("ignore"),
        }
    }
}

impl Resolution {
    pub fn new(primary: Option<bool>, matching: Option<bool>) -> Self {
        Self { primary, matching }
    }

    pub fn primary_policy(&self) -> Option<PrimaryPolicy> {
        self.primary.map(PrimaryPolicy::from)
    }

    pub fn matching_policy(&self) -> Option<MatchingPolicy> {
        self.matching.map(MatchingPolicy::from)
    }
}

// ============================================================================
// 3. RECONCILIATION
// ============================================================================

/// Checks that every non-empty side has a decision and strips decisions for
/// sides that have nothing to decide.
pub fn settle(report: &DiscrepancyReport, resolution: Resolution) -> LabResult<Resolution> {
    if report.has_primary() && resolution.primary.is_none() {
        return Err(LabError::reconciliation(
            "Choose whether to add or drop the records that exist only in the new source",
        ));
    }
    if report.has_matching() && resolution.matching.is_none() {
        return Err(LabError::reconciliation(
            "Choose whether to keep or ignore the records that exist only in the DataLab",
        ));
    }
    Ok(Resolution {
        primary: resolution.primary.filter(|_| report.has_primary()),
        matching: resolution.matching.filter(|_| report.has_matching()),
    })
}

/// Stores a settled resolution on the datasource at `step_index`.
pub fn apply_resolution(
    build: &Build,
    step_index: usize,
    report: &DiscrepancyReport,
    resolution: Resolution,
) -> LabResult<Build> {
    let values = settle(report, resolution)?;
    let mut next = build.clone();
    datasource_at(&mut next, step_index)?.discrepancies = Some(Discrepancies { values });
    Ok(next)
}

pub fn clear(build: &Build, step_index: usize) -> LabResult<Build> {
    let mut next = build.clone();
    datasource_at(&mut next, step_index)?.discrepancies = None;
    Ok(next)
}

/// Outcome of re-running the check for an already attached source.
#[derive(Debug, Clone, PartialEq)]
pub enum Recheck {
    /// Mismatches no longer apply; the stored resolution was removed.
    Cleared(Build),
    /// Mismatches persist; the reconciler must be reopened.
    Reopen(DiscrepancyReport),
}

pub fn recheck(build: &Build, step_index: usize, report: DiscrepancyReport) -> LabResult<Recheck> {
    if report.is_empty() {
        Ok(Recheck::Cleared(clear(build, step_index)?))
    } else {
        Ok(Recheck::Reopen(report))
    }
}

fn datasource_at(
    build: &mut Build,
    step_index: usize,
) -> LabResult<&mut crate::core::DatasourceStep> {
    build
        .steps
        .get_mut(step_index)
        .and_then(|s| s.as_datasource_mut())
        .ok_or_else(|| {
            LabError::structural(format!(
                "Module {} is not a datasource; only datasources carry discrepancies",
                step_index + 1
            ))
        })
}
