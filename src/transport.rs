// src/transport.rs
//
// The server collaborator contract.
//
// The core proposes and validates; the server computes rows, key sets and
// uniqueness, and persists. Wire mechanics (HTTP, auth) live behind this
// trait and are not part of the core.

use crate::core::{Build, SavedDataLab, Step, Uniqueness};
use crate::discrepancy::DiscrepancyReport;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait DataLabServer: Send + Sync {
    /// Key mismatches between `partial` (the build before the candidate step)
    /// and `candidate` joined on its matching field.
    async fn check_discrepancies(&self, partial: &Build, candidate: &Step)
        -> Result<DiscrepancyReport>;

    /// Whether `label` identifies records of `partial` uniquely.
    async fn check_uniqueness(&self, partial: &Build, label: &str) -> Result<Uniqueness>;

    async fn save_build(&self, build: &Build) -> Result<SavedDataLab>;
}

#[async_trait]
impl<T: DataLabServer + ?Sized> DataLabServer for Arc<T> {
    async fn check_discrepancies(
        &self,
        partial: &Build,
        candidate: &Step,
    ) -> Result<DiscrepancyReport> {
        (**self).check_discrepancies(partial, candidate).await
    }

    async fn check_uniqueness(&self, partial: &Build, label: &str) -> Result<Uniqueness> {
        (**self).check_uniqueness(partial, label).await
    }

    async fn save_build(&self, build: &Build) -> Result<SavedDataLab> {
        (**self).save_build(build).await
    }
}
