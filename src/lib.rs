// src/lib.rs
//
// =============================================================================
// DATALAB: LIBRARY ROOT
// =============================================================================
//
// This file declares the module tree and exports public types.

// 1. Declare Modules
pub mod core;
pub mod dependency;
pub mod discrepancy;
pub mod error;
pub mod fingerprint;
pub mod labels;
pub mod logs;
pub mod matching;
pub mod order;
pub mod session;
pub mod steps;
pub mod store;
pub mod transport;
pub mod validator;

pub mod config;

// 2. Re-exports (The Public API)

pub use crate::core::{Build, Label, Step, StepKind};
pub use dependency::has_dependency;
pub use discrepancy::DiscrepancyReport;
pub use error::{LabError, LabResult};
pub use labels::{is_used, LabelNamespace};
pub use logs::NotificationBuffer;
pub use session::{Decision, JoinOutcome, LabSession, Prompter};
pub use steps::StepEdit;
pub use transport::DataLabServer;
pub use validator::validate;
