//! DataLab configuration and build documents.
//!
//! # Files
//! - **Lab config** (`datalab.yaml`): where the local collaborator keeps its
//!   database and how the session behaves. Every key has a default, so an
//!   empty file (or no file) is valid.
//! - **Build documents**: a `Build` as YAML or JSON. `serde_yaml` reads both;
//!   documents are written back as pretty JSON, the shape the server accepts.
//! - **Source rows**: a JSON array of objects, imported into the local
//!   collaborator as a datasource.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::Build;

/// Config schema version supported by this implementation.
pub const SUPPORTED_CONFIG_VERSION: u32 = 1;

// =============================================================================
// Errors
// =============================================================================

/// A user-facing error for config and document loading.
///
/// Messages say what is wrong and where.
#[derive(Debug)]
pub struct ConfigError {
    pub kind: ConfigErrorKind,
    pub context: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigErrorKind {
    Io,
    Parse,
    Version,
    Validation,
}

impl ConfigError {
    pub fn io(err: impl fmt::Display, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            kind: ConfigErrorKind::Io,
            context: vec![format!("I/O error on {path}: {err}")],
        }
    }

    pub fn parse(err: impl fmt::Display) -> Self {
        Self {
            kind: ConfigErrorKind::Parse,
            context: vec![format!("Failed to parse document: {err}")],
        }
    }

    pub fn version(found: u32) -> Self {
        Self {
            kind: ConfigErrorKind::Version,
            context: vec![format!(
                "Unsupported config version: {found}. This DataLab build supports version {SUPPORTED_CONFIG_VERSION}."
            )],
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self {
            kind: ConfigErrorKind::Validation,
            context: vec![msg.into()],
        }
    }

    pub fn push_context(mut self, msg: impl Into<String>) -> Self {
        self.context.push(msg.into());
        self
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:?}", self.kind)?;
        for (i, line) in self.context.iter().enumerate() {
            if i == 0 {
                writeln!(f, "- {line}")?;
            } else {
                writeln!(f, "  {line}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ConfigError {}

// =============================================================================
// Lab config
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    /// SQLite file of the local collaborator.
    #[serde(default = "default_database")]
    pub database: PathBuf,
    #[serde(default = "default_capacity")]
    pub notification_capacity: usize,
    /// Ask before destructive renames/removals.
    #[serde(default = "default_true")]
    pub confirm_destructive: bool,
}

fn default_version() -> u32 {
    SUPPORTED_CONFIG_VERSION
}
fn default_database() -> PathBuf {
    PathBuf::from("datalab.db")
}
fn default_capacity() -> usize {
    50
}
fn default_true() -> bool {
    true
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            database: default_database(),
            notification_capacity: default_capacity(),
            confirm_destructive: true,
        }
    }
}

impl LabConfig {
    /// Loads `path`, or defaults when it does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw =
            fs::read_to_string(path).map_err(|e| ConfigError::io(e, path.display().to_string()))?;
        let cfg = Self::parse(&raw)
            .map_err(|e| e.push_context(format!("in file: {}", path.display())))?;
        // Relative database paths are relative to the config file.
        Ok(Self {
            database: resolve_relative(path, &cfg.database),
            ..cfg
        })
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        // An empty YAML document is `null`, which should mean "all defaults".
        let cfg: LabConfig = if raw.trim().is_empty() {
            LabConfig::default()
        } else {
            serde_yaml::from_str(raw).map_err(ConfigError::parse)?
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != SUPPORTED_CONFIG_VERSION {
            return Err(ConfigError::version(self.version));
        }
        if self.notification_capacity == 0 {
            return Err(ConfigError::validation(
                "notification_capacity must be at least 1",
            ));
        }
        if self.database.as_os_str().is_empty() {
            return Err(ConfigError::validation("database must not be empty"));
        }
        Ok(())
    }
}

/// Resolve a path relative to the file that referenced it.
pub fn resolve_relative(referencing_file: &Path, referenced: &Path) -> PathBuf {
    if referenced.is_absolute() {
        referenced.to_path_buf()
    } else {
        referencing_file
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(referenced)
    }
}

// =============================================================================
// Build documents
// =============================================================================

pub fn load_build(path: impl AsRef<Path>) -> Result<Build, ConfigError> {
    let path = path.as_ref();
    let raw =
        fs::read_to_string(path).map_err(|e| ConfigError::io(e, path.display().to_string()))?;
    parse_build(&raw).map_err(|e| e.push_context(format!("in file: {}", path.display())))
}

pub fn parse_build(raw: &str) -> Result<Build, ConfigError> {
    serde_yaml::from_str(raw).map_err(ConfigError::parse)
}

pub fn to_json(build: &Build) -> Result<String, ConfigError> {
    serde_json::to_string_pretty(build).map_err(ConfigError::parse)
}

pub fn write_build(path: impl AsRef<Path>, build: &Build) -> Result<(), ConfigError> {
    let path = path.as_ref();
    fs::write(path, to_json(build)?).map_err(|e| ConfigError::io(e, path.display().to_string()))
}

// =============================================================================
// Source rows
// =============================================================================

pub fn load_rows(path: impl AsRef<Path>) -> Result<Vec<Map<String, Value>>, ConfigError> {
    let path = path.as_ref();
    let raw =
        fs::read_to_string(path).map_err(|e| ConfigError::io(e, path.display().to_string()))?;
    let value: Value = serde_json::from_str(&raw).map_err(ConfigError::parse)?;
    let Value::Array(items) = value else {
        return Err(ConfigError::validation("source rows must be a JSON array of objects")
            .push_context(format!("in file: {}", path.display())));
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(map) => Ok(map),
            _ => Err(ConfigError::validation(format!("row {i} is not an object"))
                .push_context(format!("in file: {}", path.display()))),
        })
        .collect()
}
