// src/store.rs
//
// =============================================================================
// DATALAB: LOCAL COLLABORATOR (Reference Server)
// =============================================================================
//
// A SQLite-backed implementation of the server contract, used by the CLI
// and the integration tests.
//
// Architecture:
// - Datasources are stored as JSON row arrays, one row per record.
// - Saved DataLabs are stored as whole build documents plus a fingerprint.
// - Joined rows are computed in memory from the build definition.
//
// Join semantics for a non-first datasource (`matching` == incoming `primary`):
// - build records with a partner get the partner's fields;
// - build-only records: kept with nulls (Keep, default) or removed (Ignore);
// - incoming-only records: dropped (Drop, default) or appended (Add).

use crate::core::{
    Build, DatasourceStep, FieldType, Formula, Key, Label, Operation, SavedDataLab, Step,
    Uniqueness,
};
use crate::discrepancy::DiscrepancyReport;
use crate::fingerprint;
use crate::transport::DataLabServer;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// One joined row: label -> value.
pub type Record = BTreeMap<Label, Value>;

/// Raw source row: source field -> value.
pub type SourceRow = Map<String, Value>;

// -----------------------------------------------------------------------------
// View Models
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceInfo {
    pub id: String,
    pub name: String,
    pub rows: usize,
}

// -----------------------------------------------------------------------------
// LocalServer
// -----------------------------------------------------------------------------

pub struct LocalServer {
    path: PathBuf,
}

impl LocalServer {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "PRAGMA journal_mode=DELETE;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=10000;",
        )?;
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS sources (
                id TEXT PRIMARY KEY,
                name TEXT,
                updated_at_ms INTEGER,
                rows_json TEXT
            );

            CREATE TABLE IF NOT EXISTS datalabs (
                id TEXT PRIMARY KEY,
                name TEXT,
                updated_at_ms INTEGER,
                fingerprint TEXT,
                build_json TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_datalabs_updated ON datalabs(updated_at_ms);
            COMMIT;",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        Connection::open(&self.path).context("Failed to open DataLab DB")
    }

    // -------------------------------------------------------------------------
    // SOURCES
    // -------------------------------------------------------------------------

    pub fn put_source(&self, id: &str, name: &str, rows: &[SourceRow]) -> Result<()> {
        let conn = self.conn()?;
        let json = serde_json::to_string(rows)?;
        conn.execute(
            "INSERT INTO sources (id, name, updated_at_ms, rows_json)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                name=excluded.name,
                updated_at_ms=excluded.updated_at_ms,
                rows_json=excluded.rows_json",
            params![id, name, Utc::now().timestamp_millis(), json],
        )?;
        log::info!("Stored source '{}' ({} rows)", id, rows.len());
        Ok(())
    }

    pub fn source_rows(&self, id: &str) -> Result<Vec<SourceRow>> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT rows_json FROM sources WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        let json = json.ok_or_else(|| anyhow!("Unknown datasource: {}", id))?;
        serde_json::from_str(&json).with_context(|| format!("Corrupt rows for source {id}"))
    }

    /// Field names with a type inferred from the first non-null value.
    pub fn source_fields(&self, id: &str) -> Result<BTreeMap<String, FieldType>> {
        let mut out = BTreeMap::new();
        for row in self.source_rows(id)? {
            for (field, value) in row {
                if value.is_null() {
                    out.entry(field).or_insert(FieldType::Text);
                } else {
                    let inferred = FieldType::infer(&value);
                    out.entry(field)
                        .and_modify(|t| {
                            if *t == FieldType::Text {
                                *t = inferred
                            }
                        })
                        .or_insert(inferred);
                }
            }
        }
        Ok(out)
    }

    pub fn list_sources(&self) -> Result<Vec<SourceInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name, rows_json FROM sources ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for r in rows {
            let (id, name, json) = r?;
            let count = serde_json::from_str::<Vec<Value>>(&json)
                .map(|v| v.len())
                .unwrap_or(0);
            out.push(SourceInfo {
                id,
                name,
                rows: count,
            });
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // DATALABS
    // -------------------------------------------------------------------------

    pub fn load_datalab(&self, id: &Uuid) -> Result<Build> {
        let conn = self.conn()?;
        let json: String = conn
            .query_row(
                "SELECT build_json FROM datalabs WHERE id = ?1",
                params![id.to_string()],
                |r| r.get(0),
            )
            .with_context(|| format!("DataLab {id} not found"))?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn list_datalabs(&self) -> Result<Vec<SavedDataLab>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, name, updated_at_ms FROM datalabs ORDER BY updated_at_ms DESC")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for r in rows {
            let (id, name, ms) = r?;
            let Ok(id) = Uuid::parse_str(&id) else {
                log::warn!("Skipping DataLab with malformed id '{}'", id);
                continue;
            };
            let updated_at = Utc
                .timestamp_millis_opt(ms)
                .single()
                .unwrap_or_else(Utc::now);
            out.push(SavedDataLab {
                id,
                name,
                updated_at,
            });
        }
        Ok(out)
    }

    fn store_datalab(&self, build: &Build) -> Result<SavedDataLab> {
        let id = build.id.unwrap_or_else(Uuid::new_v4);
        let stored = Build {
            id: Some(id),
            ..build.clone()
        };
        let digest = fingerprint::of(&stored);
        let conn = self.conn()?;

        let previous: Option<(String, i64)> = conn
            .query_row(
                "SELECT fingerprint, updated_at_ms FROM datalabs WHERE id = ?1",
                params![id.to_string()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        if let Some((fp, ms)) = previous {
            if fp == digest {
                log::debug!("DataLab {} unchanged; skipping write", id);
                let updated_at = Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now);
                return Ok(SavedDataLab {
                    id,
                    name: stored.name,
                    updated_at,
                });
            }
        }

        let now = Utc::now();
        conn.execute(
            "INSERT INTO datalabs (id, name, updated_at_ms, fingerprint, build_json)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                name=excluded.name,
                updated_at_ms=excluded.updated_at_ms,
                fingerprint=excluded.fingerprint,
                build_json=excluded.build_json",
            params![
                id.to_string(),
                stored.name,
                now.timestamp_millis(),
                digest,
                serde_json::to_string(&stored)?
            ],
        )?;
        log::info!("Saved DataLab '{}' ({})", stored.name, id);
        Ok(SavedDataLab {
            id,
            name: stored.name,
            updated_at: now,
        })
    }

    // -------------------------------------------------------------------------
    // ROWS (the join)
    // -------------------------------------------------------------------------

    /// Joined dataset for the whole build.
    pub fn rows(&self, build: &Build) -> Result<Vec<Record>> {
        self.dataset(&build.steps)
    }

    fn dataset(&self, steps: &[Step]) -> Result<Vec<Record>> {
        let mut records: Vec<Record> = Vec::new();
        for (i, step) in steps.iter().enumerate() {
            match step {
                Step::Datasource { datasource } => {
                    let incoming = self.incoming(i, datasource)?;
                    if i == 0 {
                        records = incoming.into_iter().map(|(_, r)| r).collect();
                    } else {
                        let matching = datasource.matching.as_deref().ok_or_else(|| {
                            anyhow!("Module {} has no matching field", i + 1)
                        })?;
                        let values = datasource
                            .discrepancies
                            .as_ref()
                            .map(|d| d.values)
                            .unwrap_or_default();
                        let labels: Vec<Label> =
                            datasource.fields.iter().map(|f| datasource.label_of(f)).collect();
                        records = join_records(
                            records,
                            incoming,
                            matching,
                            &labels,
                            values.primary.unwrap_or(false),
                            values.matching.unwrap_or(true),
                        );
                    }
                }
                Step::Form { form } => {
                    for rec in records.iter_mut() {
                        for field in &form.fields {
                            rec.entry(field.name.clone()).or_insert(Value::Null);
                        }
                    }
                }
                Step::Computed { computed } => {
                    for rec in records.iter_mut() {
                        for field in &computed.fields {
                            let value = evaluate(&field.formula, rec);
                            rec.insert(field.name.clone(), value);
                        }
                    }
                }
            }
        }
        Ok(records)
    }

    /// Source rows keyed by primary, projected onto the step's labels.
    fn incoming(&self, step_index: usize, ds: &DatasourceStep) -> Result<Vec<(Key, Record)>> {
        let id = ds
            .id
            .as_deref()
            .ok_or_else(|| anyhow!("Module {} has no datasource", step_index + 1))?;
        let primary = ds
            .primary
            .as_deref()
            .ok_or_else(|| anyhow!("Module {} has no primary key", step_index + 1))?;
        let rows = self.source_rows(id)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key = row.get(primary).cloned().unwrap_or(Value::Null);
            if key.is_null() {
                continue;
            }
            let record: Record = ds
                .fields
                .iter()
                .map(|f| (ds.label_of(f), row.get(f).cloned().unwrap_or(Value::Null)))
                .collect();
            out.push((key, record));
        }
        Ok(out)
    }

    fn discrepancies(&self, partial: &Build, candidate: &Step) -> Result<DiscrepancyReport> {
        let ds = candidate
            .as_datasource()
            .ok_or_else(|| anyhow!("Only datasources are checked for discrepancies"))?;
        let matching = ds
            .matching
            .as_deref()
            .ok_or_else(|| anyhow!("Candidate module has no matching field"))?;
        let records = self.dataset(&partial.steps)?;
        let incoming = self.incoming(partial.steps.len(), ds)?;
        Ok(key_mismatches(&records, &incoming, matching))
    }

    fn uniqueness(&self, partial: &Build, label: &str) -> Result<Uniqueness> {
        if !partial.labels().iter().any(|l| l == label) {
            return Err(anyhow!("'{}' is not a field of the DataLab", label));
        }
        let records = self.dataset(&partial.steps)?;
        let mut seen = HashSet::new();
        let is_unique = records.iter().all(|rec| match rec.get(label) {
            None | Some(Value::Null) => false,
            Some(v) => seen.insert(key_repr(v)),
        });
        Ok(Uniqueness { is_unique })
    }
}

#[async_trait]
impl DataLabServer for LocalServer {
    async fn check_discrepancies(
        &self,
        partial: &Build,
        candidate: &Step,
    ) -> Result<DiscrepancyReport> {
        self.discrepancies(partial, candidate)
    }

    async fn check_uniqueness(&self, partial: &Build, label: &str) -> Result<Uniqueness> {
        self.uniqueness(partial, label)
    }

    async fn save_build(&self, build: &Build) -> Result<SavedDataLab> {
        self.store_datalab(build)
    }
}

// -----------------------------------------------------------------------------
// Pure join helpers
// -----------------------------------------------------------------------------

/// Keys compare by their string form, so `"7"` joins `7`.
pub fn key_repr(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Incoming-only keys (`primary`) and build-only keys (`matching`),
/// each sorted and de-duplicated; empty sides are `None`.
pub fn key_mismatches(
    records: &[Record],
    incoming: &[(Key, Record)],
    matching: &str,
) -> DiscrepancyReport {
    let build_keys: BTreeMap<String, Key> = records
        .iter()
        .filter_map(|r| r.get(matching))
        .filter(|v| !v.is_null())
        .map(|v| (key_repr(v), v.clone()))
        .collect();
    let incoming_keys: BTreeMap<String, Key> = incoming
        .iter()
        .map(|(k, _)| (key_repr(k), k.clone()))
        .collect();

    let primary: Vec<Key> = incoming_keys
        .iter()
        .filter(|(k, _)| !build_keys.contains_key(*k))
        .map(|(_, v)| v.clone())
        .collect();
    let matching: Vec<Key> = build_keys
        .iter()
        .filter(|(k, _)| !incoming_keys.contains_key(*k))
        .map(|(_, v)| v.clone())
        .collect();

    DiscrepancyReport {
        primary: (!primary.is_empty()).then_some(primary),
        matching: (!matching.is_empty()).then_some(matching),
    }
}

fn join_records(
    records: Vec<Record>,
    incoming: Vec<(Key, Record)>,
    matching: &str,
    labels: &[Label],
    add_incoming_only: bool,
    keep_build_only: bool,
) -> Vec<Record> {
    let columns: BTreeSet<Label> = records.iter().flat_map(|r| r.keys().cloned()).collect();
    let index: HashMap<String, usize> = incoming
        .iter()
        .enumerate()
        .map(|(i, (k, _))| (key_repr(k), i))
        .collect();

    let mut matched = HashSet::new();
    let mut out = Vec::with_capacity(records.len());
    for mut rec in records {
        let partner = rec
            .get(matching)
            .filter(|v| !v.is_null())
            .and_then(|v| index.get(&key_repr(v)).copied());
        match partner {
            Some(i) => {
                matched.insert(i);
                rec.extend(incoming[i].1.clone());
                out.push(rec);
            }
            None if keep_build_only => {
                for label in labels {
                    rec.entry(label.clone()).or_insert(Value::Null);
                }
                out.push(rec);
            }
            None => {}
        }
    }

    if add_incoming_only {
        for (i, (key, inc)) in incoming.into_iter().enumerate() {
            if matched.contains(&i) {
                continue;
            }
            let mut rec: Record = columns.iter().map(|c| (c.clone(), Value::Null)).collect();
            rec.insert(matching.to_string(), key);
            rec.extend(inc);
            out.push(rec);
        }
    }
    out
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Row-wise formula over the record's current values.
pub fn evaluate(formula: &Formula, record: &Record) -> Value {
    let values: Vec<&Value> = formula
        .columns
        .iter()
        .filter_map(|c| record.get(c))
        .filter(|v| !v.is_null())
        .collect();

    if formula.operation == Operation::Count {
        return Value::from(values.len());
    }
    if formula.operation == Operation::Concat {
        let parts: Vec<String> = values.iter().map(|v| key_repr(v)).collect();
        return Value::from(parts.join(" "));
    }

    let nums: Vec<f64> = values.iter().filter_map(|v| as_number(v)).collect();
    if nums.is_empty() {
        return Value::Null;
    }
    let result = match formula.operation {
        Operation::Sum => nums.iter().sum(),
        Operation::Average => nums.iter().sum::<f64>() / nums.len() as f64,
        Operation::Minimum => nums.iter().cloned().fold(f64::INFINITY, f64::min),
        Operation::Maximum => nums.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        Operation::Count | Operation::Concat => return Value::Null,
    };
    serde_json::Number::from_f64(result)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
