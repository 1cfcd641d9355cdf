use datalab::config::{self, ConfigErrorKind, LabConfig};
use datalab::core::StepKind;
use datalab::logs::NotificationBuffer;
use datalab::validator;
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("datalab-docs-{}", Uuid::new_v4()));
    fs::create_dir_all(&dir).expect("Failed to create temp dir");
    dir
}

const ROSTER: &str = r#"
name: Roster
steps:
  - type: datasource
    datasource:
      id: students
      primary: sid
      fields: [sid, name]
      types: { sid: text, name: text }
  - type: datasource
    datasource:
      id: grades
      primary: student
      matching: sid
      fields: [student, name]
      labels: { name: name_1 }
      discrepencies:
        values: { primary: true }
  - type: computed
    computed:
      fields:
        - name: count
          type: number
          formula: { operation: count, columns: [name, name_1] }
"#;

#[test]
fn test_empty_config_means_defaults() {
    let cfg = LabConfig::parse("").expect("Empty config should parse");
    assert_eq!(cfg, LabConfig::default());
    assert_eq!(cfg.notification_capacity, 50);
    assert!(cfg.confirm_destructive);
}

#[test]
fn test_config_rejects_bad_values() {
    let err = LabConfig::parse("version: 2").unwrap_err();
    assert_eq!(err.kind, ConfigErrorKind::Version);

    let err = LabConfig::parse("notification_capacity: 0").unwrap_err();
    assert_eq!(err.kind, ConfigErrorKind::Validation);

    let err = LabConfig::parse("confirm_destructive: [").unwrap_err();
    assert_eq!(err.kind, ConfigErrorKind::Parse);
}

#[test]
fn test_database_path_is_relative_to_config() {
    let dir = temp_dir();
    let path = dir.join("datalab.yaml");
    fs::write(&path, "database: labs.db\nconfirm_destructive: false\n").unwrap();

    let cfg = LabConfig::load(&path).expect("Failed to load config");
    assert_eq!(cfg.database, dir.join("labs.db"));
    assert!(!cfg.confirm_destructive);

    let missing = LabConfig::load_or_default(dir.join("nope.yaml")).unwrap();
    assert_eq!(missing, LabConfig::default());
}

#[test]
fn test_build_document_from_yaml() {
    let build = config::parse_build(ROSTER).expect("Failed to parse build");
    assert_eq!(build.steps.len(), 3);
    assert_eq!(build.steps[2].kind(), StepKind::Computed);
    assert_eq!(build.labels(), vec!["sid", "name", "student", "name_1", "count"]);

    let ds = build.steps[1].as_datasource().unwrap();
    assert_eq!(ds.discrepancies.as_ref().unwrap().values.primary, Some(true));

    // No order in the document: the validator flags it, the session repairs it.
    let report = validator::validate(&build);
    assert!(report.errors.order.is_some());
    let repaired = datalab::order::sync(&build);
    assert!(validator::validate(&repaired).is_valid);

    let dir = temp_dir();
    let out = dir.join("roster.json");
    config::write_build(&out, &repaired).expect("Failed to write build");
    let reread = config::load_build(&out).expect("Failed to reload build");
    assert_eq!(reread, repaired);

    let raw = fs::read_to_string(&out).unwrap();
    assert!(raw.contains("\"discrepencies\""));
}

#[test]
fn test_duplicate_labels_are_reported_where_they_appear() {
    let doc = r#"
name: Roster
steps:
  - type: datasource
    datasource:
      id: students
      primary: sid
      fields: [sid, name]
  - type: datasource
    datasource:
      id: alumni
      primary: sid
      matching: sid
      fields: [sid, year]
  - type: computed
    computed:
      fields:
        - name: year
          type: number
          formula: { operation: sum, columns: [year] }
"#;
    let build = datalab::order::sync(&config::parse_build(doc).expect("Failed to parse build"));
    let report = validator::validate(&build);
    assert!(!report.is_valid);
    assert!(report.errors.steps[0].is_empty());
    let msg = report.errors.steps[1].get("datasource.labels").expect("Missing label error");
    assert!(msg.contains("'sid'"));
    assert!(!msg.contains("'year'"));
    assert!(report.errors.steps[2].contains_key("computed.fields"));

    // Relabelling the second datasource clears its error.
    let fixed = doc.replace("fields: [sid, year]", "fields: [sid, year]\n      labels: { sid: sid_1 }");
    let build = datalab::order::sync(&config::parse_build(&fixed).expect("Failed to parse build"));
    let report = validator::validate(&build);
    assert!(!report.errors.steps[1].contains_key("datasource.labels"));
}

#[test]
fn test_source_rows_must_be_objects() {
    let dir = temp_dir();
    let good = dir.join("rows.json");
    fs::write(&good, r#"[{"sid": "s1"}, {"sid": "s2", "age": 9}]"#).unwrap();
    let rows = config::load_rows(&good).expect("Failed to load rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1]["age"], 9);

    let bad = dir.join("bad.json");
    fs::write(&bad, r#"[{"sid": "s1"}, 3]"#).unwrap();
    let err = config::load_rows(&bad).unwrap_err();
    assert_eq!(err.kind, ConfigErrorKind::Validation);
    assert!(err.to_string().contains("row 1"));

    let err = config::load_rows(dir.join("missing.json")).unwrap_err();
    assert_eq!(err.kind, ConfigErrorKind::Io);
}

#[test]
fn test_notification_buffer_is_bounded() {
    let buffer = NotificationBuffer::new(2);
    buffer.info("one");
    buffer.warn("two");
    buffer.error("three");

    assert_eq!(buffer.messages(), vec!["two", "three"]);
    let reader = buffer.clone();
    assert_eq!(reader.len(), 2);

    let drained = buffer.drain();
    assert_eq!(drained[1].level, log::Level::Error);
    assert!(drained[1].render().contains("three"));
    assert!(reader.is_empty());
}
