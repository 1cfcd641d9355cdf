use datalab::config::LabConfig;
use datalab::core::{
    Build, ComputedField, Discrepancies, FieldType, Operation, Resolution, StepKind,
};
use datalab::session::{FixedPrompter, JoinOutcome, LabSession};
use datalab::steps::{self, StepEdit};
use datalab::store::{evaluate, key_mismatches, LocalServer, Record, SourceRow};
use datalab::transport::DataLabServer;
use serde_json::{json, Value};
use std::path::PathBuf;
use uuid::Uuid;

fn temp_db() -> PathBuf {
    std::env::temp_dir().join(format!("datalab-test-{}.db", Uuid::new_v4()))
}

fn rows(value: Value) -> Vec<SourceRow> {
    serde_json::from_value(value).unwrap()
}

fn seeded() -> LocalServer {
    let server = LocalServer::open(temp_db()).unwrap();
    server
        .put_source(
            "students",
            "Students",
            &rows(json!([
                { "sid": "s1", "name": "Ann" },
                { "sid": "s2", "name": "Bob" },
                { "sid": "s3", "name": "Cy" }
            ])),
        )
        .unwrap();
    server
        .put_source(
            "grades",
            "Grades",
            &rows(json!([
                { "student": "s1", "grade": 90 },
                { "student": "s2", "grade": 80 },
                { "student": "s9", "grade": 70 }
            ])),
        )
        .unwrap();
    server
}

fn apply(build: Build, step: usize, edit: StepEdit) -> Build {
    steps::update_step_field(&build, step, edit).unwrap()
}

fn field(build: Build, step: usize, name: &str, field_type: FieldType) -> Build {
    apply(
        build,
        step,
        StepEdit::AddField {
            field: name.into(),
            field_type,
        },
    )
}

/// students joined with grades on sid, with an optional stored resolution.
fn joined(values: Option<Resolution>) -> Build {
    let b = steps::add_step(&Build::new("Grades"), StepKind::Datasource).unwrap();
    let b = apply(b, 0, StepEdit::SetSource("students".into()));
    let b = apply(b, 0, StepEdit::SetPrimary("sid".into()));
    let b = field(b, 0, "sid", FieldType::Text);
    let b = field(b, 0, "name", FieldType::Text);

    let b = steps::add_step(&b, StepKind::Datasource).unwrap();
    let b = apply(b, 1, StepEdit::SetSource("grades".into()));
    let b = apply(b, 1, StepEdit::SetPrimary("student".into()));
    let b = field(b, 1, "grade", FieldType::Number);
    let mut b = apply(b, 1, StepEdit::SetMatching(Some("sid".into())));
    if let Some(values) = values {
        b.steps[1].as_datasource_mut().unwrap().discrepancies = Some(Discrepancies { values });
    }
    b
}

fn by_sid(records: &[Record]) -> Vec<(String, Value)> {
    let mut out: Vec<(String, Value)> = records
        .iter()
        .map(|r| {
            let sid = r.get("sid").and_then(|v| v.as_str()).unwrap_or("").to_string();
            (sid, r.get("grade").cloned().unwrap_or(Value::Null))
        })
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

#[test]
fn sources_round_trip_with_inferred_types() {
    let server = seeded();
    let listed = server.list_sources().unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, "grades");
    assert_eq!(listed[0].rows, 3);

    let fields = server.source_fields("grades").unwrap();
    assert_eq!(fields.get("grade"), Some(&FieldType::Number));
    assert_eq!(fields.get("student"), Some(&FieldType::Text));
    assert!(server.source_rows("missing").is_err());
}

#[test]
fn key_mismatches_reports_both_sides() {
    let records: Vec<Record> = vec![
        [("sid".to_string(), json!("s1"))].into_iter().collect(),
        [("sid".to_string(), json!("s3"))].into_iter().collect(),
        [("sid".to_string(), Value::Null)].into_iter().collect(),
    ];
    let incoming = vec![
        (json!("s1"), Record::new()),
        (json!("s9"), Record::new()),
    ];
    let report = key_mismatches(&records, &incoming, "sid");
    assert_eq!(report.primary, Some(vec![json!("s9")]));
    assert_eq!(report.matching, Some(vec![json!("s3")]));

    // Numbers and numeric strings are the same key.
    let records: Vec<Record> = vec![[("sid".to_string(), json!(7))].into_iter().collect()];
    let incoming = vec![(json!("7"), Record::new())];
    assert!(key_mismatches(&records, &incoming, "sid").is_empty());
}

#[tokio::test]
async fn discrepancy_check_uses_the_partial_build() {
    let server = seeded();
    let build = joined(None);
    let report = server
        .check_discrepancies(&build.partial(1), &build.steps[1])
        .await
        .unwrap();
    assert_eq!(report.primary, Some(vec![json!("s9")]));
    assert_eq!(report.matching, Some(vec![json!("s3")]));
}

#[test]
fn default_join_keeps_build_records_and_drops_new_ones() {
    let server = seeded();
    let records = server.rows(&joined(None)).unwrap();
    assert_eq!(
        by_sid(&records),
        vec![
            ("s1".to_string(), json!(90)),
            ("s2".to_string(), json!(80)),
            ("s3".to_string(), Value::Null),
        ]
    );
}

#[test]
fn resolution_policies_shape_the_join() {
    let server = seeded();
    let records = server
        .rows(&joined(Some(Resolution::new(Some(true), Some(false)))))
        .unwrap();
    assert_eq!(
        by_sid(&records),
        vec![
            ("s1".to_string(), json!(90)),
            ("s2".to_string(), json!(80)),
            ("s9".to_string(), json!(70)),
        ]
    );
    let added = records.iter().find(|r| r["sid"] == json!("s9")).unwrap();
    assert_eq!(added["name"], Value::Null);
}

#[test]
fn computed_fields_are_evaluated_per_row() {
    let server = seeded();
    let b = joined(None);
    let b = steps::add_step(&b, StepKind::Computed).unwrap();
    let b = apply(
        b,
        2,
        StepEdit::AddComputedField(ComputedField::new(
            "bonus",
            Operation::Sum,
            vec!["grade".into()],
        )),
    );
    let records = server.rows(&b).unwrap();
    let s1 = records.iter().find(|r| r["sid"] == json!("s1")).unwrap();
    assert_eq!(s1["bonus"], json!(90.0));
    let s3 = records.iter().find(|r| r["sid"] == json!("s3")).unwrap();
    assert_eq!(s3["bonus"], Value::Null);

    let rec: Record = [
        ("a".to_string(), json!(2)),
        ("b".to_string(), json!("4")),
        ("c".to_string(), Value::Null),
    ]
    .into_iter()
    .collect();
    let formula = |operation| ComputedField::new("x", operation, vec!["a".into(), "b".into(), "c".into()]).formula;
    assert_eq!(evaluate(&formula(Operation::Average), &rec), json!(3.0));
    assert_eq!(evaluate(&formula(Operation::Maximum), &rec), json!(4.0));
    assert_eq!(evaluate(&formula(Operation::Count), &rec), json!(2));
    assert_eq!(evaluate(&formula(Operation::Concat), &rec), json!("2 4"));
}

#[tokio::test]
async fn uniqueness_is_checked_against_joined_rows() {
    let server = seeded();
    server
        .put_source(
            "enrollments",
            "Enrollments",
            &rows(json!([
                { "row": 1, "course": "math" },
                { "row": 2, "course": "math" }
            ])),
        )
        .unwrap();
    let b = steps::add_step(&Build::new("E"), StepKind::Datasource).unwrap();
    let b = apply(b, 0, StepEdit::SetSource("enrollments".into()));
    let b = apply(b, 0, StepEdit::SetPrimary("row".into()));
    let b = field(b, 0, "row", FieldType::Number);
    let b = field(b, 0, "course", FieldType::Text);

    assert!(server.check_uniqueness(&b, "row").await.unwrap().is_unique);
    assert!(!server.check_uniqueness(&b, "course").await.unwrap().is_unique);
    assert!(server.check_uniqueness(&b, "nope").await.is_err());
}

#[tokio::test]
async fn saved_builds_are_listed_and_reloaded() {
    let server = seeded();
    let build = joined(Some(Resolution::new(None, Some(true))));

    let saved = server.save_build(&build).await.unwrap();
    let again = server
        .save_build(&Build {
            id: Some(saved.id),
            ..build.clone()
        })
        .await
        .unwrap();
    assert_eq!(again.id, saved.id);
    // Unchanged documents are not rewritten.
    assert_eq!(
        again.updated_at.timestamp_millis(),
        saved.updated_at.timestamp_millis()
    );

    let listed = server.list_datalabs().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "Grades");

    let loaded = server.load_datalab(&saved.id).unwrap();
    assert_eq!(loaded.id, Some(saved.id));
    assert_eq!(loaded.steps, build.steps);
    assert!(server.load_datalab(&Uuid::new_v4()).is_err());
}

#[tokio::test]
async fn session_end_to_end_against_sqlite() {
    let prompter = FixedPrompter {
        resolution: Some(Resolution::new(Some(true), Some(false))),
    };
    let mut s = LabSession::create("Roster", seeded(), prompter, &LabConfig::default());

    let first = s.add_step(StepKind::Datasource).unwrap();
    s.edit(first, StepEdit::SetSource("students".into())).await.unwrap();
    s.edit(first, StepEdit::SetPrimary("sid".into())).await.unwrap();
    for f in ["sid", "name"] {
        s.edit(
            first,
            StepEdit::AddField {
                field: f.into(),
                field_type: FieldType::Text,
            },
        )
        .await
        .unwrap();
    }

    let second = s.add_step(StepKind::Datasource).unwrap();
    s.edit(second, StepEdit::SetSource("grades".into())).await.unwrap();
    s.edit(second, StepEdit::SetPrimary("student".into())).await.unwrap();
    s.edit(
        second,
        StepEdit::AddField {
            field: "grade".into(),
            field_type: FieldType::Number,
        },
    )
    .await
    .unwrap();

    let out = s.choose_matching_field(second, "sid".into()).await.unwrap();
    assert_eq!(
        out,
        JoinOutcome::Resolved(Resolution::new(Some(true), Some(false)))
    );
    assert!(s.errors().is_empty(), "{:?}", s.errors().lines());

    let saved = s.save().await.unwrap();
    assert!(s.is_closed());

    let loaded = s.server().load_datalab(&saved.id).unwrap();
    let records = s.server().rows(&loaded).unwrap();
    let sids: Vec<String> = by_sid(&records).into_iter().map(|(sid, _)| sid).collect();
    assert_eq!(sids, vec!["s1", "s2", "s9"]);
}
