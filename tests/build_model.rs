mod common;

use common::{add_field, datasource, edit, two_sources};
use datalab::core::{Build, ComputedField, FieldType, FormField, Operation, Step, StepKind};
use datalab::dependency::{self, DependencyRole};
use datalab::labels::LabelNamespace;
use datalab::order;
use datalab::steps::{self, StepEdit};
use datalab::validator;

#[test]
fn label_namespace_suffixes_colliding_source_fields() {
    let b = two_sources();
    assert_eq!(datasource(&b, 0).label_of("name"), "name");
    assert_eq!(datasource(&b, 1).label_of("name"), "name_1");

    let ns = LabelNamespace::of(&b);
    assert!(ns.is_used("name_1"));
    assert_eq!(ns.reserve("name"), "name_2");
    assert_eq!(ns.reserve("fresh"), "fresh");
}

#[test]
fn anchor_rule_rejects_form_on_empty_build() {
    let empty = Build::new("Roster");
    for kind in [StepKind::Form, StepKind::Computed] {
        let err = steps::add_step(&empty, kind).unwrap_err();
        assert!(err.is_structural());
    }
    assert!(empty.steps.is_empty());

    let b = steps::add_step(&empty, StepKind::Datasource).unwrap();
    let b = steps::add_step(&b, StepKind::Form).unwrap();
    assert_eq!(b.steps[1].kind(), StepKind::Form);
}

#[test]
fn remove_last_step_only_touches_the_tail() {
    let b = two_sources();
    let b = steps::add_step(&b, StepKind::Form).unwrap();
    let b = edit(&b, 2, StepEdit::AddFormField(FormField::text("comment")));
    let b = validator::with_errors(b);
    assert_eq!(b.steps.len(), 3);
    assert_eq!(b.errors.steps.len(), 3);

    let after = steps::remove_last_step(&b).unwrap();
    assert_eq!(after.steps.len(), 2);
    assert_eq!(after.steps[0], b.steps[0]);
    assert_eq!(after.steps[1], b.steps[1]);
    assert_eq!(after.errors.steps.len(), 2);
    assert!(after.order.iter().all(|e| e.step_index < 2));
    assert!(order::is_consistent(&after));

    let empty = steps::remove_last_step(&steps::remove_last_step(&after).unwrap()).unwrap();
    assert!(steps::remove_last_step(&empty).is_err());
}

#[test]
fn order_tracks_every_field_through_a_sequence_of_edits() {
    let mut b = two_sources();
    assert!(order::is_consistent(&b));

    b = edit(&b, 1, StepEdit::RemoveField("name".into()));
    assert!(order::is_consistent(&b));
    b = add_field(&b, 1, "section");
    assert!(order::is_consistent(&b));

    b = steps::add_step(&b, StepKind::Computed).unwrap();
    b = edit(
        &b,
        2,
        StepEdit::AddComputedField(ComputedField::new(
            "total",
            Operation::Sum,
            vec!["grade".into()],
        )),
    );
    assert!(order::is_consistent(&b));

    b = edit(
        &b,
        2,
        StepEdit::UpdateComputedField {
            name: "total".into(),
            field: ComputedField::new("score", Operation::Sum, vec!["grade".into()]),
        },
    );
    assert!(order::is_consistent(&b));
    assert!(b.order.iter().any(|e| e.field == "score"));

    b = steps::remove_last_step(&b).unwrap();
    assert!(order::is_consistent(&b));
    // sid, name | student, grade, section
    assert_eq!(b.order.len(), 5);
}

#[test]
fn changing_source_clears_the_step_and_its_columns() {
    let b = two_sources();
    let b = edit(&b, 1, StepEdit::SetMatching(Some("sid".into())));
    let b = edit(&b, 1, StepEdit::SetSource("attendance".into()));

    let ds = datasource(&b, 1);
    assert_eq!(ds.id.as_deref(), Some("attendance"));
    assert!(ds.primary.is_none());
    assert!(ds.matching.is_none());
    assert!(ds.fields.is_empty());
    assert!(ds.labels.is_empty());
    assert!(b.order.iter().all(|e| e.step_index == 0));
    assert!(order::is_consistent(&b));
}

#[test]
fn referenced_fields_cannot_be_renamed_or_removed() {
    let b = two_sources();
    let b = edit(&b, 1, StepEdit::SetMatching(Some("sid".into())));

    assert!(dependency::has_dependency(&b, 0, "sid"));
    assert!(!dependency::has_dependency(&b, 0, "name"));
    let deps = dependency::dependents(&b, 0, "sid");
    assert_eq!(deps[0].step_index, 1);
    assert_eq!(deps[0].role, DependencyRole::Matching);

    let removal = steps::update_step_field(&b, 0, StepEdit::RemoveField("sid".into()));
    assert!(removal.unwrap_err().is_structural());
    let rename = steps::update_step_field(
        &b,
        0,
        StepEdit::RenameLabel {
            field: "sid".into(),
            label: "student_id".into(),
        },
    );
    assert!(rename.is_err());
    let swap = steps::update_step_field(&b, 0, StepEdit::SetSource("other".into()));
    assert!(swap.is_err());

    // Unreferenced fields are still free.
    let b2 = edit(&b, 0, StepEdit::RemoveField("name".into()));
    assert!(!datasource(&b2, 0).fields.contains(&"name".to_string()));
}

#[test]
fn dependency_follows_label_indirection_into_forms() {
    let b = two_sources();
    let b = edit(
        &b,
        0,
        StepEdit::RenameLabel {
            field: "name".into(),
            label: "full_name".into(),
        },
    );
    let b = steps::add_step(&b, StepKind::Form).unwrap();
    let b = edit(&b, 2, StepEdit::SetFormPrimary(Some("sid".into())));
    let b = edit(&b, 2, StepEdit::SetVisibleFields(vec!["full_name".into()]));
    let b = edit(&b, 2, StepEdit::SetPermission(Some("name_1".into())));

    assert!(dependency::has_dependency(&b, 0, "sid"));
    assert!(dependency::has_dependency(&b, 0, "name"));
    assert!(dependency::has_dependency(&b, 1, "name"));
    assert!(!dependency::has_dependency(&b, 1, "grade"));
    // Dependencies only point backward.
    assert!(!dependency::has_dependency(&b, 2, "sid"));
}

#[test]
fn structural_errors_for_collisions_and_forward_references() {
    let b = two_sources();
    let clash = steps::update_step_field(
        &b,
        1,
        StepEdit::RenameLabel {
            field: "grade".into(),
            label: "name".into(),
        },
    );
    assert!(clash.is_err());

    let b = steps::add_step(&b, StepKind::Form).unwrap();
    let dup = steps::update_step_field(&b, 2, StepEdit::AddFormField(FormField::text("grade")));
    assert!(dup.is_err());

    let wrong_kind = steps::update_step_field(&b, 2, StepEdit::SetPrimary("x".into()));
    assert!(wrong_kind.is_err());

    // Step 1 cannot match against its own fields.
    let forward = steps::update_step_field(&b, 1, StepEdit::SetMatching(Some("grade".into())));
    assert!(forward.is_err());
    let anchor = steps::update_step_field(&b, 0, StepEdit::SetMatching(Some("sid".into())));
    assert!(anchor.is_err());
}

#[test]
fn validator_requires_a_name() {
    let b = Build::new("");
    let b = steps::add_step(&b, StepKind::Datasource).unwrap();
    let b = edit(&b, 0, StepEdit::SetSource("students".into()));
    let b = edit(&b, 0, StepEdit::SetPrimary("a".into()));
    let b = add_field(&b, 0, "a");

    let report = validator::validate(&b);
    assert!(!report.is_valid);
    assert!(report.errors.name.is_some());
    assert!(report.errors.steps[0].is_empty());

    let named = Build {
        name: "Roster".into(),
        ..b
    };
    let report = validator::validate(&named);
    assert!(report.is_valid, "{:?}", report.errors);
}

#[test]
fn validator_reports_per_step_paths() {
    let b = two_sources();
    let b = steps::add_step(&b, StepKind::Form).unwrap();
    let b = edit(
        &b,
        2,
        StepEdit::SetActiveFrom(Some("2024-05-02T00:00:00Z".parse().unwrap())),
    );
    let b = edit(
        &b,
        2,
        StepEdit::SetActiveTo(Some("2024-05-01T00:00:00Z".parse().unwrap())),
    );

    let errors = validator::validate(&b).errors;
    assert!(errors.steps[0].is_empty());
    assert!(errors.steps[1].contains_key("datasource.matching"));
    for path in ["form.primary", "form.name", "form.fields", "form.activeTo"] {
        assert!(errors.steps[2].contains_key(path), "missing {path}");
    }
}

#[test]
fn columns_put_pinned_first_and_skip_hidden() {
    let b = two_sources();
    let b = order::set_pinned(&b, "grade", true).unwrap();
    let b = order::set_visible(&b, "name_1", false).unwrap();
    let b = order::move_field(&b, 0, 1).unwrap();

    let labels: Vec<String> = order::columns(&b).into_iter().map(|c| c.label).collect();
    assert_eq!(labels, vec!["grade", "name", "sid", "student"]);
    assert!(order::is_consistent(&b));
    assert!(order::move_field(&b, 0, 99).is_err());
    assert!(order::set_visible(&b, "nope", true).is_err());
}

#[test]
fn sync_repairs_orphans_and_missing_entries() {
    let mut b = two_sources();
    b.order.remove(0);
    b.order.push(datalab::core::OrderEntry::new(7, "ghost"));
    assert!(!order::is_consistent(&b));
    let fixed = order::sync(&b);
    assert!(order::is_consistent(&fixed));
}

#[test]
fn steps_serialize_with_type_tag_and_payload_key() {
    let b = two_sources();
    let json = serde_json::to_value(&b.steps[0]).unwrap();
    assert_eq!(json["type"], "datasource");
    assert_eq!(json["datasource"]["id"], "students");
    assert_eq!(json["datasource"]["types"]["sid"], "text");

    let form: Step = serde_json::from_value(serde_json::json!({
        "type": "form",
        "form": {
            "name": "Feedback",
            "primary": "sid",
            "fields": [
                { "name": "mark", "type": "number", "min": 0.0, "max": 10.0 },
                { "name": "seen", "type": "checkbox" }
            ],
            "webForm": { "active": true, "visibleFields": ["name"] }
        }
    }))
    .unwrap();
    assert_eq!(form.fields(), vec!["mark", "seen"]);
    assert_eq!(form.field_type("mark"), Some(FieldType::Number));
    assert_eq!(form.field_type("seen"), Some(FieldType::Boolean));
}
