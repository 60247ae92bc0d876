//! Error handling and edge case tests.

use lix_engine::{
    ChangeId, CommitId, EntityKey, LabelId, Lix, LixConfig, LixError, NewChange, VersionId,
};
use serde_json::{json, Value};
use std::fs;
use tempfile::TempDir;

fn kv(key: &str, value: Value) -> NewChange {
    NewChange::entity(key, "lix_key_value", Some(json!({"key": key, "value": value})))
}

// --- Store Errors ---

#[test]
fn test_second_open_is_locked() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.lix");
    let _first = Lix::open(LixConfig::at(&path)).unwrap();

    let result = Lix::open(LixConfig::at(&path));
    assert!(matches!(result, Err(LixError::Locked)));
}

#[test]
fn test_open_missing_without_create() {
    let dir = TempDir::new().unwrap();
    let result = Lix::open(LixConfig {
        create_if_missing: false,
        ..LixConfig::at(dir.path().join("absent.lix"))
    });
    assert!(matches!(result, Err(LixError::NotInitialized)));
}

#[test]
fn test_corrupted_image_is_detected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.lix");
    Lix::open(LixConfig::at(&path)).unwrap().close().unwrap();

    let mut bytes = fs::read(&path).unwrap();
    bytes[20] ^= 0xff;
    fs::write(&path, &bytes).unwrap();
    assert!(matches!(
        Lix::open(LixConfig::at(&path)),
        Err(LixError::ChecksumMismatch { .. })
    ));

    fs::write(&path, b"definitely not a store").unwrap();
    assert!(matches!(
        Lix::open(LixConfig::at(&path)),
        Err(LixError::InvalidFormat(_))
    ));
}

// --- Precondition Errors ---

#[test]
fn test_immutable_schema_rejects_updates() {
    let lix = Lix::in_memory().unwrap();
    let schema = json!({
        "x-lix-key": "audit_entry",
        "x-lix-primary-key": ["id"],
        "x-lix-immutable": true,
        "type": "object",
        "properties": {"id": {"type": "string"}, "message": {"type": "string"}},
        "required": ["id", "message"]
    });
    lix.execute(
        "INSERT INTO lix_stored_schema (key, version, value) VALUES ('audit_entry', '1.0', ?)",
        &[schema],
    )
    .unwrap();
    lix.execute("INSERT INTO audit_entry (id, message) VALUES ('a1', 'created')", &[])
        .unwrap();

    let err = lix
        .execute("UPDATE audit_entry SET message = 'edited' WHERE id = 'a1'", &[])
        .unwrap_err();
    assert!(matches!(err, LixError::ImmutableSchemaViolation { .. }));

    let result = lix.execute("SELECT message FROM audit_entry", &[]).unwrap();
    assert_eq!(result.rows, vec![vec![json!("created")]]);
}

#[test]
fn test_schema_validation_rejects_bad_content() {
    let lix = Lix::in_memory().unwrap();
    let err = lix
        .execute(
            "INSERT INTO state_all (entity_id, schema_key, file_id, plugin_key, version_id, snapshot_content) \
             VALUES ('k', 'lix_key_value', 'lix', 'lix_own_entity', 'main', '\"not an object\"')",
            &[],
        )
        .unwrap_err();
    assert!(matches!(err, LixError::SchemaValidation { .. }));
}

#[test]
fn test_direct_changes_are_checked_against_their_schema() {
    let lix = Lix::in_memory().unwrap();
    let mut engine = lix.engine();
    let before = engine.stats().change_count;

    // Declared schema: `value` is required and no other property is allowed.
    let err = engine
        .create_change(NewChange::entity("k", "lix_key_value", Some(json!({"key": "k"}))))
        .unwrap_err();
    assert!(matches!(err, LixError::SchemaValidation { .. }));
    let err = engine
        .create_change(NewChange::entity(
            "k",
            "lix_key_value",
            Some(json!({"key": "k", "value": 1, "extra": true})),
        ))
        .unwrap_err();
    assert!(matches!(err, LixError::SchemaValidation { .. }));

    let err = engine
        .create_change(NewChange::entity("x", "unknown_schema", Some(json!({"a": 1}))))
        .unwrap_err();
    assert!(matches!(err, LixError::SchemaNotFound(_)));
    assert_eq!(engine.stats().change_count, before);
}

#[test]
fn test_direct_changes_respect_immutable_schemas() {
    let lix = Lix::in_memory().unwrap();
    let mut engine = lix.engine();
    let stored = |value: Value| {
        NewChange::entity(
            "note~1.0",
            "lix_stored_schema",
            Some(json!({"key": "note", "version": "1.0", "value": value})),
        )
    };
    let definition = json!({
        "x-lix-key": "note",
        "x-lix-version": "1.0",
        "x-lix-primary-key": ["id"],
        "type": "object",
        "properties": {"id": {"type": "string"}, "body": {"type": "string"}},
        "required": ["id"]
    });
    engine.create_change(stored(definition)).unwrap();

    let err = engine.create_change(stored(json!({"changed": true}))).unwrap_err();
    assert!(matches!(err, LixError::ImmutableSchemaViolation { .. }));

    // The stored schema is resolvable for direct writes and validates them.
    engine
        .create_change(NewChange::entity("n1", "note", Some(json!({"id": "n1", "body": "hi"}))))
        .unwrap();
    let err = engine
        .create_change(NewChange::entity("n2", "note", Some(json!({"id": "n2", "body": 5}))))
        .unwrap_err();
    assert!(matches!(err, LixError::SchemaValidation { .. }));
}

#[test]
fn test_sql_errors() {
    let lix = Lix::in_memory().unwrap();
    assert!(matches!(
        lix.execute("SELECT FROM lix_key_value", &[]),
        Err(LixError::SqlParse { .. })
    ));
    assert!(matches!(
        lix.execute("SELECT * FROM nowhere", &[]),
        Err(LixError::Sql(_))
    ));
    assert!(matches!(
        lix.execute("INSERT INTO lix_version (id, name) VALUES ('v', 'v')", &[]),
        Err(LixError::InvalidOperation(_))
    ));
}

#[test]
fn test_foreign_keys_on_labels() {
    let lix = Lix::in_memory().unwrap();
    let mut engine = lix.engine();
    let label = engine.create_label("flag").unwrap();

    let err = engine
        .add_label(&EntityKey::new("ghost", "lix_key_value", "lix"), &label.id)
        .unwrap_err();
    assert!(matches!(err, LixError::ForeignKeyViolation { .. }));

    engine.create_change(kv("real", json!(1))).unwrap();
    let err = engine
        .add_label(
            &EntityKey::new("real", "lix_key_value", "lix"),
            &LabelId::from("no-such-label"),
        )
        .unwrap_err();
    assert!(matches!(err, LixError::ForeignKeyViolation { .. }));
}

#[test]
fn test_lookup_errors() {
    let lix = Lix::in_memory().unwrap();
    assert!(matches!(
        lix.switch_version(&VersionId::from("nope")),
        Err(LixError::VersionNotFound(_))
    ));
    assert!(matches!(
        lix.transition(&CommitId::from("nope")),
        Err(LixError::CommitNotFound(_))
    ));
    assert!(matches!(
        lix.read_file("/missing.txt"),
        Err(LixError::FileNotFound(_))
    ));
    assert!(matches!(
        lix.engine().change(&ChangeId::from("nope")),
        Err(LixError::ChangeNotFound(_))
    ));
}

#[test]
fn test_failed_transaction_leaves_no_trace() {
    let lix = Lix::in_memory().unwrap();
    let before = lix.stats();

    let result: lix_engine::Result<()> = lix.transaction(|engine| {
        engine.create_change(kv("a", json!(1)))?;
        engine.create_checkpoint()?;
        Err(LixError::InvalidOperation("abort".into()))
    });
    assert!(result.is_err());
    let after = lix.stats();
    assert_eq!(after.change_count, before.change_count);
    assert_eq!(after.commit_count, before.commit_count);
    assert_eq!(after.change_set_count, before.change_set_count);
    assert_eq!(after.snapshot_count, before.snapshot_count);
}

// --- Merge Errors ---

#[test]
fn test_merge_preconditions() {
    let ours = Lix::in_memory().unwrap();
    let stranger = Lix::in_memory().unwrap();
    assert!(matches!(
        ours.merge_from(&stranger),
        Err(LixError::NoCommonAncestor { .. })
    ));

    let theirs = ours.fork(LixConfig::default()).unwrap();
    theirs.engine().create_change(kv("dirty", json!(true))).unwrap();
    assert!(matches!(
        ours.merge_from(&theirs),
        Err(LixError::UncommittedChanges(_))
    ));
}

#[test]
fn test_conflict_resolution_preconditions() {
    let ours = Lix::in_memory().unwrap();
    ours.engine().create_change(kv("k", json!(0))).unwrap();
    ours.create_checkpoint().unwrap();

    let theirs = ours.fork(LixConfig::default()).unwrap();
    theirs.engine().create_change(kv("k", json!("theirs"))).unwrap();
    theirs.create_checkpoint().unwrap();
    ours.engine().create_change(kv("k", json!("ours"))).unwrap();
    ours.create_checkpoint().unwrap();

    let report = ours.merge_from(&theirs).unwrap();
    assert_eq!(report.conflicts.len(), 1);
    let conflict = report.conflicts[0].clone();

    let mut engine = ours.engine();
    let outsider = engine.create_change(kv("other", json!(1))).unwrap();
    let err = engine
        .resolve_conflict_with_new_change(&conflict.id, None, kv("k", json!("both")), &[outsider.id])
        .unwrap_err();
    assert!(matches!(err, LixError::ChangeNotDirectChildOfConflict { .. }));

    let err = engine
        .resolve_conflict_with_new_change(
            &conflict.id,
            Some(conflict.change_id.clone()),
            kv("k", json!("both")),
            &[conflict.change_id.clone()],
        )
        .unwrap_err();
    assert!(matches!(err, LixError::ChangeAlreadyExists(_)));

    let foreign = kv("k", json!("both")).with_file("other-file", "lix_own_entity");
    let err = engine
        .resolve_conflict_with_new_change(&conflict.id, None, foreign, &[conflict.change_id.clone()])
        .unwrap_err();
    assert!(matches!(err, LixError::ChangeDoesNotBelongToFile { .. }));

    let resolved = engine
        .resolve_conflict_with_new_change(
            &conflict.id,
            None,
            kv("k", json!("both")),
            &[conflict.change_id.clone(), conflict.conflicting_change_id.clone()],
        )
        .unwrap();
    assert!(engine.unresolved_conflicts().is_empty());
    let row = engine
        .get_entity(
            &VersionId::from("main"),
            &EntityKey::new("k", "lix_key_value", "lix"),
        )
        .unwrap()
        .unwrap();
    assert_eq!(row.change_id, resolved.id);
}
