//! Forking stores and merging them back.

use lix_engine::plugin::csv::{CsvPlugin, CELL_SCHEMA_KEY};
use lix_engine::{Lix, LixConfig, LixError};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn value_of(lix: &Lix, key: &str) -> Option<serde_json::Value> {
    lix.execute("SELECT value FROM lix_key_value WHERE key = ?", &[json!(key)])
        .unwrap()
        .rows
        .first()
        .map(|row| row[0].clone())
}

fn set(lix: &Lix, key: &str, value: serde_json::Value) {
    lix.execute(
        "INSERT INTO lix_key_value (key, value) VALUES (?, ?)",
        &[json!(key), value],
    )
    .unwrap();
}

#[test]
fn test_fork_diverge_and_merge_both_ways() {
    let ours = Lix::in_memory().unwrap();
    set(&ours, "title", json!("draft"));
    ours.create_checkpoint().unwrap();

    let theirs = ours.fork(LixConfig::default()).unwrap();
    assert_eq!(value_of(&theirs, "title"), Some(json!("draft")));
    assert_eq!(theirs.engine().lix_id(), ours.engine().lix_id());

    set(&theirs, "title", json!("final"));
    set(&theirs, "author", json!("sam"));
    theirs.create_checkpoint().unwrap();

    set(&ours, "reviewed", json!(true));
    ours.create_checkpoint().unwrap();

    let report = ours.merge_from(&theirs).unwrap();
    assert!(!report.fast_forward);
    assert!(report.imported_commits > 0);
    assert!(report.conflicts.is_empty());
    assert_eq!(value_of(&ours, "title"), Some(json!("final")));
    assert_eq!(value_of(&ours, "author"), Some(json!("sam")));
    assert_eq!(value_of(&ours, "reviewed"), Some(json!(true)));

    // The merge commit has both heads as parents.
    let merge_commit = ours.active_version().unwrap().commit_id;
    assert_eq!(ours.engine().database().parents_of(&merge_commit).len(), 2);

    // Theirs catches up by fast-forwarding onto the merge.
    let back = theirs.merge_from(&ours).unwrap();
    assert!(back.fast_forward);
    assert_eq!(back.commit_id, merge_commit);
    assert_eq!(value_of(&theirs, "reviewed"), Some(json!(true)));

    // Merging again is a no-op.
    let again = ours.merge_from(&theirs).unwrap();
    assert_eq!(again.commit_id, merge_commit);
    assert_eq!(again.imported_commits, 0);
}

#[test]
fn test_concurrent_edits_become_conflicts() {
    let ours = Lix::in_memory().unwrap();
    set(&ours, "k", json!(0));
    ours.create_checkpoint().unwrap();

    let theirs = ours.fork(LixConfig::default()).unwrap();
    set(&theirs, "k", json!("theirs"));
    theirs.create_checkpoint().unwrap();
    set(&ours, "k", json!("ours"));
    ours.create_checkpoint().unwrap();

    let report = ours.merge_from(&theirs).unwrap();
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(value_of(&ours, "k"), Some(json!("ours")));

    let result = ours
        .execute("SELECT count(*) AS n FROM conflict WHERE resolved_by IS NULL", &[])
        .unwrap();
    assert_eq!(result.get(0, "n"), Some(&json!(1)));
}

#[test]
fn test_plugin_merges_csv_cells() {
    let setup = |lix: &Lix| {
        lix.engine().register_plugin(Arc::new(CsvPlugin::new())).unwrap();
    };
    let metadata = Some(json!({ "unique_column": "Name" }));

    let ours = Lix::in_memory().unwrap();
    setup(&ours);
    ours.write_file("/people.csv", b"Name,Age\nAnna,20\nPeter,50", metadata.clone())
        .unwrap();
    ours.create_checkpoint().unwrap();

    let theirs = ours.fork(LixConfig::default()).unwrap();
    setup(&theirs);
    theirs
        .write_file("/people.csv", b"Name,Age\nAnna,21\nPeter,50", metadata.clone())
        .unwrap();
    theirs.create_checkpoint().unwrap();

    ours.write_file("/people.csv", b"Name,Age\nAnna,20\nPeter,51", metadata)
        .unwrap();
    ours.create_checkpoint().unwrap();

    let report = ours.merge_from(&theirs).unwrap();
    assert!(report.conflicts.is_empty());
    assert_eq!(
        ours.read_file("/people.csv").unwrap(),
        b"Name,Age\nAnna,21\nPeter,51".to_vec()
    );

    let mut engine = ours.engine();
    let version = engine.active_version_id().unwrap();
    assert_eq!(engine.state_of(&version, Some(CELL_SCHEMA_KEY)).unwrap().len(), 4);
}

#[test]
fn test_file_backed_fork() {
    let dir = TempDir::new().unwrap();
    let source = Lix::open(LixConfig::at(dir.path().join("source.lix"))).unwrap();
    set(&source, "k", json!(1));
    source.create_checkpoint().unwrap();

    let same_path = source.fork(LixConfig::at(dir.path().join("source.lix")));
    assert!(matches!(same_path, Err(LixError::InvalidOperation(_))));

    let fork_path = dir.path().join("fork.lix");
    {
        let fork = source.fork(LixConfig::at(&fork_path)).unwrap();
        set(&fork, "k", json!(2));
        fork.close().unwrap();
    }

    let reopened = Lix::open(LixConfig::at(&fork_path)).unwrap();
    assert_eq!(value_of(&reopened, "k"), Some(json!(2)));
    assert_eq!(value_of(&source, "k"), Some(json!(1)));
}
