//! Version inheritance: closeness, copy-down on delete and cycle safety.

use lix_engine::{
    CreateVersion, Engine, EntityKey, LixConfig, LixError, NewChange, VersionId, GLOBAL_VERSION_ID,
};
use serde_json::{json, Value};

fn engine() -> Engine {
    Engine::in_memory(&LixConfig::default()).unwrap()
}

fn kv(key: &str, value: Option<Value>) -> NewChange {
    NewChange::entity(
        key,
        "lix_key_value",
        value.map(|v| json!({"key": key, "value": v})),
    )
}

fn key(entity: &str) -> EntityKey {
    EntityKey::new(entity, "lix_key_value", "lix")
}

fn child_of(engine: &mut Engine, parent: &str, id: &str) -> VersionId {
    engine
        .create_version(CreateVersion::new(id).id(id).inherits_from(parent))
        .unwrap()
        .id
}

#[test]
fn test_closest_version_wins() {
    let mut engine = engine();
    let main = VersionId::from("main");
    let feature = child_of(&mut engine, "main", "feature");
    let nested = child_of(&mut engine, "feature", "nested");

    engine
        .create_change_in(&VersionId::from(GLOBAL_VERSION_ID), kv("e", Some(json!("global"))))
        .unwrap();
    engine.create_change_in(&main, kv("e", Some(json!("main")))).unwrap();
    engine
        .create_change_in(&feature, kv("e", Some(json!("feature"))))
        .unwrap();

    let row = engine.get_entity(&nested, &key("e")).unwrap().unwrap();
    assert_eq!(row.snapshot_content.unwrap()["value"], json!("feature"));
    assert_eq!(row.inherited_from_version_id, Some(feature.clone()));

    let row = engine.get_entity(&feature, &key("e")).unwrap().unwrap();
    assert_eq!(row.snapshot_content.unwrap()["value"], json!("feature"));
    assert_eq!(row.inherited_from_version_id, None);

    let row = engine.get_entity(&main, &key("e")).unwrap().unwrap();
    assert_eq!(row.snapshot_content.unwrap()["value"], json!("main"));
}

#[test]
fn test_own_tombstone_hides_inherited_state() {
    let mut engine = engine();
    let main = VersionId::from("main");
    let feature = child_of(&mut engine, "main", "feature");

    engine.create_change_in(&main, kv("e", Some(json!(1)))).unwrap();
    assert!(engine.get_entity(&feature, &key("e")).unwrap().is_some());

    engine.create_change_in(&feature, kv("e", None)).unwrap();
    assert!(engine.get_entity(&feature, &key("e")).unwrap().is_none());
    assert!(engine.get_entity(&main, &key("e")).unwrap().is_some());
}

#[test]
fn test_batch_delete_copies_state_into_children() {
    let mut engine = engine();
    let main = VersionId::from("main");
    let children: Vec<VersionId> = (0..10)
        .map(|i| child_of(&mut engine, "main", &format!("child{i}")))
        .collect();

    engine
        .transaction(|engine| {
            for i in 0..20 {
                engine.create_change_in(&main, kv(&format!("e{i}"), Some(json!(i))))?;
            }
            Ok(())
        })
        .unwrap();

    engine
        .transaction(|engine| {
            for i in 0..20 {
                engine.create_change_in(&main, kv(&format!("e{i}"), None))?;
            }
            Ok(())
        })
        .unwrap();

    assert!(engine.state_of(&main, Some("lix_key_value")).unwrap().is_empty());
    for child in &children {
        let rows = engine.state_of(child, Some("lix_key_value")).unwrap();
        assert_eq!(rows.len(), 20, "child {child}");
        assert!(rows.iter().all(|row| row.inherited_from_version_id.is_none()));
        assert_eq!(engine.working_change_set(child).unwrap().len(), 20);
    }

    // A rebuilt cache agrees: the copies live in the change log.
    let mut rebuilt = engine.fork(&LixConfig::default()).unwrap();
    for child in &children {
        let rows = rebuilt.state_of(child, Some("lix_key_value")).unwrap();
        assert_eq!(rows.len(), 20, "rebuilt child {child}");
    }
}

#[test]
fn test_delete_after_transition_in_same_transaction_copies_down() {
    let mut engine = engine();
    let main = VersionId::from("main");
    let global = VersionId::from(GLOBAL_VERSION_ID);

    engine.create_change_in(&global, kv("shared", Some(json!(1)))).unwrap();
    let cp0 = engine.create_checkpoint().unwrap();
    engine.create_change_in(&main, kv("local", Some(json!(1)))).unwrap();
    engine.create_checkpoint().unwrap();

    // The transition leaves the cache stale; the delete must still reach main.
    engine
        .transaction(|engine| {
            engine.transition(&cp0.id)?;
            engine.create_change_in(&global, kv("shared", None))?;
            Ok(())
        })
        .unwrap();

    assert!(engine.get_entity(&global, &key("shared")).unwrap().is_none());
    let row = engine.get_entity(&main, &key("shared")).unwrap().unwrap();
    assert_eq!(row.snapshot_content.unwrap()["value"], json!(1));
    assert!(engine.get_entity(&main, &key("local")).unwrap().is_none());

    let mut rebuilt = engine.fork(&LixConfig::default()).unwrap();
    assert!(rebuilt.get_entity(&main, &key("shared")).unwrap().is_some());
}

#[test]
fn test_child_override_survives_parent_delete() {
    let mut engine = engine();
    let main = VersionId::from("main");
    let child = child_of(&mut engine, "main", "child");

    engine.create_change_in(&main, kv("e", Some(json!("parent")))).unwrap();
    engine.create_change_in(&child, kv("e", Some(json!("child")))).unwrap();
    engine.create_change_in(&main, kv("e", None)).unwrap();

    let row = engine.get_entity(&child, &key("e")).unwrap().unwrap();
    assert_eq!(row.snapshot_content.unwrap()["value"], json!("child"));
}

#[test]
fn test_inheritance_cycles_are_rejected() {
    let mut engine = engine();
    let a = child_of(&mut engine, "main", "a");
    let b = child_of(&mut engine, "a", "b");

    let err = engine.set_inherits_from(&a, Some(b.clone())).unwrap_err();
    assert!(matches!(err, LixError::InvalidOperation(_)));
    let err = engine.set_inherits_from(&a, Some(a.clone())).unwrap_err();
    assert!(matches!(err, LixError::InvalidOperation(_)));

    // Re-parenting without a cycle is fine and takes effect.
    engine
        .create_change_in(&VersionId::from("main"), kv("m", Some(json!(1))))
        .unwrap();
    assert!(engine.get_entity(&b, &key("m")).unwrap().is_some());
    engine.set_inherits_from(&a, None).unwrap();
    assert!(engine.get_entity(&b, &key("m")).unwrap().is_none());
}

#[test]
fn test_version_lifecycle() {
    let mut engine = engine();
    let parent = child_of(&mut engine, "main", "parent");
    let child = child_of(&mut engine, "parent", "child");

    assert!(matches!(
        engine.delete_version(&parent),
        Err(LixError::InvalidOperation(_))
    ));
    assert!(matches!(
        engine.delete_version(&VersionId::from(GLOBAL_VERSION_ID)),
        Err(LixError::InvalidOperation(_))
    ));

    engine.switch_version(&child).unwrap();
    assert!(matches!(
        engine.delete_version(&child),
        Err(LixError::InvalidOperation(_))
    ));
    engine.switch_version(&VersionId::from("main")).unwrap();
    engine.delete_version(&child).unwrap();
    engine.delete_version(&parent).unwrap();

    let names: Vec<String> = engine.list_versions().into_iter().map(|v| v.name).collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"main".to_string()));

    engine.rename_version(&VersionId::from("main"), "trunk").unwrap();
    assert_eq!(engine.active_version().unwrap().name, "trunk");
}
