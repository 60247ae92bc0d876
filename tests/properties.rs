//! Property tests over random edit histories.

use lix_engine::{DiffStatus, Engine, EntityKey, LixConfig, NewChange, VersionId};
use proptest::prelude::*;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug)]
struct Edit {
    key: u8,
    value: Option<i64>,
    checkpoint: bool,
}

fn edits() -> impl Strategy<Value = Vec<Edit>> {
    prop::collection::vec(
        (0u8..5, prop::option::of(0i64..100), any::<bool>())
            .prop_map(|(key, value, checkpoint)| Edit { key, value, checkpoint }),
        1..30,
    )
}

fn apply(engine: &mut Engine, edits: &[Edit]) -> BTreeMap<String, i64> {
    let mut model = BTreeMap::new();
    for edit in edits {
        let key = format!("k{}", edit.key);
        let content = edit.value.map(|v| json!({"key": key, "value": v}));
        engine
            .create_change(NewChange::entity(&key, "lix_key_value", content))
            .unwrap();
        match edit.value {
            Some(v) => model.insert(key, v),
            None => model.remove(&key),
        };
        if edit.checkpoint {
            engine.create_checkpoint().unwrap();
        }
    }
    model
}

fn live_values(engine: &mut Engine) -> BTreeMap<String, i64> {
    engine
        .state_of(&VersionId::from("main"), Some("lix_key_value"))
        .unwrap()
        .into_iter()
        .map(|row| {
            let value = row.snapshot_content.as_ref().and_then(|c| c["value"].as_i64()).unwrap();
            (row.entity_id, value)
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_latest_change_wins(edits in edits()) {
        let mut engine = Engine::in_memory(&LixConfig::default()).unwrap();
        let model = apply(&mut engine, &edits);
        prop_assert_eq!(live_values(&mut engine), model.clone());

        // A rebuilt cache resolves the same state from the change log.
        let mut rebuilt = engine.fork(&LixConfig::default()).unwrap();
        prop_assert_eq!(live_values(&mut rebuilt), model);
    }

    #[test]
    fn prop_deletions_share_one_snapshot(edits in edits()) {
        let mut engine = Engine::in_memory(&LixConfig::default()).unwrap();
        apply(&mut engine, &edits);

        let mut tombstone_snapshots = BTreeSet::new();
        for key in 0u8..5 {
            let entity = EntityKey::new(format!("k{key}"), "lix_key_value", "lix");
            for entry in engine.state_history(&entity).unwrap() {
                if entry.change.is_tombstone() {
                    tombstone_snapshots.insert(entry.change.snapshot_id.clone());
                }
            }
        }
        prop_assert!(tombstone_snapshots.len() <= 1);
    }

    #[test]
    fn prop_checkpoint_leaves_nothing_changed(edits in edits()) {
        let mut engine = Engine::in_memory(&LixConfig::default()).unwrap();
        apply(&mut engine, &edits);
        engine.create_checkpoint().unwrap();

        let rows = engine.working_diff(None).unwrap();
        prop_assert!(rows.iter().all(|row| row.status == DiffStatus::Unchanged));
        prop_assert!(rows.iter().all(|row| row.before_change_id == row.after_change_id));

        let main = VersionId::from("main");
        let same = engine.version_diff(&main, &main).unwrap();
        prop_assert!(same.iter().all(|row| row.status == DiffStatus::Unchanged));
    }
}
