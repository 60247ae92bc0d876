//! Deterministic mode: reproducible ids, timestamps and random draws.

use lix_engine::deterministic::{RNG_STATE_KEY, SEQUENCE_KEY};
use lix_engine::storage::encode_image;
use lix_engine::{DeterministicConfig, Lix, LixConfig};
use serde_json::json;
use tempfile::TempDir;

fn seeded() -> LixConfig {
    LixConfig {
        deterministic: Some(DeterministicConfig::seeded("replay")),
        lix_id: Some("replay-store".to_string()),
        ..LixConfig::default()
    }
}

fn workload(lix: &Lix) {
    lix.execute(
        "INSERT INTO lix_key_value (key, value) VALUES ('a', 1), ('b', lix_random())",
        &[],
    )
    .unwrap();
    lix.create_checkpoint().unwrap();
    lix.execute("UPDATE lix_key_value SET value = lix_uuid_v7() WHERE key = 'a'", &[])
        .unwrap();
}

#[test]
fn test_same_seed_same_store() {
    let a = Lix::open(seeded()).unwrap();
    let b = Lix::open(seeded()).unwrap();
    workload(&a);
    workload(&b);

    let image_a = encode_image(a.engine().database()).unwrap();
    let image_b = encode_image(b.engine().database()).unwrap();
    assert_eq!(image_a, image_b);

    let rows_a = a.execute("SELECT key, value, lixcol_created_at FROM lix_key_value ORDER BY key", &[]).unwrap();
    let rows_b = b.execute("SELECT key, value, lixcol_created_at FROM lix_key_value ORDER BY key", &[]).unwrap();
    assert_eq!(rows_a, rows_b);
}

#[test]
fn test_random_sequence_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let config = LixConfig {
        path: Some(dir.path().join("det.lix")),
        ..seeded()
    };

    let mut draws = Vec::new();
    {
        let lix = Lix::open(config.clone()).unwrap();
        let mut engine = lix.engine();
        draws.extend((0..5).map(|_| engine.random()));
        drop(engine);
        lix.close().unwrap();
    }
    {
        let lix = Lix::open(config).unwrap();
        let mut engine = lix.engine();
        draws.extend((0..5).map(|_| engine.random()));
    }

    let reference = Lix::open(seeded()).unwrap();
    let mut engine = reference.engine();
    let expected: Vec<f64> = (0..10).map(|_| engine.random()).collect();
    assert_eq!(draws, expected);
}

#[test]
fn test_different_seeds_diverge() {
    let a = Lix::open(seeded()).unwrap();
    let b = Lix::open(LixConfig {
        deterministic: Some(DeterministicConfig::seeded("other")),
        ..seeded()
    })
    .unwrap();
    let draws_a: Vec<f64> = (0..4).map(|_| a.engine().random()).collect();
    let draws_b: Vec<f64> = (0..4).map(|_| b.engine().random()).collect();
    assert_ne!(draws_a, draws_b);
}

#[test]
fn test_leaving_deterministic_mode_drops_state() {
    let lix = Lix::open(seeded()).unwrap();
    let mut engine = lix.engine();
    engine.random();
    engine.close().unwrap();
    assert!(engine.get_untracked(RNG_STATE_KEY).is_some());

    engine
        .set_deterministic_mode(DeterministicConfig::default())
        .unwrap();
    assert!(!engine.deterministic_mode());
    engine.random();
    engine.uuid();
    engine.close().unwrap();
    assert!(engine.get_untracked(RNG_STATE_KEY).is_none());
    assert!(engine.get_untracked(SEQUENCE_KEY).is_none());
}

#[test]
fn test_deterministic_timestamps_are_logical() {
    let lix = Lix::open(seeded()).unwrap();
    let mut engine = lix.engine();
    let first = engine.timestamp();
    let second = engine.timestamp();
    assert!(second > first);

    let other = Lix::open(seeded()).unwrap();
    let mut other_engine = other.engine();
    assert_eq!(other_engine.timestamp(), first);
    assert_eq!(other_engine.timestamp(), second);
    assert_eq!(json!(other_engine.uuid()), json!(engine.uuid()));
}
