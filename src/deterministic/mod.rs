//! Deterministic mode: seeded randomness and a logical clock.
//!
//! When `lix_deterministic_mode` is enabled, timestamps, ids and random draws
//! are reproducible from a seed. Generator state lives on the engine, is
//! loaded lazily from the untracked key-value table, and is written back only
//! when dirty (on transaction commit or close). In the default mode a
//! cryptographically strong source is used and nothing is persisted.

mod clock;
mod rng;

pub use clock::{timestamp_for, uuid_for, LogicalClock};
pub use rng::{fnv1a64, SplitMix64, Xorshift128Plus};

use crate::storage::Database;
use crate::types::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

pub const DETERMINISTIC_MODE_KEY: &str = "lix_deterministic_mode";
pub const RNG_STATE_KEY: &str = "lix_deterministic_rng_state";
pub const SEQUENCE_KEY: &str = "lix_deterministic_sequence_number";
pub const LIX_ID_KEY: &str = "lix_id";

/// Stored form of the deterministic mode switch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicConfig {
    pub enabled: bool,
    /// Defaults to the store's `lix_id`.
    #[serde(default)]
    pub seed: Option<String>,
}

impl DeterministicConfig {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            seed: None,
        }
    }

    pub fn seeded(seed: impl Into<String>) -> Self {
        Self {
            enabled: true,
            seed: Some(seed.into()),
        }
    }
}

/// Per-engine deterministic state.
#[derive(Debug, Default)]
pub struct Deterministic {
    mode: Option<DeterministicConfig>,
    rng: Option<Xorshift128Plus>,
    rng_dirty: bool,
    clock: Option<LogicalClock>,
    clock_dirty: bool,
    last_wall: i64,
}

impl Deterministic {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget cached state; the next use reloads it from `key_value`.
    pub fn invalidate(&mut self) {
        self.mode = None;
        self.rng = None;
        self.rng_dirty = false;
        self.clock = None;
        self.clock_dirty = false;
    }

    pub fn is_enabled(&mut self, db: &Database) -> bool {
        self.mode(db).enabled
    }

    fn mode(&mut self, db: &Database) -> &DeterministicConfig {
        self.mode.get_or_insert_with(|| {
            db.key_value
                .get(&DETERMINISTIC_MODE_KEY.to_string())
                .and_then(|value| serde_json::from_value(value.clone()).ok())
                .unwrap_or_default()
        })
    }

    /// Switch modes. Disabling drops the persisted generator state.
    pub fn set_mode(&mut self, db: &mut Database, config: DeterministicConfig) {
        // Keep draws made under the old mode.
        self.flush(db);
        if !config.enabled {
            db.key_value.remove(&RNG_STATE_KEY.to_string());
            db.key_value.remove(&SEQUENCE_KEY.to_string());
        }
        db.key_value.insert(DETERMINISTIC_MODE_KEY.to_string(), json!(config));
        self.invalidate();
    }

    fn clock(&mut self, db: &Database) -> &mut LogicalClock {
        self.clock.get_or_insert_with(|| {
            let next = db
                .key_value
                .get(&SEQUENCE_KEY.to_string())
                .and_then(Value::as_u64)
                .unwrap_or(0);
            LogicalClock::starting_at(next)
        })
    }

    fn rng(&mut self, db: &Database) -> &mut Xorshift128Plus {
        if self.rng.is_none() {
            let restored = db
                .key_value
                .get(&RNG_STATE_KEY.to_string())
                .and_then(parse_rng_state);
            let rng = restored.unwrap_or_else(|| {
                let seed = self
                    .mode(db)
                    .seed
                    .clone()
                    .or_else(|| {
                        db.key_value
                            .get(&LIX_ID_KEY.to_string())
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                    .unwrap_or_else(|| "lix".to_string());
                debug!(seed = %seed, "seeding deterministic rng");
                Xorshift128Plus::from_seed(&seed)
            });
            self.rng = Some(rng);
        }
        self.rng.get_or_insert_with(|| Xorshift128Plus::from_seed("lix"))
    }

    /// Next timestamp. Strictly increasing in both modes.
    pub fn timestamp(&mut self, db: &Database) -> Timestamp {
        if self.is_enabled(db) {
            let sequence = self.clock(db).tick();
            self.clock_dirty = true;
            return timestamp_for(sequence);
        }
        let now = Timestamp::now().0.max(self.last_wall + 1);
        self.last_wall = now;
        Timestamp(now)
    }

    /// Next random float in [0, 1).
    pub fn random(&mut self, db: &Database) -> f64 {
        if self.is_enabled(db) {
            let value = self.rng(db).next_f64();
            self.rng_dirty = true;
            return value;
        }
        let bytes = Uuid::new_v4().into_bytes();
        // Bytes 6 and 8 carry version/variant bits.
        let bits = u64::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[7], bytes[9],
        ]);
        (bits >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Next unique id.
    pub fn uuid(&mut self, db: &Database) -> String {
        if self.is_enabled(db) {
            let sequence = self.clock(db).tick();
            self.clock_dirty = true;
            return uuid_for(sequence);
        }
        Uuid::now_v7().to_string()
    }

    pub fn is_dirty(&self) -> bool {
        self.rng_dirty || self.clock_dirty
    }

    /// Persist dirty state into `key_value`. No-op outside deterministic mode.
    pub fn flush(&mut self, db: &mut Database) {
        if !self.is_dirty() {
            return;
        }
        if !self.is_enabled(db) {
            self.rng_dirty = false;
            self.clock_dirty = false;
            return;
        }
        if self.rng_dirty {
            if let Some(rng) = self.rng {
                db.key_value.insert(
                    RNG_STATE_KEY.to_string(),
                    json!({ "hi": format!("{:016x}", rng.hi), "lo": format!("{:016x}", rng.lo) }),
                );
            }
            self.rng_dirty = false;
        }
        if self.clock_dirty {
            if let Some(clock) = self.clock {
                db.key_value
                    .insert(SEQUENCE_KEY.to_string(), json!(clock.peek()));
            }
            self.clock_dirty = false;
        }
    }
}

fn parse_rng_state(value: &Value) -> Option<Xorshift128Plus> {
    let hi = u64::from_str_radix(value.get("hi")?.as_str()?, 16).ok()?;
    let lo = u64::from_str_radix(value.get("lo")?.as_str()?, 16).ok()?;
    Some(Xorshift128Plus { hi, lo })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deterministic_db(seed: &str) -> Database {
        let mut db = Database::new();
        db.key_value.insert(
            DETERMINISTIC_MODE_KEY.to_string(),
            json!(DeterministicConfig::seeded(seed)),
        );
        db
    }

    #[test]
    fn test_same_seed_same_draws() {
        let db = deterministic_db("seed-1");
        let mut a = Deterministic::new();
        let mut b = Deterministic::new();
        let xs: Vec<u64> = (0..20).map(|_| a.random(&db).to_bits()).collect();
        let ys: Vec<u64> = (0..20).map(|_| b.random(&db).to_bits()).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn test_state_survives_flush_and_reload() {
        let mut db = deterministic_db("seed-2");
        let mut first = Deterministic::new();
        let head: Vec<u64> = (0..5).map(|_| first.random(&db).to_bits()).collect();
        first.flush(&mut db);
        let tail_expected: Vec<u64> = (0..5).map(|_| first.random(&db).to_bits()).collect();

        let mut second = Deterministic::new();
        let tail: Vec<u64> = (0..5).map(|_| second.random(&db).to_bits()).collect();
        assert_eq!(tail, tail_expected);
        assert_ne!(head, tail);
    }

    #[test]
    fn test_no_write_until_flush() {
        let mut db = deterministic_db("seed-3");
        let mut det = Deterministic::new();
        det.random(&db);
        det.timestamp(&db);
        assert!(db.key_value.get(&RNG_STATE_KEY.to_string()).is_none());
        assert!(det.is_dirty());
        det.flush(&mut db);
        assert!(db.key_value.get(&RNG_STATE_KEY.to_string()).is_some());
        assert_eq!(db.key_value.get(&SEQUENCE_KEY.to_string()), Some(&json!(1)));
    }

    #[test]
    fn test_logical_timestamps_and_ids() {
        let db = deterministic_db("seed-4");
        let mut det = Deterministic::new();
        assert_eq!(det.timestamp(&db), Timestamp(0));
        assert_eq!(det.uuid(&db), "01920000-0000-7000-8000-000000000001");
        assert_eq!(det.timestamp(&db), Timestamp(2_000));
    }

    #[test]
    fn test_non_deterministic_mode_persists_nothing() {
        let mut db = Database::new();
        let mut det = Deterministic::new();
        let a = det.timestamp(&db);
        let b = det.timestamp(&db);
        assert!(b > a);
        let x = det.random(&db);
        assert!((0.0..1.0).contains(&x));
        det.flush(&mut db);
        assert!(db.key_value.is_empty());
    }

    #[test]
    fn test_disabling_removes_state() {
        let mut db = deterministic_db("seed-5");
        let mut det = Deterministic::new();
        det.random(&db);
        det.flush(&mut db);
        det.set_mode(&mut db, DeterministicConfig::default());
        assert!(db.key_value.get(&RNG_STATE_KEY.to_string()).is_none());
        assert!(!det.is_enabled(&db));
    }
}
