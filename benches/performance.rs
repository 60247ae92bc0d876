//! Performance benchmarks for the change-control engine.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lix_engine::storage::{decode_image, encode_image};
use lix_engine::{CreateVersion, Engine, Lix, LixConfig, NewChange, VersionId};
use serde_json::json;
use tempfile::TempDir;

fn engine() -> Engine {
    Engine::in_memory(&LixConfig::default()).unwrap()
}

fn kv(key: String, value: i64) -> NewChange {
    NewChange::entity(key.clone(), "lix_key_value", Some(json!({"key": key, "value": value})))
}

/// Engine with `checkpoints` checkpoints of `per_checkpoint` edits each.
fn engine_with_history(checkpoints: usize, per_checkpoint: usize) -> Engine {
    let mut engine = engine();
    for c in 0..checkpoints {
        engine
            .transaction(|engine| {
                for i in 0..per_checkpoint {
                    engine.create_change(kv(format!("k{i}"), (c * per_checkpoint + i) as i64))?;
                }
                Ok(())
            })
            .unwrap();
        engine.create_checkpoint().unwrap();
    }
    engine
}

/// Benchmark full materialization with varying history depth
fn bench_materialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("materialization");

    for checkpoints in [10, 50, 200] {
        group.bench_with_input(
            BenchmarkId::new("checkpoints", checkpoints),
            &checkpoints,
            |b, &depth| {
                let engine = engine_with_history(depth, 20);
                b.iter(|| {
                    black_box(engine.materialize().unwrap());
                });
            },
        );
    }

    group.finish();
}

/// Benchmark single-change writes
fn bench_change_write(c: &mut Criterion) {
    let mut engine = engine();
    let mut i = 0i64;

    c.bench_function("change_write", |b| {
        b.iter(|| {
            i += 1;
            black_box(engine.create_change(kv(format!("k{}", i % 100), i)).unwrap());
        });
    });
}

/// Benchmark entity-view queries through the SQL surface
fn bench_sql_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("sql_select");

    for rows in [100, 1000] {
        group.bench_with_input(BenchmarkId::new("rows", rows), &rows, |b, &rows| {
            let mut engine = engine();
            engine
                .transaction(|engine| {
                    for i in 0..rows {
                        engine.create_change(kv(format!("k{i}"), i as i64))?;
                    }
                    Ok(())
                })
                .unwrap();

            b.iter(|| {
                black_box(
                    engine
                        .execute("SELECT key, value FROM lix_key_value WHERE value > 10", &[])
                        .unwrap(),
                );
            });
        });
    }

    group.finish();
}

/// Benchmark reads through a deep inheritance chain
fn bench_inherited_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("inherited_reads");

    for chain in [1, 8, 32] {
        group.bench_with_input(BenchmarkId::new("chain", chain), &chain, |b, &chain| {
            let mut engine = engine();
            engine
                .transaction(|engine| {
                    for i in 0..200 {
                        engine.create_change(kv(format!("k{i}"), i))?;
                    }
                    Ok(())
                })
                .unwrap();
            let mut parent = VersionId::from("main");
            for depth in 0..chain {
                let id = format!("v{depth}");
                engine
                    .create_version(CreateVersion::new(&id).id(id.as_str()).inherits_from(parent.clone()))
                    .unwrap();
                parent = VersionId::from(id);
            }

            b.iter(|| {
                black_box(engine.state_of(&parent, Some("lix_key_value")).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark image encoding and a file save
fn bench_persistence(c: &mut Criterion) {
    let source = engine_with_history(20, 50);
    let image = encode_image(source.database()).unwrap();

    c.bench_function("image_encode", |b| {
        b.iter(|| black_box(encode_image(source.database()).unwrap()));
    });
    c.bench_function("image_decode", |b| {
        b.iter(|| black_box(decode_image(&image).unwrap()));
    });

    let dir = TempDir::new().unwrap();
    let lix = Lix::open(LixConfig::at(dir.path().join("bench.lix"))).unwrap();
    lix.execute("INSERT INTO lix_key_value (key, value) VALUES ('a', 1)", &[])
        .unwrap();
    c.bench_function("lix_save", |b| {
        b.iter(|| lix.save().unwrap());
    });
}

criterion_group!(
    benches,
    bench_materialization,
    bench_change_write,
    bench_sql_select,
    bench_inherited_reads,
    bench_persistence,
);

criterion_main!(benches);
