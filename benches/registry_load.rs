//! Registry Load Benchmarks
//!
//! Run with: cargo bench --bench registry_load

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

use plughost::host::LocalHost;
use plughost::plugins::{builtin, DirectorySource, PluginSource, Registry, MANIFEST_FILE};
use plughost::store::{MemoryRecordStore, MemoryScheduleStore};
use plughost::Config;

fn seed_plugins(root: &std::path::Path, count: usize) {
    for i in 0..count {
        let dir = root.join(format!("bench-plugin-{}", i));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(MANIFEST_FILE),
            format!(
                r#"{{
                    "name": "Bench Plugin {i}",
                    "version": "1.0.0",
                    "mixins": {{ "settings": true, "schedule": true }},
                    "settings": {{ "LIMIT": {{ "name": "Limit", "default": {i} }} }},
                    "tasks": {{ "tick": {{ "func": "host.bench.tick", "schedule": "hourly" }} }}
                }}"#
            ),
        )
        .unwrap();
    }
}

fn build_registry(root: &std::path::Path) -> Registry {
    let mut config = Config::default();
    config.plugins.testing = true;
    config.features.schedule = true;

    let sources: Vec<Box<dyn PluginSource>> = vec![
        Box::new(builtin::builtin_source()),
        Box::new(DirectorySource::new(
            vec![root.to_path_buf()],
            builtin::default_catalog(),
        )),
    ];
    Registry::new(
        config,
        sources,
        Arc::new(MemoryRecordStore::new()),
        Arc::new(MemoryScheduleStore::new()),
        Arc::new(LocalHost::new(vec![]).unwrap()),
    )
}

fn benchmark_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_load");

    for count in [10usize, 50, 200].iter() {
        let tmp = TempDir::new().unwrap();
        seed_plugins(tmp.path(), *count);

        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::new("load", count), count, |b, _| {
            b.iter(|| {
                let registry = build_registry(tmp.path());
                black_box(registry.load_plugins(false));
            });
        });
    }

    group.finish();
}

fn benchmark_reload(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    seed_plugins(tmp.path(), 50);
    let registry = build_registry(tmp.path());
    registry.load_plugins(false);

    c.bench_function("reload_50_plugins", |b| {
        b.iter(|| black_box(registry.reload_plugins(false)));
    });
}

fn benchmark_queries(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    seed_plugins(tmp.path(), 50);
    let registry = build_registry(tmp.path());
    registry.load_plugins(false);

    let mut group = c.benchmark_group("registry_queries");
    group.bench_function("get_plugin", |b| {
        b.iter(|| black_box(registry.get_plugin(black_box("bench-plugin-25"))));
    });
    group.bench_function("with_mixin_settings", |b| {
        b.iter(|| black_box(registry.with_mixin(black_box("settings"), Some(true))));
    });
    group.finish();
}

criterion_group!(benches, benchmark_load, benchmark_reload, benchmark_queries);
criterion_main!(benches);
