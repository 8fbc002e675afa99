//! Update cycle benchmark
//!
//! Cost of one `update_listeners` call: flip the active generation, fold the
//! frozen counters into the accumulated totals and fan the delta out.
//!
//! ```bash
//! cargo bench --bench update_cycle
//! ```

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use linescope::registry::{DeltaListener, ListenerError, Registry, SourceCounts};
use std::sync::Arc;

fn registry(files: u32, lines: u32) -> Registry {
    let registry = Registry::new();
    for file in 0..files {
        for line in 1..=lines {
            registry.register_line(&format!("bench/File{file}.java"), line);
        }
    }
    registry
}

fn bench_idle_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("update_idle");
    for lines in [100u32, 10_000] {
        let registry = registry(10, lines / 10);
        let mut delta = SourceCounts::new();
        group.bench_with_input(BenchmarkId::from_parameter(lines), &lines, |b, _| {
            b.iter(|| registry.update_listeners(&mut delta))
        });
    }
    group.finish();
}

fn bench_busy_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("update_busy");
    for lines in [100u32, 10_000] {
        let registry = registry(10, lines / 10);
        let listener: Arc<dyn DeltaListener> =
            Arc::new(|_: &SourceCounts| -> Result<(), ListenerError> { Ok(()) });
        registry.current_snapshot(listener);
        let indices: Vec<_> = (0..10)
            .flat_map(|file| {
                let registry = &registry;
                (1..=lines / 10).filter_map(move |line| {
                    registry.line_index(&format!("bench/File{file}.java"), line)
                })
            })
            .collect();
        let mut delta = SourceCounts::new();

        group.bench_with_input(BenchmarkId::from_parameter(lines), &lines, |b, _| {
            b.iter(|| {
                for &index in &indices {
                    registry.visit_line(index);
                }
                registry.update_listeners(&mut delta)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_idle_cycle, bench_busy_cycle);
criterion_main!(benches);
