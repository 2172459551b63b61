//! Criterion benchmarks for grid resolution and phasor extraction.
//!
//! Grid resolution runs once per sequence before any hardware is touched;
//! phasor extraction runs once per stored point on the acquisition path.
//!
//! Run with: cargo bench --bench grid_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sonorover::data::phasor;
use sonorover::experiment::grid::{
    AxisExtent, AxisMapping, Bounds, BoundsAndSteps, GridGenerator, GridSpecification, ScanPattern,
};
use sonorover::hardware::Position3;
use std::time::Duration;

fn volume(extent: f64, step: f64, pattern: ScanPattern) -> GridSpecification {
    GridSpecification::BoundsAndSteps(BoundsAndSteps {
        bounds: Bounds {
            x: AxisExtent::symmetric(extent),
            y: AxisExtent::symmetric(extent),
            z: AxisExtent::symmetric(extent),
        },
        steps: Position3::new(step, step, step),
        mapping: AxisMapping::default(),
        pattern,
    })
}

fn grid_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("grid_resolve");
    let zero = Position3::new(-50.0, -50.0, -150.0);

    // 11³, 21³ and 41³ points
    for extent in [5.0, 10.0, 20.0] {
        for pattern in [ScanPattern::Raster, ScanPattern::Serpentine] {
            let spec = volume(extent, 1.0, pattern);
            let points = (2.0 * extent + 1.0).powi(3) as u64;
            group.throughput(Throughput::Elements(points));
            group.bench_with_input(
                BenchmarkId::new(format!("{:?}", pattern), points),
                &spec,
                |b, spec| b.iter(|| GridGenerator::resolve(black_box(spec), zero).unwrap()),
            );
        }
    }
    group.finish();
}

fn phasor_extract(c: &mut Criterion) {
    let mut group = c.benchmark_group("phasor_extract");
    let frequency = 500_000.0;
    let interval = Duration::from_nanos(40);

    for samples in [2_500usize, 12_500, 50_000] {
        let record: Vec<f32> = (0..samples)
            .map(|n| {
                let t = n as f64 * interval.as_secs_f64();
                (0.1 * (2.0 * std::f64::consts::PI * frequency * t).sin()) as f32
            })
            .collect();
        group.throughput(Throughput::Elements(samples as u64));
        group.bench_with_input(BenchmarkId::from_parameter(samples), &record, |b, record| {
            b.iter(|| phasor::extract(black_box(record), 0..record.len(), interval, frequency))
        });
    }
    group.finish();
}

criterion_group!(benches, grid_resolve, phasor_extract);
criterion_main!(benches);
