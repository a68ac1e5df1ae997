//! Benchmark suite for the proximity filter over a discovery pass.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use envbeacon::proximity::filter;
use envbeacon::{BeaconRegistry, MacAddress, Observation};

fn mac(i: u16) -> MacAddress {
    let [hi, lo] = i.to_be_bytes();
    MacAddress([0x10, 0x20, 0x30, 0x40, hi, lo])
}

/// `count` devices, every third one registered, signal spread over -100..-30.
fn pass(count: u16) -> (Vec<Observation>, BeaconRegistry) {
    let observations = (0..count)
        .map(|i| Observation {
            address: mac(i),
            rssi: -100 + (i % 71) as i16,
            name: None,
        })
        .collect();
    let registry = (0..count)
        .step_by(3)
        .map(|i| (mac(i), format!("Beacon_{}", count - i)))
        .collect();
    (observations, registry)
}

fn bench_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("proximity_filter");

    for count in [10u16, 100, 1000] {
        let (observations, registry) = pass(count);
        group.throughput(Throughput::Elements(u64::from(count)));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                let matches = filter(black_box(&observations), black_box(&registry), -70);
                black_box(matches)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_filter);
criterion_main!(benches);
