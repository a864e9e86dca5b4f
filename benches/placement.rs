//! Benchmarks for placement resolution and status aggregation
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hts_multistream::config::PlacementMap;
use hts_multistream::run::{CycleReport, Header, LinkStatus, UnitStatus};
use hts_multistream::types::{RemotePort, Site, SiteList, UnitState};
use std::time::Duration;

fn sites(n: u8) -> SiteList {
    (1..=n).map(|site| Site { site, channels: 32 }).collect()
}

fn bench_map_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_parse");

    for units in [1u16, 8, 32].iter() {
        let map: String = (1..=*units)
            .map(|id| format!("{:03}:A:1,2/{:03}:B:3,4", id, id))
            .collect::<Vec<_>>()
            .join("/");
        group.throughput(Throughput::Elements(*units as u64));
        group.bench_with_input(BenchmarkId::new("parse", units), &map, |b, map| {
            b.iter(|| black_box(map.parse::<PlacementMap>().unwrap()));
        });
    }

    group.finish();
}

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve");
    let available = sites(6);

    for map in ["ALL:BOTH:ALL", "ALL:BOTH:SPLIT", "7:A:1,2,3/7:B:4,5,6"].iter() {
        let parsed: PlacementMap = map.parse().unwrap();
        group.bench_with_input(BenchmarkId::new("resolve", map), &parsed, |b, parsed| {
            b.iter(|| black_box(parsed.resolve("acq2106_007", 7, &available).unwrap()));
        });
    }

    group.finish();
}

fn report(units: usize) -> CycleReport {
    CycleReport {
        cycle: 1,
        header: Header {
            elapsed: Duration::from_secs(30),
            progress: Some((Duration::from_secs(20), Duration::from_secs(60))),
            max_mb: 4000.0,
            buffer_mb: 4.0,
            cpu: Some(12.5),
        },
        trigger: "Triggered sg0106".to_string(),
        units: (0..units)
            .map(|i| UnitStatus {
                name: format!("acq2106_{:03}", i),
                state: UnitState::Run,
                links: [RemotePort::A, RemotePort::B]
                    .into_iter()
                    .enumerate()
                    .map(|(j, port)| LinkStatus {
                        link: (i * 2 + j) as u32,
                        port,
                        rate_mb: 400.0,
                        total_mb: 12000.0,
                        status: "RUN".to_string(),
                        result: None,
                    })
                    .collect(),
            })
            .collect(),
    }
}

fn bench_status_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("status_frame");

    for units in [2usize, 8, 16].iter() {
        let r = report(*units);
        group.throughput(Throughput::Elements(*units as u64));
        group.bench_with_input(BenchmarkId::new("aggregate", units), &r, |b, r| {
            b.iter(|| black_box((r.ended_streams(), r.all_running(), r.all_armed())));
        });
        group.bench_with_input(BenchmarkId::new("render", units), &r, |b, r| {
            b.iter(|| black_box(r.to_string()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_map_parse, bench_resolve, bench_status_frame);
criterion_main!(benches);
