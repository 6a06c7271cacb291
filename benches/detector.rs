use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use network_defense_service::core::detector::AttackPatternDetector;
use network_defense_service::core::geo::OctetHeuristicResolver;
use network_defense_service::core::traffic::TrafficCounterStore;
use network_defense_service::models::{
    Config, ObservationFlags, Protocol, TrafficObservation,
};

fn observation(i: u64) -> TrafficObservation {
    TrafficObservation {
        source_ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, (i % 200) as u8)),
        dest_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        protocol: Protocol::Tcp,
        source_port: 40000,
        dest_port: 80,
        packet_count: 1,
        byte_count: 60,
        timestamp: 1622548800 + (i % 60),
        flags: ObservationFlags {
            syn: true,
            ack: false,
            rst: false,
            fin: false,
        },
    }
}

fn detector_benchmark(c: &mut Criterion) {
    let mut config = Config::default();
    config.geo.enabled = false;
    config.temporal.enabled = false;

    let store = Arc::new(TrafficCounterStore::new(
        &config.store,
        &config.detection.auth_ports,
    ));
    let detector = AttackPatternDetector::new(
        store.clone(),
        Arc::new(OctetHeuristicResolver),
        &config.detection,
        config.geo.clone(),
        config.temporal.clone(),
    );

    // Warm the store so window lookups walk realistic bucket maps.
    for i in 0..50_000u64 {
        store.record(&observation(i));
    }

    c.bench_function("record_and_evaluate", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let obs = observation(i);
            i += 1;
            store.record(&obs);
            black_box(detector.evaluate(&obs, obs.timestamp))
        })
    });
}

criterion_group!(benches, detector_benchmark);
criterion_main!(benches);
