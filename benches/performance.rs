//! Performance benchmarks for the CAN service.

use can_service::{
    ArchitectureConfig, ArchitectureType, BusConfig, BusName, BusType, ByteOrder, CanEngine,
    CanService, FilterMode, FrameData, ServiceConfig, SignalDataType, SignalDatabase,
    SignalDecoder, SignalDefinition, StaticSource, Timestamp,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::BTreeMap;
use std::sync::Arc;

const BUS: BusName = BusName(0);

fn create_engine(with_signals: bool) -> Arc<CanEngine> {
    let source = StaticSource(ArchitectureConfig {
        architecture: ArchitectureType::NeaR2,
        buses: vec![BusConfig {
            name: BUS,
            label: "bench".into(),
            bus_type: BusType::CanFd,
            speed_kbps: 2000,
            frames: (0x100..0x200).collect(),
        }],
    });

    let decoder = if with_signals {
        // Eight 8-bit signals per frame on the first 16 frames
        let definitions = (0..128u32)
            .map(|i| SignalDefinition {
                id: i,
                name: format!("Signal{}", i),
                bus: BUS,
                frame_id: 0x100 + i / 8,
                start_bit: ((i % 8) * 8) as u16,
                length: 8,
                byte_order: ByteOrder::LittleEndian,
                signed: false,
                factor: 0.25,
                offset: 0.0,
                data_type: SignalDataType::Double,
                value_table: BTreeMap::new(),
            })
            .collect();
        let db: Arc<dyn SignalDecoder> =
            Arc::new(SignalDatabase::new(definitions).unwrap());
        Some(db)
    } else {
        None
    };

    CanEngine::start(
        ServiceConfig {
            mailbox_capacity: 64,
            ..Default::default()
        },
        &source,
        decoder,
    )
    .unwrap()
}

/// Benchmark ingestion with a growing number of subscribers on one frame
fn bench_ingest_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest_fan_out");

    for subscribers in [0, 1, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, &subscribers| {
                let engine = create_engine(false);
                for _ in 0..subscribers {
                    engine
                        .subscribe_frame(
                            BUS,
                            &[0x100],
                            Arc::new(|frame: &FrameData| {
                                black_box(frame);
                            }),
                            FilterMode::FilterOff,
                            1,
                        )
                        .unwrap();
                }

                let mut ts = 0u64;
                b.iter(|| {
                    ts += 1;
                    engine.ingest_frame(BUS, 0x100, ts.to_le_bytes().to_vec(), Timestamp(ts));
                });
            },
        );
    }

    group.finish();
}

/// Benchmark filter evaluation cost per mode
fn bench_filter_modes(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter_modes");

    for mode in [
        FilterMode::FilterOff,
        FilterMode::FilterSampling,
        FilterMode::FilterOnChange,
        FilterMode::FilterSamplingOrOnChange,
    ] {
        group.bench_function(format!("{:?}", mode), |b| {
            let engine = create_engine(false);
            for _ in 0..10 {
                engine
                    .subscribe_frame(BUS, &[0x101], Arc::new(|_: &FrameData| {}), mode, 4)
                    .unwrap();
            }

            let mut ts = 0u64;
            b.iter(|| {
                ts += 1;
                // Content changes every 8 updates
                let payload = vec![(ts / 8) as u8; 8];
                engine.ingest_frame(BUS, 0x101, payload, Timestamp(ts));
            });
        });
    }

    group.finish();
}

/// Benchmark frame ingestion with signal decoding
fn bench_ingest_with_decoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest_decoding");

    group.bench_function("raw_frame", |b| {
        let engine = create_engine(false);
        let mut ts = 0u64;
        b.iter(|| {
            ts += 1;
            engine.ingest_frame(BUS, 0x100, vec![0x5A; 8], Timestamp(ts));
        });
    });

    group.bench_function("eight_signals", |b| {
        let engine = create_engine(true);
        let mut ts = 0u64;
        b.iter(|| {
            ts += 1;
            engine.ingest_frame(BUS, 0x100, vec![0x5A; 8], Timestamp(ts));
        });
    });

    group.finish();
}

/// Benchmark history reads with varying window sizes
fn bench_cache_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_reads");

    // 100 Hz for 60 seconds
    let engine = create_engine(false);
    for i in 0..6000u64 {
        engine.ingest_frame(BUS, 0x102, i.to_le_bytes().to_vec(), Timestamp(i * 10));
    }

    group.bench_function("last_value", |b| {
        b.iter(|| black_box(engine.get_frame_last_value(BUS, &[0x102]).unwrap()));
    });

    for secs in [1u8, 10, 60] {
        group.bench_with_input(BenchmarkId::new("history_secs", secs), &secs, |b, &secs| {
            b.iter(|| black_box(engine.get_frame_cache(BUS, &[0x102], secs).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_ingest_fan_out,
    bench_filter_modes,
    bench_ingest_with_decoding,
    bench_cache_reads,
);

criterion_main!(benches);
