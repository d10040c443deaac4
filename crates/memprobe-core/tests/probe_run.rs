//! End-to-end probe runs against the detected topology.

use memprobe_core::numa::{NumaAllocator, NumaTopology, Placement};
use memprobe_core::strategy::stream::broadcast;
use memprobe_core::{
    AccessStrategy, Benchmark, BenchmarkResult, BufferingSink, JsonLinesSink, ProbeConfig,
    ProbeError, SimdWidth, StrategyKind, Verification,
};
use memprobe_core::sched;

const PAYLOAD: usize = 4096;

/// `false`, with a notice, when the host hides per-thread scheduler stats.
fn stats_or_skip(test: &str) -> bool {
    let available = sched::stats_available();
    if !available {
        eprintln!("skipping {test}: no per-thread scheduler statistics");
    }
    available
}

/// Runs one probe; `None` when the host hides per-thread scheduler stats.
fn run(test: &str, config: ProbeConfig) -> Option<(BenchmarkResult, Vec<BenchmarkResult>, usize)> {
    if !stats_or_skip(test) {
        return None;
    }
    let bench = Benchmark::detect(config).unwrap();
    let num_nodes = bench.topology().num_nodes();
    let mut sink = BufferingSink::new();

    let record = bench.run(&mut sink).unwrap();
    Some((record, sink.take_records(), num_nodes))
}

#[test]
fn test_flush_based_4k_emits_one_record() {
    let config = ProbeConfig::builder()
        .strategy(StrategyKind::FlushBased)
        .payload_bytes(PAYLOAD)
        .fill_byte(1)
        .build()
        .unwrap();

    let Some((record, emitted, num_nodes)) = run("test_flush_based_4k_emits_one_record", config) else {
        return;
    };

    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0], record);
    assert_eq!(record.payload_bytes, 4096);
    assert_eq!(record.strategy, StrategyKind::FlushBased);
    assert!(record.thread.core_id >= 0);
    assert_eq!(record.checksum, Some(4096));
    assert_eq!(record.verification, Verification::Skipped);
    assert!(record.write_time_us >= 0.0);
    assert!(record.read_time_us >= 0.0);

    for nodes in [&record.numa_write_nodes, &record.numa_read_nodes] {
        assert!(!nodes.is_empty());
        assert!(nodes.iter().all(|n| n < num_nodes));
    }
}

#[test]
fn test_fixed_stride_run() {
    let config = ProbeConfig::builder()
        .strategy(StrategyKind::StreamingFixedStride)
        .payload_bytes(64 * 1024)
        .build()
        .unwrap();

    let Some((record, _, _)) = run("test_fixed_stride_run", config) else {
        return;
    };
    assert_eq!(record.checksum, None);
    assert!(!record.numa_write_nodes.is_empty());
}

#[test]
fn test_adaptive_run_verifies_round_trip() {
    let config = ProbeConfig::builder()
        .strategy(StrategyKind::StreamingAdaptiveWidth)
        .payload_bytes(64 * 1024 + 7)
        .build()
        .unwrap();

    let Some((record, _, _)) = run("test_adaptive_run_verifies_round_trip", config) else {
        return;
    };
    assert_eq!(record.verification, Verification::Passed);
}

#[test]
fn test_zero_payload_rejected_before_allocation() {
    let config = ProbeConfig {
        payload_bytes: 0,
        ..ProbeConfig::default()
    };
    assert!(matches!(
        Benchmark::detect(config),
        Err(ProbeError::InvalidConfig(_))
    ));
}

#[test]
fn test_unknown_node_is_an_allocation_error() {
    let topology = NumaTopology::detect();
    let config = ProbeConfig::builder()
        .payload_bytes(PAYLOAD)
        .placement(Placement::Node(topology.num_nodes()))
        .build()
        .unwrap();
    let bench = Benchmark::with_topology(config, topology).unwrap();

    let mut sink = BufferingSink::new();
    let err = bench.run(&mut sink).unwrap_err();
    assert!(matches!(err, ProbeError::Allocation { .. }));
    assert_eq!(err.exit_code(), 1);
    assert!(sink.records().is_empty());
}

#[test]
fn test_corrupted_region_fails_verification() {
    let topology = NumaTopology::detect();
    let allocator = NumaAllocator::new(&topology);
    let strategy = AccessStrategy::StreamingAdaptiveWidth {
        width: SimdWidth::detect(),
    };

    let mut region = allocator.allocate(PAYLOAD, 64, Placement::FirstTouch).unwrap();
    let mut staging = strategy.prepare(&allocator, PAYLOAD, 0xAA).unwrap();
    strategy.write(&mut region, &staging).unwrap();

    region.as_mut_slice()[PAYLOAD - 1] ^= 0xFF;
    strategy.read(&region, &mut staging).unwrap();

    let err = staging.verify().unwrap_err();
    assert!(matches!(
        err,
        ProbeError::DataIntegrity {
            offset: 4095,
            expected: 0xAA,
            actual: 0x55
        }
    ));
}

#[test]
fn test_fixed_stride_broadcast_4k() {
    let topology = NumaTopology::detect();
    let allocator = NumaAllocator::new(&topology);
    let strategy = AccessStrategy::StreamingFixedStride { fill: 0xC3 };

    let mut region = allocator.allocate(PAYLOAD, 64, Placement::FirstTouch).unwrap();
    let staging = strategy.prepare(&allocator, PAYLOAD, 0).unwrap();
    strategy.write(&mut region, &staging).unwrap();

    for word in region.as_slice().chunks_exact(8) {
        let word = u64::from_ne_bytes(word.try_into().unwrap());
        assert_eq!(word, broadcast(0xC3));
    }
}

#[test]
fn test_json_sink_end_to_end() {
    if !stats_or_skip("test_json_sink_end_to_end") {
        return;
    }
    let config = ProbeConfig::builder().payload_bytes(PAYLOAD).build().unwrap();
    let bench = Benchmark::detect(config).unwrap();
    let mut sink = JsonLinesSink::new(Vec::new());
    bench.run(&mut sink).unwrap();

    let out = String::from_utf8(sink.into_inner()).unwrap();
    assert_eq!(out.lines().count(), 1);
    let value: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
    for field in [
        "numa_id",
        "core_id",
        "voluntary_switches",
        "involuntary_switches",
        "core_migrations",
        "checksum",
        "numa_write_nodes",
        "numa_read_nodes",
        "write_time_us",
        "read_time_us",
        "payload_bytes",
    ] {
        assert!(value.get(field).is_some(), "missing field {field}");
    }
}

#[test]
fn test_missing_stats_abort_before_emit() {
    if sched::stats_available() {
        return;
    }
    let config = ProbeConfig::builder().payload_bytes(PAYLOAD).build().unwrap();
    let bench = Benchmark::detect(config).unwrap();
    let mut sink = BufferingSink::new();

    assert!(matches!(
        bench.run(&mut sink),
        Err(ProbeError::SchedulingStatsUnavailable(_))
    ));
    assert!(sink.records().is_empty());
}
