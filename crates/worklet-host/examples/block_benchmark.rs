//! Block processing benchmarks
//!
//! Run with: cargo run -p worklet-host --example block_benchmark --release

use std::time::Instant;

use worklet_host::{
    AudioBlock, BlockLayout, LatencyStats, ModuleLoader, SessionConfig, WasmConfig,
};

const GAIN_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/gain.wat");
const SHARED_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/shared_gain.wat");

fn main() {
    println!("=== Worklet Block Benchmarks ===\n");

    bench_compile();
    bench_session_start();
    bench_block_sizes();
    bench_shared_memory();
    bench_with_fuel_metering();

    println!("\n=== Benchmark Complete ===");
}

fn bench_compile() {
    println!("## Module Compilation");

    let loader = ModuleLoader::new(WasmConfig::realtime()).unwrap();
    let _ = loader.load_file(GAIN_PATH).unwrap();

    let mut stats = LatencyStats::new();
    for _ in 0..50 {
        let start = Instant::now();
        let _ = loader.load_file(GAIN_PATH).unwrap();
        stats.record(start.elapsed().as_micros() as u64);
    }
    println!("  load_file (wat):          {}", stats.summary());
    println!();
}

fn bench_session_start() {
    println!("## Session Start to First Block");

    let loader = ModuleLoader::new(WasmConfig::realtime()).unwrap();
    let module = loader.load_file(GAIN_PATH).unwrap();
    let layout = BlockLayout::new(2, 128);

    let mut stats = LatencyStats::new();
    for _ in 0..50 {
        let start = Instant::now();
        let mut session = loader
            .start_with_module(module.clone(), SessionConfig::new(2, 128))
            .unwrap();
        session.process(AudioBlock::silent(layout)).unwrap();
        stats.record(start.elapsed().as_micros() as u64);
        session.teardown();
    }
    println!("  start + first block:      {}", stats.summary());
    println!();
}

fn bench_block_sizes() {
    println!("## Steady-State Block Processing (stereo)");

    let loader = ModuleLoader::new(WasmConfig::default()).unwrap();
    let module = loader.load_file(GAIN_PATH).unwrap();

    for frames in [64, 128, 256, 512, 1024] {
        let config = SessionConfig::new(2, frames);
        let budget = config.block_period_us();
        let mut session = loader.start_with_module(module.clone(), config).unwrap();
        let block = AudioBlock::from_planar(
            session.layout(),
            (0..2 * frames).map(|i| (i as f32 * 0.01).sin()).collect(),
        )
        .unwrap();

        // Warm up
        for _ in 0..100 {
            session.process(block.clone()).unwrap();
        }

        let mut stats = LatencyStats::new();
        for _ in 0..5_000 {
            let processed = session.process(block.clone()).unwrap();
            stats.record(processed.elapsed_us);
        }
        println!(
            "  {:>5} frames (budget {:>5}us): {} overruns={}",
            frames,
            budget,
            stats.summary(),
            stats.overruns(budget)
        );
    }
    println!();
}

fn bench_shared_memory() {
    println!("## Shared vs Exported Memory (2ch x 128)");

    let loader = ModuleLoader::new(WasmConfig::default()).unwrap();
    let layout = BlockLayout::new(2, 128);

    for (label, path) in [("exported", GAIN_PATH), ("shared", SHARED_PATH)] {
        let module = loader.load_file(path).unwrap();
        let mut session = loader
            .start_with_module(module, SessionConfig::new(2, 128))
            .unwrap();

        let mut stats = LatencyStats::new();
        for _ in 0..5_000 {
            let processed = session.process(AudioBlock::silent(layout)).unwrap();
            stats.record(processed.elapsed_us);
        }
        println!("  {:<10} {}", label, stats.summary());
    }
    println!();
}

fn bench_with_fuel_metering() {
    println!("## Fuel Metering Overhead (2ch x 128)");

    let layout = BlockLayout::new(2, 128);

    for (label, config) in [
        ("unmetered", WasmConfig::default()),
        ("metered", WasmConfig::realtime()),
    ] {
        let loader = ModuleLoader::new(config).unwrap();
        let module = loader.load_file(GAIN_PATH).unwrap();
        let mut session = loader
            .start_with_module(module, SessionConfig::new(2, 128))
            .unwrap();

        let mut stats = LatencyStats::new();
        for _ in 0..5_000 {
            let processed = session.process(AudioBlock::silent(layout)).unwrap();
            stats.record(processed.elapsed_us);
        }
        println!("  {:<10} {}", label, stats.summary());
    }
}
