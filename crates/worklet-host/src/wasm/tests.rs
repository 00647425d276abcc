//! Tests for the runtime and instance layer.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::*;
use crate::block::BlockLayout;
use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::error::{InitError, LoadError, RuntimeError};
use crate::processor::InitParams;

/// Copies input to output; `init` records its arguments, which `process`
/// writes into the first three output samples.
const ECHO_INIT: &str = r#"
(module
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 256))
  (global $rate (mut i32) (i32.const 0))
  (global $channels (mut i32) (i32.const 0))
  (global $frames (mut i32) (i32.const 0))

  (func (export "alloc") (param $size i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get $size)))
    (local.get $ptr))

  (func (export "init") (param i32 i32 i32) (result i32)
    (global.set $rate (local.get 0))
    (global.set $channels (local.get 1))
    (global.set $frames (local.get 2))
    (i32.const 0))

  (func (export "process") (param $in i32) (param $out i32) (param $frames i32) (param $channels i32) (result i32)
    (memory.copy
      (local.get $out)
      (local.get $in)
      (i32.shl (i32.mul (local.get $frames) (local.get $channels)) (i32.const 2)))
    (f32.store (local.get $out) (f32.convert_i32_u (global.get $rate)))
    (f32.store offset=4 (local.get $out) (f32.convert_i32_u (global.get $channels)))
    (f32.store offset=8 (local.get $out) (f32.convert_i32_u (global.get $frames)))
    (i32.const 0))
)
"#;

/// `alloc` hands out an offset past the end of memory.
const BAD_ALLOC: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "alloc") (param i32) (result i32) (i32.const 65530))
  (func (export "process") (param i32 i32 i32 i32) (result i32) (i32.const 0))
)
"#;

/// `init` and `process` never return.
const RUNAWAY: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "alloc") (param i32) (result i32) (i32.const 1024))
  (func (export "init") (param i32 i32 i32) (result i32)
    (loop $forever (br $forever))
    (i32.const 0))
  (func (export "process") (param i32 i32 i32 i32) (result i32)
    (loop $forever (br $forever))
    (i32.const 0))
)
"#;

/// Only `process` never returns.
const RUNAWAY_PROCESS: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "alloc") (param i32) (result i32) (i32.const 1024))
  (func (export "process") (param i32 i32 i32 i32) (result i32)
    (loop $forever (br $forever))
    (i32.const 0))
)
"#;

fn params(runtime: &WasmRuntime, wat: &str, layout: BlockLayout) -> InitParams {
    let module = runtime.compile("inline", wat.as_bytes()).expect("compile failed");
    InitParams {
        module,
        memory: None,
        layout,
        sample_rate: 44100,
        wasm: runtime.config().clone(),
    }
}

#[test]
fn test_wasm_config_default() {
    let config = WasmConfig::default();
    assert_eq!(config.max_memory, 64 * 1024 * 1024);
    assert_eq!(config.fuel_per_block, None);
    assert_eq!(config.max_init_time_ms, 2_000);
    assert_eq!(config.max_block_time_ms, 100);
    assert!(config.enable_simd);
    assert!(config.enable_threads);
    assert_eq!(config.capabilities, WasiCapabilities::none());
}

#[test]
fn test_wasm_config_realtime() {
    let config = WasmConfig::realtime();
    assert_eq!(config.fuel_per_block, Some(50_000_000));
    assert_eq!(config.optimization_level, 2);
}

#[test]
fn test_wasm_config_development() {
    let config = WasmConfig::development();
    assert_eq!(config.optimization_level, 0);
    assert!(config.capabilities.stdout);
    assert!(config.capabilities.stderr);
}

#[test]
fn test_wasm_config_builder_chain() {
    let config = WasmConfig::default()
        .max_memory(128 * 1024 * 1024)
        .fuel_per_block(500_000)
        .simd(false)
        .threads(false)
        .max_init_time(Duration::from_secs(5))
        .max_block_time(Duration::from_micros(2_500))
        .optimize(7);

    assert_eq!(config.max_memory, 128 * 1024 * 1024);
    assert_eq!(config.fuel_per_block, Some(500_000));
    assert!(!config.enable_simd);
    assert!(!config.enable_threads);
    assert_eq!(config.max_init_time_ms, 5_000);
    assert_eq!(config.max_block_time_ms, 2);
    assert_eq!(config.optimization_level, 2);
}

#[test]
fn test_wasm_config_json_defaults() {
    let config: WasmConfig = serde_json::from_str(r#"{ "fuel_per_block": 1000 }"#).expect("parse");
    assert_eq!(config.fuel_per_block, Some(1000));
    assert_eq!(config.max_memory, WasmConfig::default().max_memory);
    assert_eq!(config.max_block_time_ms, WasmConfig::default().max_block_time_ms);
}

#[test]
fn test_wasi_capabilities_none() {
    let caps = WasiCapabilities::none();
    assert!(!caps.stdout);
    assert!(!caps.stderr);
    assert!(caps.env_vars.is_empty());
    assert!(caps.args.is_empty());
}

#[test]
fn test_wasi_capabilities_builder() {
    let caps = WasiCapabilities::none()
        .stdout(true)
        .stderr(true)
        .env("DEBUG", "1")
        .arg("--verbose");

    assert!(caps.stdout);
    assert!(caps.stderr);
    assert_eq!(caps.env_vars.len(), 1);
    assert_eq!(caps.args.len(), 1);
}

#[test]
fn test_runtime_creation() {
    assert!(WasmRuntime::new(WasmConfig::default()).is_ok());
    assert!(WasmRuntime::new(WasmConfig::realtime()).is_ok());
    assert!(WasmRuntime::new(WasmConfig::development().simd(false)).is_ok());
}

#[test]
fn test_runtime_rejects_zero_deadlines() {
    let no_block_limit = WasmConfig::default().max_block_time(Duration::ZERO);
    assert!(matches!(WasmRuntime::new(no_block_limit), Err(LoadError::Config(_))));

    let no_init_limit = WasmConfig {
        max_init_time_ms: 0,
        ..WasmConfig::default()
    };
    assert!(matches!(WasmRuntime::new(no_init_limit), Err(LoadError::Config(_))));
}

#[test]
fn test_compile_wat_to_binary() {
    let runtime = WasmRuntime::new(WasmConfig::default()).expect("runtime");
    let module = runtime.compile("echo", ECHO_INIT.as_bytes()).expect("compile failed");
    assert_eq!(module.name(), "echo");
    assert!(module.binary().starts_with(b"\0asm"));
    assert!(module.has_init());
    assert!(!module.has_dealloc());

    let mut exports: Vec<&str> = module.exports().collect();
    exports.sort_unstable();
    assert_eq!(exports, ["alloc", "init", "memory", "process"]);
}

#[test]
fn test_compile_rejects_garbage() {
    let runtime = WasmRuntime::new(WasmConfig::default()).expect("runtime");
    let err = runtime.compile("garbage", b"(module (func").unwrap_err();
    assert!(matches!(err, LoadError::InvalidModule { .. }));
}

#[test]
fn test_compile_requires_alloc() {
    let runtime = WasmRuntime::new(WasmConfig::default()).expect("runtime");
    let wat = r#"(module
      (memory (export "memory") 1)
      (func (export "process") (param i32 i32 i32 i32) (result i32) (i32.const 0)))"#;
    let err = runtime.compile("no-alloc", wat.as_bytes()).unwrap_err();
    assert!(matches!(err, LoadError::MissingExport { export: "alloc", .. }));
}

#[test]
fn test_instance_receives_init_arguments() {
    let runtime = WasmRuntime::new(WasmConfig::default()).expect("runtime");
    let layout = BlockLayout::new(2, 8);
    let (sink, _rx) = DiagnosticSink::channel(8);
    let mut instance = ProcessorInstance::new(&params(&runtime, ECHO_INIT, layout), sink).expect("init failed");

    let input: Vec<f32> = (0..16).map(|i| i as f32).collect();
    let mut output = vec![0.0f32; 16];
    instance.process(&input, &mut output).expect("process failed");

    assert_eq!(&output[..3], &[44100.0, 2.0, 8.0]);
    assert_eq!(&output[3..], &input[3..]);
    assert_eq!(instance.layout(), layout);
}

#[test]
fn test_instance_buffers_do_not_overlap() {
    let runtime = WasmRuntime::new(WasmConfig::default()).expect("runtime");
    let layout = BlockLayout::new(1, 64);
    let (sink, _rx) = DiagnosticSink::channel(8);
    let instance = ProcessorInstance::new(&params(&runtime, ECHO_INIT, layout), sink).expect("init failed");

    let (in_ptr, out_ptr) = instance.buffer_offsets();
    assert_eq!(in_ptr, 256);
    assert!(out_ptr >= in_ptr + 64 * 4);
}

#[test]
fn test_instance_rejects_bad_alloc() {
    let runtime = WasmRuntime::new(WasmConfig::default()).expect("runtime");
    let (sink, _rx) = DiagnosticSink::channel(8);
    let result = ProcessorInstance::new(&params(&runtime, BAD_ALLOC, BlockLayout::new(1, 128)), sink);
    assert!(matches!(result, Err(InitError::Alloc(_))));
}

#[test]
fn test_instance_fuel_refilled_per_block() {
    let runtime = WasmRuntime::new(WasmConfig::default().fuel_per_block(10_000)).expect("runtime");
    let layout = BlockLayout::new(1, 32);
    let (sink, _rx) = DiagnosticSink::channel(8);
    let mut instance = ProcessorInstance::new(&params(&runtime, ECHO_INIT, layout), sink).expect("init failed");

    let input = vec![0.5f32; 32];
    let mut output = vec![0.0f32; 32];
    for _ in 0..3 {
        instance.process(&input, &mut output).expect("process failed");
        let remaining = instance.remaining_fuel().expect("metered");
        assert!(remaining < 10_000);
        assert!(remaining > 0);
    }
}

#[test]
fn test_unmetered_instance_reports_no_fuel() {
    let runtime = WasmRuntime::new(WasmConfig::default()).expect("runtime");
    let (sink, _rx) = DiagnosticSink::channel(8);
    let instance =
        ProcessorInstance::new(&params(&runtime, ECHO_INIT, BlockLayout::new(1, 4)), sink).expect("init failed");
    assert_eq!(instance.remaining_fuel(), None);
}

#[test]
fn test_instance_trap_is_classified() {
    let runtime = WasmRuntime::new(WasmConfig::default()).expect("runtime");
    let wat = r#"(module
      (memory (export "memory") 1)
      (func (export "alloc") (param i32) (result i32) (i32.const 1024))
      (func (export "process") (param i32 i32 i32 i32) (result i32)
        (i32.div_s (i32.const 1) (i32.const 0))))"#;
    let (sink, _rx) = DiagnosticSink::channel(8);
    let mut instance =
        ProcessorInstance::new(&params(&runtime, wat, BlockLayout::new(1, 4)), sink).expect("init failed");

    let mut output = [0.0f32; 4];
    let err = instance.process(&[0.0; 4], &mut output).unwrap_err();
    assert!(matches!(err, RuntimeError::Trap(_)));
}

#[test]
fn test_runaway_init_hits_deadline() {
    let config = WasmConfig::default().max_init_time(Duration::from_millis(50));
    let runtime = WasmRuntime::new(config).expect("runtime");
    let (sink, _rx) = DiagnosticSink::channel(8);

    let start = Instant::now();
    let result = ProcessorInstance::new(&params(&runtime, RUNAWAY, BlockLayout::new(1, 4)), sink);
    assert!(matches!(result, Err(InitError::Deadline(50))));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_runaway_process_hits_deadline() {
    let config = WasmConfig::default().max_block_time(Duration::from_millis(20));
    let runtime = WasmRuntime::new(config).expect("runtime");
    let (sink, _rx) = DiagnosticSink::channel(8);
    let mut instance = ProcessorInstance::new(&params(&runtime, RUNAWAY_PROCESS, BlockLayout::new(1, 4)), sink)
        .expect("init failed");

    let mut output = [0.0f32; 4];
    for _ in 0..2 {
        let start = Instant::now();
        let err = instance.process(&[0.0; 4], &mut output).unwrap_err();
        assert_eq!(err, RuntimeError::Deadline(20));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}

#[test]
fn test_cancelled_init_stops_early() {
    let config = WasmConfig::default().max_init_time(Duration::from_secs(600));
    let runtime = WasmRuntime::new(config).expect("runtime");
    let (sink, _rx) = DiagnosticSink::channel(8);
    let cancel = Arc::new(AtomicBool::new(true));

    let start = Instant::now();
    let result =
        ProcessorInstance::cancellable(&params(&runtime, RUNAWAY, BlockLayout::new(1, 4)), sink, cancel);
    assert!(matches!(result, Err(InitError::Deadline(_))));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_log_import_emits_raw_bytes() {
    let runtime = WasmRuntime::new(WasmConfig::default()).expect("runtime");
    let wat = r#"(module
      (import "worklet" "log" (func $log (param i32 i32 i32)))
      (memory (export "memory") 1)
      (data (i32.const 8) "caf\c3\a9")
      (func (export "alloc") (param i32) (result i32) (i32.const 1024))
      (func (export "init") (param i32 i32 i32) (result i32)
        (call $log (i32.const 1) (i32.const 8) (i32.const 5))
        (i32.const 0))
      (func (export "process") (param i32 i32 i32 i32) (result i32) (i32.const 0)))"#;
    let (sink, rx) = DiagnosticSink::channel(8);
    let _instance =
        ProcessorInstance::new(&params(&runtime, wat, BlockLayout::new(1, 4)), sink).expect("init failed");

    let diagnostic = rx.try_recv().expect("log line expected");
    assert!(matches!(diagnostic, Diagnostic::Module { ref bytes, .. } if bytes.as_slice() == "café".as_bytes()));
    assert_eq!(diagnostic.text(), "café");
}

#[test]
fn test_latency_stats_empty() {
    let stats = LatencyStats::new();
    assert_eq!(stats.count(), 0);
    assert_eq!(stats.mean_us(), 0.0);
    assert_eq!(stats.p50_us(), 0);
    assert_eq!(stats.p99_us(), 0);
}

#[test]
fn test_latency_stats_samples() {
    let mut stats = LatencyStats::new();
    stats.record(100);
    stats.record(200);
    stats.record(300);

    assert_eq!(stats.count(), 3);
    assert_eq!(stats.min_us(), 100);
    assert_eq!(stats.max_us(), 300);
    assert!((stats.mean_us() - 200.0).abs() < 0.001);
    assert_eq!(stats.overruns(150), 2);
}

#[test]
fn test_latency_stats_percentiles() {
    let mut stats = LatencyStats::new();
    for i in 1..=100 {
        stats.record(i);
    }

    // index 50 of 1..=100 holds 51
    assert_eq!(stats.p50_us(), 51);
    assert_eq!(stats.p99_us(), 100);
}

#[test]
fn test_latency_stats_window_is_bounded() {
    let mut stats = LatencyStats::with_window(10);
    for i in 1..=1000 {
        stats.record(i);
    }

    assert_eq!(stats.count(), 1000);
    assert_eq!(stats.window_len(), 10);
    assert_eq!(stats.min_us(), 1);
    assert_eq!(stats.max_us(), 1000);
    assert!((stats.mean_us() - 500.5).abs() < 0.001);
    // percentiles only see 991..=1000
    assert_eq!(stats.p50_us(), 996);
    assert_eq!(stats.overruns(995), 5);
}

#[test]
fn test_latency_stats_default_window() {
    let mut stats = LatencyStats::default();
    for _ in 0..DEFAULT_LATENCY_WINDOW + 100 {
        stats.record(7);
    }
    assert_eq!(stats.window_len(), DEFAULT_LATENCY_WINDOW);
    assert_eq!(stats.count(), DEFAULT_LATENCY_WINDOW + 100);
}

#[test]
fn test_latency_stats_summary() {
    let mut stats = LatencyStats::new();
    stats.record(10);
    stats.record(20);

    let summary = stats.summary();
    assert!(summary.contains("n=2"));
    assert!(summary.contains("min=10us"));
    assert!(summary.contains("max=20us"));
}
