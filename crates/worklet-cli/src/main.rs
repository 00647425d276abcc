//! Worklet Command-Line Interface
//!
//! This CLI provides tools for:
//! - Inspecting a processing module's ABI
//! - Streaming raw sample files or generated signals through a module
//! - Measuring per-block latency against the real-time budget

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use worklet_host::{
    AudioBlock, FallbackPolicy, InitPolicy, LatencyStats, MemoryBinding, ModuleLoader, ModuleSource,
    ProcessedBlock, ProcessingModule, Session, SessionConfig, WasmConfig,
};

#[derive(Parser)]
#[command(name = "worklet")]
#[command(author, version, about = "WebAssembly audio worklet host", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Session options shared by `run` and `bench`.
#[derive(clap::Args, Clone)]
struct SessionArgs {
    /// JSON session config (overrides the flags below)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Channel count
    #[arg(short, long, default_value = "2")]
    channels: usize,

    /// Frames per block
    #[arg(short, long, default_value = "128")]
    block_size: usize,

    /// Sample rate in Hz
    #[arg(long, default_value = "48000")]
    sample_rate: u32,

    /// Output when the module cannot produce a block (silence, passthrough)
    #[arg(long, default_value = "silence")]
    fallback: String,

    /// Initialize on a helper thread, giving up after this many blocks
    #[arg(long)]
    background: Option<u32>,

    /// Per-block fuel budget (0 = unmetered)
    #[arg(long, default_value = "50000000")]
    fuel: u64,

    /// Wall-clock limit for one block, in milliseconds
    #[arg(long, default_value = "100")]
    block_deadline: u64,

    /// Wall-clock limit for module initialization, in milliseconds
    #[arg(long, default_value = "2000")]
    init_deadline: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a module's exports, imports and memory binding
    Inspect {
        /// Module path or URL (.wasm or .wat)
        module: String,
    },

    /// Stream samples through a module
    Run {
        /// Module path or URL (.wasm or .wat)
        module: String,

        /// Input file of interleaved little-endian f32 samples
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Generated input when no file is given (sine, noise, silence)
        #[arg(long, default_value = "sine")]
        signal: String,

        /// Tone frequency in Hz for the sine generator
        #[arg(long, default_value = "440.0")]
        frequency: f32,

        /// Length of the generated signal in seconds
        #[arg(long, default_value = "1.0")]
        seconds: f32,

        /// Output file of interleaved little-endian f32 samples
        #[arg(short, long, default_value = "out.f32")]
        output: PathBuf,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// Measure block latency against the real-time budget
    Bench {
        /// Module path or URL (.wasm or .wat)
        module: String,

        /// Number of blocks to process (0 = until Ctrl+C)
        #[arg(short = 'n', long, default_value = "10000")]
        blocks: u64,

        /// Output format (text, json)
        #[arg(long, default_value = "text")]
        output: String,

        #[command(flatten)]
        session: SessionArgs,
    },
}

/// Benchmark report written by `bench --output json`.
#[derive(Serialize)]
struct BenchReport {
    module: String,
    channels: usize,
    block_size: usize,
    sample_rate: u32,
    blocks: usize,
    degraded: u64,
    budget_us: u64,
    overruns: usize,
    min_us: u64,
    mean_us: f64,
    p50_us: u64,
    p99_us: u64,
    max_us: u64,
    dropped_diagnostics: u64,
}

fn parse_fallback(policy: &str) -> Result<FallbackPolicy> {
    match policy.to_lowercase().as_str() {
        "silence" => Ok(FallbackPolicy::Silence),
        "passthrough" => Ok(FallbackPolicy::Passthrough),
        _ => anyhow::bail!("Invalid fallback policy: {}. Use silence or passthrough", policy),
    }
}

fn session_config(args: &SessionArgs) -> Result<SessionConfig> {
    if let Some(path) = &args.config {
        return SessionConfig::from_json_file(path)
            .with_context(|| format!("Failed to load session config {:?}", path));
    }

    let mut config = SessionConfig::new(args.channels, args.block_size)
        .sample_rate(args.sample_rate)
        .fallback(parse_fallback(&args.fallback)?);
    if let Some(max_pending_blocks) = args.background {
        config = config.init(InitPolicy::Background { max_pending_blocks });
    }
    Ok(config)
}

fn wasm_config(args: &SessionArgs) -> WasmConfig {
    let config = WasmConfig::realtime()
        .max_block_time(Duration::from_millis(args.block_deadline))
        .max_init_time(Duration::from_millis(args.init_deadline));
    if args.fuel == 0 {
        WasmConfig {
            fuel_per_block: None,
            ..config
        }
    } else {
        config.fuel_per_block(args.fuel)
    }
}

fn load_module(loader: &ModuleLoader, locator: &str) -> Result<ProcessingModule> {
    let source = ModuleSource::parse(locator);
    let runtime = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
    runtime
        .block_on(loader.load(&source))
        .with_context(|| format!("Failed to load module {}", source))
}

fn start_session(locator: &str, args: &SessionArgs) -> Result<Session> {
    let config = session_config(args)?;
    let loader = ModuleLoader::new(wasm_config(args)).context("Failed to create module loader")?;
    let module = load_module(&loader, locator)?;
    loader
        .start_with_module(module, config)
        .context("Failed to start session")
}

fn stop_flag() -> Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;
    Ok(running)
}

fn write_samples_f32(samples: &[f32], path: &PathBuf) -> Result<()> {
    use byteorder::{LittleEndian, WriteBytesExt};

    let file = File::create(path).context("Failed to create output file")?;
    let mut writer = BufWriter::new(file);

    for &sample in samples {
        writer.write_f32::<LittleEndian>(sample)?;
    }

    writer.flush()?;
    Ok(())
}

fn read_samples_f32(path: &PathBuf) -> Result<Vec<f32>> {
    use byteorder::{LittleEndian, ReadBytesExt};

    let file = File::open(path).context("Failed to open input file")?;
    let metadata = file.metadata()?;
    let num_samples = metadata.len() as usize / 4;

    let mut reader = BufReader::new(file);
    let mut samples = Vec::with_capacity(num_samples);

    for _ in 0..num_samples {
        samples.push(reader.read_f32::<LittleEndian>()?);
    }

    Ok(samples)
}

/// Interleaved test signal, the same on every channel except noise.
fn generate_signal(signal: &str, channels: usize, sample_rate: u32, frequency: f32, seconds: f32) -> Result<Vec<f32>> {
    use rand::Rng;

    let frames = (seconds.max(0.0) * sample_rate as f32) as usize;
    let mut samples = Vec::with_capacity(frames * channels);

    match signal.to_lowercase().as_str() {
        "sine" => {
            let step = 2.0 * std::f32::consts::PI * frequency / sample_rate as f32;
            for n in 0..frames {
                let value = 0.5 * (step * n as f32).sin();
                samples.extend(std::iter::repeat(value).take(channels));
            }
        }
        "noise" => {
            let mut rng = rand::thread_rng();
            for _ in 0..frames * channels {
                samples.push(rng.gen_range(-0.5..0.5));
            }
        }
        "silence" => samples.resize(frames * channels, 0.0),
        _ => anyhow::bail!("Invalid signal: {}. Use sine, noise or silence", signal),
    }

    Ok(samples)
}

fn cmd_inspect(locator: String) -> Result<()> {
    let loader = ModuleLoader::new(WasmConfig::default()).context("Failed to create module loader")?;
    let module = load_module(&loader, &locator)?;

    println!("=== Module: {} ===\n", module.name());
    println!("Binary size:  {} bytes", module.binary().len());
    let memory = match module.memory_binding() {
        MemoryBinding::Exported => "exported \"memory\"".to_string(),
        MemoryBinding::ImportedPrivate { module, name, .. } => format!("imports {}.{} (private)", module, name),
        MemoryBinding::ImportedShared { module, name, .. } => format!("imports {}.{} (shared)", module, name),
    };
    println!("Memory:       {}", memory);
    println!("init:         {}", if module.has_init() { "yes" } else { "no" });
    println!("dealloc:      {}", if module.has_dealloc() { "yes" } else { "no" });

    println!("\nExports:");
    for name in module.exports() {
        println!("  {}", name);
    }

    let imports: Vec<_> = module.imports().collect();
    if !imports.is_empty() {
        println!("\nImports:");
        for (namespace, name) in imports {
            println!("  {}.{}", namespace, name);
        }
    }

    Ok(())
}

fn cmd_run(
    locator: String,
    input: Option<PathBuf>,
    signal: String,
    frequency: f32,
    seconds: f32,
    output: PathBuf,
    args: SessionArgs,
) -> Result<()> {
    let mut session = start_session(&locator, &args)?;
    let layout = session.layout();
    let queue_depth = session.config().queue_depth as u64;

    let samples = match &input {
        Some(path) => read_samples_f32(path)?,
        None => generate_signal(&signal, layout.channels, session.config().sample_rate, frequency, seconds)?,
    };

    let block_len = layout.samples();
    let blocks = samples.len().div_ceil(block_len);
    info!(
        module = session.module_name(),
        layout = %layout,
        blocks,
        "streaming"
    );

    let running = stop_flag()?;
    let mut rendered = Vec::with_capacity(blocks * block_len);
    let mut degraded = 0u64;
    let start = Instant::now();

    let mut collect = |processed: ProcessedBlock, rendered: &mut Vec<f32>| {
        if !processed.outcome.is_processed() {
            degraded += 1;
        }
        rendered.extend(processed.output.to_interleaved());
    };

    for chunk in samples.chunks(block_len) {
        if !running.load(Ordering::SeqCst) {
            warn!("interrupted");
            break;
        }

        let mut interleaved = chunk.to_vec();
        interleaved.resize(block_len, 0.0);
        let block = AudioBlock::from_interleaved(layout, &interleaved)
            .ok_or_else(|| anyhow::anyhow!("Block does not match layout {}", layout))?;
        session.submit(block)?;

        while session.in_flight() >= queue_depth {
            let processed = session.recv()?;
            collect(processed, &mut rendered);
        }
        session.log_diagnostics();
    }

    while session.in_flight() > 0 {
        let processed = session.recv()?;
        collect(processed, &mut rendered);
    }
    session.teardown();
    session.log_diagnostics();

    write_samples_f32(&rendered, &output)?;

    println!("Processed {} blocks ({} degraded) in {:?}", session.stats().count(), degraded, start.elapsed());
    println!("Latency: {}", session.stats().summary());
    println!("Output written to {:?}", output);

    Ok(())
}

fn cmd_bench(locator: String, blocks: u64, output: String, args: SessionArgs) -> Result<()> {
    let mut session = start_session(&locator, &args)?;
    let layout = session.layout();
    let budget_us = session.config().block_period_us();
    let sample_rate = session.config().sample_rate;

    let noise: Vec<f32> = {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        (0..layout.samples()).map(|_| rng.gen_range(-0.5..0.5)).collect()
    };
    let block = AudioBlock::from_planar(layout, noise)
        .ok_or_else(|| anyhow::anyhow!("Block does not match layout {}", layout))?;

    let running = stop_flag()?;

    println!("Worklet Block Benchmark");
    println!("=======================");
    println!("Module:       {}", session.module_name());
    println!("Layout:       {}", layout);
    println!("Budget:       {} us/block", budget_us);
    println!();

    // The first block pays for initialization
    let first = session.process(block.clone())?;
    info!(elapsed_us = first.elapsed_us, state = ?session.state(), "first block");

    let mut stats = LatencyStats::new();
    let mut degraded = 0u64;
    let mut overruns = 0usize;
    let mut count = 0u64;
    let mut last_stats_time = Instant::now();

    while running.load(Ordering::SeqCst) && (blocks == 0 || count < blocks) {
        let processed = session.process(block.clone())?;
        if !processed.outcome.is_processed() {
            degraded += 1;
        }
        if processed.elapsed_us > budget_us {
            overruns += 1;
        }
        stats.record(processed.elapsed_us);
        count += 1;

        if last_stats_time.elapsed() >= Duration::from_secs(1) {
            last_stats_time = Instant::now();
            print!("\r\x1B[K{}", stats.summary());
            std::io::stdout().flush().ok();
            session.log_diagnostics();
        }
    }
    println!("\r\x1B[K");

    session.teardown();
    session.log_diagnostics();

    let report = BenchReport {
        module: session.module_name().to_string(),
        channels: layout.channels,
        block_size: layout.frames,
        sample_rate,
        blocks: stats.count(),
        degraded,
        budget_us,
        overruns,
        min_us: stats.min_us(),
        mean_us: stats.mean_us(),
        p50_us: stats.p50_us(),
        p99_us: stats.p99_us(),
        max_us: stats.max_us(),
        dropped_diagnostics: session.dropped_diagnostics(),
    };

    match output.to_lowercase().as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => {
            println!("Blocks:       {} ({} degraded)", report.blocks, report.degraded);
            println!("Latency:      {}", stats.summary());
            println!("Overruns:     {} over {} us", report.overruns, report.budget_us);
            if report.dropped_diagnostics > 0 {
                println!("Dropped diagnostics: {}", report.dropped_diagnostics);
            }
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Inspect { module } => cmd_inspect(module),

        Commands::Run {
            module,
            input,
            signal,
            frequency,
            seconds,
            output,
            session,
        } => cmd_run(module, input, signal, frequency, seconds, output, session),

        Commands::Bench {
            module,
            blocks,
            output,
            session,
        } => cmd_bench(module, blocks, output, session),
    }
}
