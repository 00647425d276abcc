//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::path::PathBuf;

use worklet_host::{
    AudioBlock, BlockLayout, ModuleLoader, ProcessingModule, Session, SessionConfig, WasmConfig,
};

/// Path of a WAT fixture.
pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures")).join(format!("{}.wat", name))
}

/// Loader with the default configuration.
pub fn loader() -> ModuleLoader {
    ModuleLoader::new(WasmConfig::default()).expect("failed to create loader")
}

/// Loader with a per-block fuel budget.
pub fn metered_loader(fuel: u64) -> ModuleLoader {
    ModuleLoader::new(WasmConfig::default().fuel_per_block(fuel)).expect("failed to create loader")
}

/// Compile a fixture.
pub fn module(loader: &ModuleLoader, name: &str) -> ProcessingModule {
    loader.load_file(fixture(name)).expect("failed to load fixture")
}

/// Start a session around a fixture.
pub fn session(loader: &ModuleLoader, name: &str, config: SessionConfig) -> Session {
    loader
        .start_with_module(module(loader, name), config)
        .expect("failed to start session")
}

/// A block where every sample equals `value`.
pub fn constant_block(layout: BlockLayout, value: f32) -> AudioBlock {
    AudioBlock::from_planar(layout, vec![value; layout.samples()]).expect("layout")
}

/// A block holding a ramp that differs per channel.
pub fn ramp_block(layout: BlockLayout) -> AudioBlock {
    let samples = (0..layout.samples())
        .map(|i| (i as f32) / (layout.samples() as f32) - 0.5)
        .collect();
    AudioBlock::from_planar(layout, samples).expect("layout")
}
