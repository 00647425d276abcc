//! Compiled processing modules and their ABI check.

use std::sync::Arc;

use wasmtime::{ExternType, FuncType, MemoryType, Module, ValType};

use super::host_functions::{LOG_IMPORT_MODULE, LOG_IMPORT_NAME};
use super::runtime::EpochClock;
use crate::error::{LoadError, Result};

/// Required export: `alloc(size: i32) -> i32`
pub(crate) const ALLOC_EXPORT: &str = "alloc";
/// Required export: `process(in_ptr, out_ptr, frames, channels) -> status`
pub(crate) const PROCESS_EXPORT: &str = "process";
/// Optional export: `init(sample_rate, channels, frames) -> status`
pub(crate) const INIT_EXPORT: &str = "init";
/// Optional export: `dealloc(ptr, size)`
pub(crate) const DEALLOC_EXPORT: &str = "dealloc";
/// Export name of a module-owned memory
pub(crate) const MEMORY_EXPORT: &str = "memory";

const WASI_PREVIEW1: &str = "wasi_snapshot_preview1";

/// Where an instance's linear memory comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryBinding {
    /// The module defines and exports `memory`
    Exported,
    /// The module imports a private memory; it is created inside the isolated context
    ImportedPrivate {
        /// Import namespace
        module: String,
        /// Import field name
        name: String,
        /// Declared type
        ty: MemoryType,
    },
    /// The module imports a shared memory; the loader allocates it up front
    ImportedShared {
        /// Import namespace
        module: String,
        /// Import field name
        name: String,
        /// Declared type
        ty: MemoryType,
    },
}

impl MemoryBinding {
    /// Whether the loader must pre-allocate a shared memory handle.
    pub fn requires_shared_handle(&self) -> bool {
        matches!(self, MemoryBinding::ImportedShared { .. })
    }
}

/// A compiled, ABI-checked processing module.
///
/// Immutable and cheap to clone; safe to hand to the real-time thread.
#[derive(Clone)]
pub struct ProcessingModule {
    name: String,
    module: Module,
    binary: Arc<[u8]>,
    memory: MemoryBinding,
    has_init: bool,
    has_dealloc: bool,
    clock: Arc<EpochClock>,
}

impl ProcessingModule {
    /// Check a compiled module against the processing ABI.
    pub(crate) fn from_compiled(
        name: &str,
        module: Module,
        binary: Vec<u8>,
        clock: Arc<EpochClock>,
    ) -> Result<Self> {
        check_func(name, &module, ALLOC_EXPORT, &[ValType::I32], &[ValType::I32], "(i32) -> i32")?;
        check_func(
            name,
            &module,
            PROCESS_EXPORT,
            &[ValType::I32, ValType::I32, ValType::I32, ValType::I32],
            &[ValType::I32],
            "(i32, i32, i32, i32) -> i32",
        )?;

        let has_init = match module.get_export(INIT_EXPORT) {
            Some(_) => {
                check_func(
                    name,
                    &module,
                    INIT_EXPORT,
                    &[ValType::I32, ValType::I32, ValType::I32],
                    &[ValType::I32],
                    "(i32, i32, i32) -> i32",
                )?;
                true
            }
            None => false,
        };
        let has_dealloc = match module.get_export(DEALLOC_EXPORT) {
            Some(_) => {
                check_func(name, &module, DEALLOC_EXPORT, &[ValType::I32, ValType::I32], &[], "(i32, i32)")?;
                true
            }
            None => false,
        };

        let memory = resolve_memory(name, &module)?;

        Ok(Self {
            name: name.to_string(),
            module,
            binary: binary.into(),
            memory,
            has_init,
            has_dealloc,
            clock,
        })
    }

    /// Module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The compiled module.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// The validated binary the module was compiled from.
    pub fn binary(&self) -> &[u8] {
        &self.binary
    }

    /// How the instance's linear memory is provided.
    pub fn memory_binding(&self) -> &MemoryBinding {
        &self.memory
    }

    /// Whether the module exports `init`.
    pub fn has_init(&self) -> bool {
        self.has_init
    }

    /// Whether the module exports `dealloc`.
    pub fn has_dealloc(&self) -> bool {
        self.has_dealloc
    }

    /// Names of every export, functions and memories alike.
    pub fn exports(&self) -> impl Iterator<Item = &str> {
        self.module.exports().map(|e| e.name())
    }

    /// Imports as `(namespace, name)` pairs.
    pub fn imports(&self) -> impl Iterator<Item = (&str, &str)> {
        self.module.imports().map(|i| (i.module(), i.name()))
    }

    pub(crate) fn clock(&self) -> &Arc<EpochClock> {
        &self.clock
    }
}

impl std::fmt::Debug for ProcessingModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingModule")
            .field("name", &self.name)
            .field("binary_len", &self.binary.len())
            .field("memory", &self.memory)
            .field("has_init", &self.has_init)
            .finish()
    }
}

fn check_func(
    name: &str,
    module: &Module,
    export: &'static str,
    params: &[ValType],
    results: &[ValType],
    expected: &'static str,
) -> Result<()> {
    let ty = match module.get_export(export) {
        Some(ExternType::Func(ty)) => ty,
        Some(other) => {
            return Err(LoadError::ExportSignature {
                export,
                expected,
                found: format!("{:?}", other),
            })
        }
        None => {
            return Err(LoadError::MissingExport {
                name: name.to_string(),
                export,
            })
        }
    };

    if !signature_matches(&ty, params, results) {
        return Err(LoadError::ExportSignature {
            export,
            expected,
            found: describe(&ty),
        });
    }
    Ok(())
}

fn signature_matches(ty: &FuncType, params: &[ValType], results: &[ValType]) -> bool {
    fn same(found: impl ExactSizeIterator<Item = ValType>, wanted: &[ValType]) -> bool {
        found.len() == wanted.len()
            && found.zip(wanted).all(|(a, b)| ValType::eq(&a, b))
    }
    same(ty.params(), params) && same(ty.results(), results)
}

fn describe(ty: &FuncType) -> String {
    let params: Vec<String> = ty.params().map(|p| p.to_string()).collect();
    let results: Vec<String> = ty.results().map(|r| r.to_string()).collect();
    format!("({}) -> ({})", params.join(", "), results.join(", "))
}

fn resolve_memory(name: &str, module: &Module) -> Result<MemoryBinding> {
    let mut binding = None;

    for import in module.imports() {
        match import.ty() {
            ExternType::Memory(ty) => {
                let module_name = import.module().to_string();
                let field = import.name().to_string();
                binding = Some(if ty.is_shared() {
                    MemoryBinding::ImportedShared { module: module_name, name: field, ty }
                } else {
                    MemoryBinding::ImportedPrivate { module: module_name, name: field, ty }
                });
            }
            ExternType::Func(_)
                if import.module() == WASI_PREVIEW1
                    || (import.module() == LOG_IMPORT_MODULE && import.name() == LOG_IMPORT_NAME) => {}
            _ => {
                return Err(LoadError::UnsupportedImport {
                    module: import.module().to_string(),
                    name: import.name().to_string(),
                })
            }
        }
    }

    if let Some(binding) = binding {
        return Ok(binding);
    }

    match module.get_export(MEMORY_EXPORT) {
        Some(ExternType::Memory(_)) => Ok(MemoryBinding::Exported),
        _ => Err(LoadError::MissingExport {
            name: name.to_string(),
            export: MEMORY_EXPORT,
        }),
    }
}
