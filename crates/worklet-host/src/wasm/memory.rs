//! Linear memory access and the shared memory handle.
//!
//! Sample buffers use planar little-endian f32 layout:
//! ```text
//! [ch0[0], ch0[1], ..., ch0[frames-1], ch1[0], ...]
//! ```
//! Offsets are byte offsets into the module's linear memory (wasm32).

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::{Arc, Mutex};

use wasmtime::{AsContext, AsContextMut, Engine, Memory, MemoryType, SharedMemory};

use crate::error::{LoadError, RuntimeError};

/// Reference to a shared linear memory allocated by the loader.
///
/// Clones refer to the same region. The region is released exactly once:
/// the first [`release`](Self::release) drops the loader's reference and every
/// later call is a no-op. The bytes themselves are only reachable from inside
/// the crate, through the instance that imports the memory.
#[derive(Clone)]
pub struct SharedMemoryHandle {
    inner: Arc<Mutex<Option<SharedMemory>>>,
}

impl SharedMemoryHandle {
    /// Allocate a shared memory matching the module's import type.
    pub fn allocate(engine: &Engine, ty: MemoryType) -> Result<Self, LoadError> {
        if !ty.is_shared() {
            return Err(LoadError::Config(
                "shared memory handle requires a shared memory type".to_string(),
            ));
        }
        let memory = SharedMemory::new(engine, ty)
            .map_err(|e| LoadError::Runtime(format!("shared memory allocation failed: {}", e)))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Some(memory))),
        })
    }

    /// The underlying memory, or `None` once released.
    pub(crate) fn memory(&self) -> Option<SharedMemory> {
        self.lock().clone()
    }

    /// Current size in bytes (0 once released).
    pub fn size_bytes(&self) -> usize {
        self.lock().as_ref().map(|m| m.data_size()).unwrap_or(0)
    }

    /// Release the region. Returns `true` only for the call that released it.
    pub fn release(&self) -> bool {
        self.lock().take().is_some()
    }

    /// Whether the region has been released.
    pub fn is_released(&self) -> bool {
        self.lock().is_none()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<SharedMemory>> {
        // Poisoning cannot leave the Option in a torn state
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for SharedMemoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemoryHandle")
            .field("released", &self.is_released())
            .field("size_bytes", &self.size_bytes())
            .finish()
    }
}

/// The linear memory an instance reads samples from and writes samples to.
#[derive(Clone)]
pub(crate) enum LinearMemory {
    /// Memory owned by the instance's store (exported or imported private)
    Private(Memory),
    /// Memory provided through a [`SharedMemoryHandle`]
    Shared(SharedMemory),
}

impl LinearMemory {
    /// Write f32 samples at `offset`.
    pub(crate) fn write_samples(
        &self,
        mut store: impl AsContextMut,
        offset: usize,
        samples: &[f32],
    ) -> Result<(), RuntimeError> {
        let byte_len = samples.len() * 4;
        match self {
            LinearMemory::Private(memory) => {
                let data = memory.data_mut(&mut store);
                check_bounds(data.len(), offset, byte_len)?;
                for (i, &v) in samples.iter().enumerate() {
                    let base = offset + i * 4;
                    data[base..base + 4].copy_from_slice(&v.to_le_bytes());
                }
            }
            LinearMemory::Shared(memory) => {
                let dst = shared_range(memory, offset, byte_len)?;
                for (i, &v) in samples.iter().enumerate() {
                    let bytes = v.to_le_bytes();
                    // SAFETY: see shared_range.
                    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.add(i * 4), 4) };
                }
            }
        }
        Ok(())
    }

    /// Read f32 samples at `offset` into `out`.
    pub(crate) fn read_samples(
        &self,
        store: impl AsContext,
        offset: usize,
        out: &mut [f32],
    ) -> Result<(), RuntimeError> {
        let byte_len = out.len() * 4;
        match self {
            LinearMemory::Private(memory) => {
                let data = memory.data(&store);
                check_bounds(data.len(), offset, byte_len)?;
                for (i, sample) in out.iter_mut().enumerate() {
                    let base = offset + i * 4;
                    *sample = f32::from_le_bytes([
                        data[base],
                        data[base + 1],
                        data[base + 2],
                        data[base + 3],
                    ]);
                }
            }
            LinearMemory::Shared(memory) => {
                let src = shared_range(memory, offset, byte_len)?;
                for (i, sample) in out.iter_mut().enumerate() {
                    let mut bytes = [0u8; 4];
                    // SAFETY: see shared_range.
                    unsafe { std::ptr::copy_nonoverlapping(src.add(i * 4), bytes.as_mut_ptr(), 4) };
                    *sample = f32::from_le_bytes(bytes);
                }
            }
        }
        Ok(())
    }

    /// Copy raw bytes out of memory.
    pub(crate) fn read_bytes(
        &self,
        store: impl AsContext,
        offset: usize,
        len: usize,
    ) -> Result<Vec<u8>, RuntimeError> {
        match self {
            LinearMemory::Private(memory) => {
                let data = memory.data(&store);
                check_bounds(data.len(), offset, len)?;
                Ok(data[offset..offset + len].to_vec())
            }
            LinearMemory::Shared(memory) => {
                let src = shared_range(memory, offset, len)?;
                let mut bytes = vec![0u8; len];
                // SAFETY: see shared_range.
                unsafe { std::ptr::copy_nonoverlapping(src, bytes.as_mut_ptr(), len) };
                Ok(bytes)
            }
        }
    }

    /// Current size in bytes.
    pub(crate) fn size_bytes(&self, store: impl AsContext) -> usize {
        match self {
            LinearMemory::Private(memory) => memory.data_size(&store),
            LinearMemory::Shared(memory) => memory.data_size(),
        }
    }
}

/// Pointer to `len` bytes at `offset` of a shared memory.
///
/// Callers may copy through the pointer for up to `len` bytes. The range is
/// bounds-checked here and shared memories never shrink. The only agent
/// touching the bytes is the instance importing the memory, which runs on
/// whichever single thread currently owns its store, so host copies never
/// overlap a running call.
fn shared_range(memory: &SharedMemory, offset: usize, len: usize) -> Result<*mut u8, RuntimeError> {
    let data = memory.data();
    check_bounds(data.len(), offset, len)?;
    Ok(UnsafeCell::raw_get(data[offset..].as_ptr()))
}

fn check_bounds(size: usize, offset: usize, len: usize) -> Result<(), RuntimeError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(RuntimeError::OutOfBounds { offset, len }),
    }
}
