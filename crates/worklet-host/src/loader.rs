//! The module loader: everything that happens before the real-time thread.
//!
//! Fetching, WAT decoding, compilation, ABI validation, configuration checks
//! and shared memory allocation all happen here, so that any failure reaches
//! the caller of [`ModuleLoader::start`] instead of being discovered inside
//! the isolated context.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::SessionConfig;
use crate::error::{LoadError, Result};
use crate::processor::InitParams;
use crate::session::Session;
use crate::wasm::{MemoryBinding, ProcessingModule, SharedMemoryHandle, WasmConfig, WasmRuntime};

/// Where a processing module comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSource {
    /// A `.wasm` or `.wat` file on disk
    Path(PathBuf),
    /// An HTTP(S) URL
    Url(String),
    /// Bytes already in memory (bundled assets, tests)
    Bytes {
        /// Module name used in logs and errors
        name: String,
        /// Binary or WAT text
        bytes: Vec<u8>,
    },
}

impl ModuleSource {
    /// Interpret a command-line style locator: URLs by scheme, anything else as a path.
    pub fn parse(locator: &str) -> Self {
        if locator.starts_with("http://") || locator.starts_with("https://") {
            ModuleSource::Url(locator.to_string())
        } else {
            ModuleSource::Path(PathBuf::from(locator))
        }
    }

    /// In-memory module.
    pub fn bytes(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        ModuleSource::Bytes {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    /// Short module name: file stem, last URL segment, or the given name.
    pub fn name(&self) -> String {
        match self {
            ModuleSource::Path(path) => path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("unknown")
                .to_string(),
            ModuleSource::Url(url) => {
                let path = url.split(['?', '#']).next().unwrap_or(url);
                let segment = path.trim_end_matches('/').rsplit('/').next().unwrap_or(path);
                segment
                    .rsplit_once('.')
                    .map(|(stem, _)| stem)
                    .unwrap_or(segment)
                    .to_string()
            }
            ModuleSource::Bytes { name, .. } => name.clone(),
        }
    }
}

impl fmt::Display for ModuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleSource::Path(path) => write!(f, "{}", path.display()),
            ModuleSource::Url(url) => write!(f, "{}", url),
            ModuleSource::Bytes { name, bytes } => write!(f, "<{}: {} bytes>", name, bytes.len()),
        }
    }
}

/// Loads modules and starts sessions.
#[derive(Clone)]
pub struct ModuleLoader {
    runtime: WasmRuntime,
}

impl ModuleLoader {
    /// Create a loader with its own engine.
    pub fn new(config: WasmConfig) -> Result<Self> {
        Ok(Self {
            runtime: WasmRuntime::new(config)?,
        })
    }

    /// The underlying runtime.
    pub fn runtime(&self) -> &WasmRuntime {
        &self.runtime
    }

    /// Fetch the raw module bytes.
    pub async fn fetch(&self, source: &ModuleSource) -> Result<Vec<u8>> {
        match source {
            ModuleSource::Path(path) => {
                tracing::debug!(path = %path.display(), "reading module");
                Ok(tokio::fs::read(path).await?)
            }
            ModuleSource::Url(url) => fetch_url(url).await,
            ModuleSource::Bytes { bytes, .. } => Ok(bytes.clone()),
        }
    }

    /// Decode, compile and validate module bytes.
    pub fn compile(&self, name: &str, bytes: &[u8]) -> Result<ProcessingModule> {
        let module = self.runtime.compile(name, bytes)?;
        tracing::debug!(
            module = %module.name(),
            bytes = module.binary().len(),
            memory = ?module.memory_binding(),
            has_init = module.has_init(),
            "module compiled"
        );
        Ok(module)
    }

    /// Fetch and compile.
    pub async fn load(&self, source: &ModuleSource) -> Result<ProcessingModule> {
        let bytes = self.fetch(source).await?;
        self.compile(&source.name(), &bytes)
    }

    /// Read and compile a module file without an async runtime.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<ProcessingModule> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        self.compile(&ModuleSource::Path(path.to_path_buf()).name(), &bytes)
    }

    /// Build the initialization parameters for a session, allocating the
    /// shared memory when the module imports one.
    pub fn prepare(&self, module: &ProcessingModule, config: &SessionConfig) -> Result<InitParams> {
        config.validate()?;

        if !wasmtime::Engine::same(module.module().engine(), self.runtime.engine()) {
            return Err(LoadError::Config(format!(
                "module '{}' was compiled by a different loader",
                module.name()
            )));
        }

        let memory = match module.memory_binding() {
            MemoryBinding::ImportedShared { ty, .. } => {
                let handle = SharedMemoryHandle::allocate(self.runtime.engine(), ty.clone())?;
                tracing::debug!(module = %module.name(), bytes = handle.size_bytes(), "shared memory allocated");
                Some(handle)
            }
            MemoryBinding::Exported | MemoryBinding::ImportedPrivate { .. } => None,
        };

        Ok(InitParams {
            module: module.clone(),
            memory,
            layout: config.layout(),
            sample_rate: config.sample_rate,
            wasm: self.runtime.config().clone(),
        })
    }

    /// Session start: load the module and start the real-time thread.
    ///
    /// Any load or configuration error is returned here and no thread is created.
    pub async fn start(&self, source: &ModuleSource, config: SessionConfig) -> Result<Session> {
        config.validate()?;
        let module = match self.load(source).await {
            Ok(module) => module,
            Err(e) => {
                tracing::warn!(source = %source, error = %e, "module load failed");
                return Err(e);
            }
        };
        self.start_with_module(module, config)
    }

    /// Start a session around an already loaded module.
    pub fn start_with_module(&self, module: ProcessingModule, config: SessionConfig) -> Result<Session> {
        let params = self.prepare(&module, &config)?;
        Session::spawn(params, &config)
    }
}

#[cfg(feature = "fetch")]
async fn fetch_url(url: &str) -> Result<Vec<u8>> {
    tracing::debug!(url, "fetching module");

    let response = reqwest::get(url).await.map_err(|e| LoadError::Fetch {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(LoadError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let bytes = response.bytes().await.map_err(|e| LoadError::Fetch {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    Ok(bytes.to_vec())
}

#[cfg(not(feature = "fetch"))]
async fn fetch_url(url: &str) -> Result<Vec<u8>> {
    Err(LoadError::Unsupported(format!(
        "{} (built without the `fetch` feature)",
        url
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_locator() {
        assert_eq!(
            ModuleSource::parse("https://example.com/dsp/gain.wasm"),
            ModuleSource::Url("https://example.com/dsp/gain.wasm".to_string())
        );
        assert_eq!(
            ModuleSource::parse("modules/gain.wasm"),
            ModuleSource::Path(PathBuf::from("modules/gain.wasm"))
        );
    }

    #[test]
    fn test_source_names() {
        assert_eq!(ModuleSource::parse("modules/gain.wasm").name(), "gain");
        assert_eq!(ModuleSource::parse("http://host/a/reverb.wasm?v=3").name(), "reverb");
        assert_eq!(ModuleSource::parse("http://host/a/plain").name(), "plain");
        assert_eq!(ModuleSource::bytes("inline", vec![0u8; 4]).name(), "inline");
    }

    #[test]
    fn test_display() {
        assert_eq!(ModuleSource::bytes("inline", vec![0u8; 4]).to_string(), "<inline: 4 bytes>");
    }
}
