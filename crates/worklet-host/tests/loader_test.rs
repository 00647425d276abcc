//! Integration tests for module loading and session start.

mod common;

use common::{fixture, loader, module};
use worklet_host::{
    AudioBlock, BlockLayout, LoadError, MemoryBinding, ModuleLoader, ModuleSource, ProcessorState,
    SessionConfig, WasmConfig,
};

#[tokio::test]
async fn test_start_from_path() {
    let loader = loader();
    let source = ModuleSource::Path(fixture("gain"));
    let mut session = loader
        .start(&source, SessionConfig::new(1, 128))
        .await
        .expect("start failed");

    assert_eq!(session.module_name(), "gain");
    let processed = session
        .process(AudioBlock::silent(BlockLayout::new(1, 128)))
        .expect("process failed");
    assert!(processed.outcome.is_processed());
    assert_eq!(session.state(), ProcessorState::Ready);
}

#[tokio::test]
async fn test_start_from_bytes() {
    let loader = loader();
    let bytes = std::fs::read(fixture("gain")).expect("fixture");
    let source = ModuleSource::bytes("inline-gain", bytes);
    let session = loader
        .start(&source, SessionConfig::new(2, 32))
        .await
        .expect("start failed");
    assert_eq!(session.module_name(), "inline-gain");
}

#[tokio::test]
async fn test_missing_file() {
    let loader = loader();
    let source = ModuleSource::parse("does/not/exist.wasm");
    let err = loader
        .start(&source, SessionConfig::new(1, 128))
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::Io(_)));
}

#[tokio::test]
async fn test_invalid_bytes() {
    let loader = loader();
    let source = ModuleSource::bytes("junk", b"\0asm\x01\0\0\0garbage".to_vec());
    let err = loader
        .start(&source, SessionConfig::new(1, 128))
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::InvalidModule { ref name, .. } if name == "junk"));
}

#[tokio::test]
async fn test_invalid_config_rejected_before_loading() {
    let loader = loader();
    // The path does not exist either; the configuration error wins
    let source = ModuleSource::parse("does/not/exist.wasm");
    let err = loader
        .start(&source, SessionConfig::new(0, 128))
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::Config(_)));
}

#[test]
fn test_missing_process_export() {
    let err = loader().load_file(fixture("missing_process")).unwrap_err();
    assert!(matches!(err, LoadError::MissingExport { export: "process", .. }));
}

#[test]
fn test_wrong_process_signature() {
    let err = loader().load_file(fixture("wrong_signature")).unwrap_err();
    assert!(matches!(err, LoadError::ExportSignature { export: "process", .. }));
}

#[test]
fn test_unsupported_import() {
    let err = loader().load_file(fixture("unsupported_import")).unwrap_err();
    match err {
        LoadError::UnsupportedImport { module, name } => {
            assert_eq!(module, "env");
            assert_eq!(name, "now");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_module_without_memory() {
    let err = loader().load_file(fixture("no_memory")).unwrap_err();
    assert!(matches!(err, LoadError::MissingExport { export: "memory", .. }));
}

#[test]
fn test_shared_memory_needs_threads() {
    let loader = ModuleLoader::new(WasmConfig::default().threads(false)).expect("loader");
    let err = loader.load_file(fixture("shared_gain")).unwrap_err();
    assert!(matches!(err, LoadError::InvalidModule { .. }));
}

#[test]
fn test_module_inspection() {
    let loader = loader();

    let gain = module(&loader, "gain");
    assert_eq!(gain.name(), "gain");
    assert!(gain.has_init());
    assert!(gain.has_dealloc());
    assert_eq!(gain.memory_binding(), &MemoryBinding::Exported);
    assert!(gain.binary().starts_with(b"\0asm"));
    let exports: Vec<&str> = gain.exports().collect();
    for name in ["memory", "alloc", "dealloc", "init", "process"] {
        assert!(exports.contains(&name), "missing {}", name);
    }

    let shared = module(&loader, "shared_gain");
    assert!(!shared.has_init());
    assert!(shared.memory_binding().requires_shared_handle());
    assert!(matches!(
        shared.memory_binding(),
        MemoryBinding::ImportedShared { module, name, .. } if module == "env" && name == "memory"
    ));

    let private = module(&loader, "private_import");
    assert!(!private.memory_binding().requires_shared_handle());

    let logger = module(&loader, "logger");
    assert!(logger
        .imports()
        .any(|(module, name)| module == "worklet" && name == "log"));
}

#[test]
fn test_prepare_allocates_shared_memory() {
    let loader = loader();
    let config = SessionConfig::new(2, 64);

    let params = loader
        .prepare(&module(&loader, "shared_gain"), &config)
        .expect("prepare failed");
    let handle = params.memory.expect("shared memory expected");
    assert_eq!(handle.size_bytes(), 65536);
    assert_eq!(params.layout, BlockLayout::new(2, 64));
    assert_eq!(params.sample_rate, 48000);

    let params = loader
        .prepare(&module(&loader, "gain"), &config)
        .expect("prepare failed");
    assert!(params.memory.is_none());
}

#[test]
fn test_prepare_rejects_foreign_module() {
    let first = loader();
    let second = loader();
    let err = second
        .prepare(&module(&first, "gain"), &SessionConfig::new(1, 128))
        .unwrap_err();
    assert!(matches!(err, LoadError::Config(_)));
}

#[cfg(feature = "fetch")]
mod fetch {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve a single HTTP response on a local port and return its URL.
    async fn serve_once(status: &'static str, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut request = vec![0u8; 4096];
            let _ = socket.read(&mut request).await;
            let head = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/wasm\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                status,
                body.len()
            );
            socket.write_all(head.as_bytes()).await.expect("write head");
            socket.write_all(&body).await.expect("write body");
            socket.shutdown().await.ok();
        });

        format!("http://{}/modules/gain.wasm", addr)
    }

    #[tokio::test]
    async fn test_fetch_not_found() {
        let url = serve_once("404 Not Found", Vec::new()).await;
        let err = loader()
            .start(&ModuleSource::parse(&url), SessionConfig::new(1, 128))
            .await
            .unwrap_err();
        match err {
            LoadError::Status { url: failed, status } => {
                assert_eq!(status, 404);
                assert_eq!(failed, url);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_and_start() {
        let body = std::fs::read(fixture("gain")).expect("fixture");
        let url = serve_once("200 OK", body).await;
        let source = ModuleSource::parse(&url);
        assert_eq!(source.name(), "gain");

        let mut session = loader()
            .start(&source, SessionConfig::new(1, 64))
            .await
            .expect("start failed");
        let processed = session
            .process(AudioBlock::silent(BlockLayout::new(1, 64)))
            .expect("process failed");
        assert!(processed.outcome.is_processed());
    }

    #[tokio::test]
    async fn test_fetch_connection_refused() {
        // Bind then drop to get a port nobody listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            listener.local_addr().expect("addr")
        };
        let err = loader()
            .start(
                &ModuleSource::parse(&format!("http://{}/gain.wasm", addr)),
                SessionConfig::new(1, 128),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Fetch { .. }));
    }
}
