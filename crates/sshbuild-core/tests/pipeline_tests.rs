//! End-to-end pipeline tests.
//!
//! The external tools are shell-script stubs and the terminal is a fake, so
//! these run without ssh access, a container engine or a tty.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sshbuild_core::test_support::{idle_input, CaptureBuffer, FakeTerminal, StubBehavior, StubTools};
use sshbuild_core::{
    BuildConfig, CancelSource, CancelToken, Console, CoreError, Pipeline, PipelineState, Relay,
    EXIT_FAILURE, EXIT_INTERRUPTED, EXIT_USAGE,
};
use tempfile::TempDir;

struct Harness {
    stubs: StubTools,
    context: TempDir,
    scratch_root: TempDir,
    term: Arc<FakeTerminal>,
    out: CaptureBuffer,
}

impl Harness {
    fn new(stubs: StubTools) -> Self {
        let context = tempfile::tempdir().unwrap();
        std::fs::write(context.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        Self {
            stubs,
            context,
            scratch_root: tempfile::tempdir().unwrap(),
            term: Arc::new(FakeTerminal::new()),
            out: CaptureBuffer::new(),
        }
    }

    fn config(&self, host: &str, tag: &str) -> BuildConfig {
        let mut config = BuildConfig::new(host, tag).unwrap();
        config.context_dir = self.context.path().to_path_buf();
        config.scratch_root = self.scratch_root.path().to_path_buf();
        config.serve_addr = "127.0.0.1:0".parse().unwrap();
        config.tools = self.stubs.install();
        config
    }

    async fn run(
        &self,
        config: &BuildConfig,
        cancel: CancelToken,
    ) -> (Result<(), sshbuild_core::PipelineError>, PipelineState) {
        let (input, _writer) = idle_input();
        let relay = Relay::new(self.term.clone(), input, Console::new(self.out.clone()));
        let mut pipeline = Pipeline::new(config, relay, cancel);
        let result = pipeline.run().await;
        (result, pipeline.state())
    }

    /// Echoed command lines, in order
    fn echoed(&self) -> Vec<String> {
        strip_ansi(&self.out.contents())
            .lines()
            .filter_map(|line| line.strip_prefix("$ ").map(str::to_string))
            .collect()
    }

    fn assert_scratch_removed(&self) {
        let leftover: Vec<_> = std::fs::read_dir(self.scratch_root.path())
            .unwrap()
            .collect();
        assert!(leftover.is_empty(), "scratch dir survived: {:?}", leftover);
    }
}

fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            for c in chars.by_ref() {
                if c.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn canonical(path: &Path) -> std::path::PathBuf {
    std::fs::canonicalize(path).unwrap()
}

#[tokio::test]
async fn test_successful_run_echoes_four_commands_in_order() {
    let h = Harness::new(StubTools::new());
    let config = h.config("build01", "myapp:test");

    let (result, state) = h.run(&config, CancelToken::never()).await;
    result.unwrap();
    assert_eq!(state, PipelineState::Done);

    let echoed = h.echoed();
    assert_eq!(echoed.len(), 4, "echoed: {:?}", echoed);
    assert!(echoed[0].contains("-czf") && echoed[0].ends_with("ctx.tar.gz ."));
    assert!(echoed[1].contains("-R 50218:127.0.0.1:"));
    assert!(echoed[1].contains("build01"));
    assert!(echoed[1].contains("build -t myapp:test http://127.0.0.1:50218/ctx.tar.gz"));
    assert!(echoed[2].contains("build01"));
    assert!(echoed[2].contains("save myapp:test > "));
    assert!(echoed[2].ends_with("image.tar"));
    assert!(echoed[3].contains("load -i "));

    let calls = h.stubs.calls();
    assert_eq!(calls.len(), 4);
    assert!(calls[0].starts_with("tar -czf"));
    assert!(calls[1].starts_with("ssh -t"));
    assert!(calls[2].starts_with("ssh build01"));
    assert!(calls[3].starts_with("docker load -i"));

    assert_eq!(h.stubs.loaded_image().unwrap(), b"image-bytes");
    assert_eq!(
        canonical(&h.stubs.archive_cwd().unwrap()),
        canonical(h.context.path())
    );
    assert!(!h.term.is_raw());
    assert_eq!(h.term.raw_entries(), 3, "archive, build and load are relayed");
    h.assert_scratch_removed();
}

#[tokio::test]
async fn test_empty_host_is_usage_error_before_any_command() {
    let h = Harness::new(StubTools::new());
    let config = h.config("", "myapp:test");

    let (result, state) = h.run(&config, CancelToken::never()).await;
    let err = result.unwrap_err();
    assert_eq!(err.exit_code(), EXIT_USAGE);
    assert_eq!(err.reached, PipelineState::Init);
    assert_eq!(state, PipelineState::Aborted);
    assert!(h.echoed().is_empty());
    assert!(h.stubs.calls().is_empty());
    h.assert_scratch_removed();
}

#[tokio::test]
async fn test_archive_failure_never_serves() {
    let mut stubs = StubTools::new();
    stubs.archive = StubBehavior::Fail;
    let h = Harness::new(stubs);
    let config = h.config("build01", "myapp:test");

    let (result, _) = h.run(&config, CancelToken::never()).await;
    let err = result.unwrap_err();
    assert_eq!(err.reached, PipelineState::Init);
    assert_eq!(err.exit_code(), EXIT_FAILURE);
    assert!(matches!(err.source, CoreError::CommandFailed { .. }));
    assert_eq!(h.stubs.calls().len(), 1);
    h.assert_scratch_removed();
}

#[tokio::test]
async fn test_remote_build_failure_stops_before_transfer() {
    let mut stubs = StubTools::new();
    stubs.remote_build = StubBehavior::Fail;
    let h = Harness::new(stubs);
    let config = h.config("build01", "myapp:test");

    let (result, _) = h.run(&config, CancelToken::never()).await;
    let err = result.unwrap_err();
    assert_eq!(err.reached, PipelineState::Serving);
    assert_eq!(err.exit_code(), EXIT_FAILURE);

    let echoed = h.echoed();
    assert_eq!(echoed.len(), 2, "echoed: {:?}", echoed);
    assert!(!h.stubs.calls().iter().any(|c| c.contains("save")));
    assert!(h.stubs.loaded_image().is_none());
    assert!(!h.term.is_raw());
    h.assert_scratch_removed();
}

#[tokio::test]
async fn test_transfer_failure_never_imports() {
    let mut stubs = StubTools::new();
    stubs.remote_save = StubBehavior::Fail;
    let h = Harness::new(stubs);
    let config = h.config("build01", "myapp:test");

    let (result, _) = h.run(&config, CancelToken::never()).await;
    let err = result.unwrap_err();
    assert_eq!(err.reached, PipelineState::Built);
    assert!(!h.stubs.calls().iter().any(|c| c.starts_with("docker load")));
    assert!(h.stubs.loaded_image().is_none());
    h.assert_scratch_removed();
}

#[tokio::test]
async fn test_import_failure_is_runtime_failure() {
    let mut stubs = StubTools::new();
    stubs.load = StubBehavior::Fail;
    let h = Harness::new(stubs);
    let config = h.config("build01", "myapp:test");

    let (result, _) = h.run(&config, CancelToken::never()).await;
    let err = result.unwrap_err();
    assert_eq!(err.reached, PipelineState::Transferred);
    assert_eq!(err.exit_code(), EXIT_FAILURE);
    h.assert_scratch_removed();
}

#[tokio::test]
async fn test_interrupt_during_remote_build() {
    let mut stubs = StubTools::new();
    stubs.remote_build = StubBehavior::Hang;
    let h = Harness::new(stubs);
    let config = h.config("build01", "myapp:test");
    let (source, token) = CancelSource::new();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        source.cancel();
    });

    let start = Instant::now();
    let (result, state) = h.run(&config, token).await;
    canceller.await.unwrap();

    let err = result.unwrap_err();
    assert!(start.elapsed() < Duration::from_secs(15));
    assert!(matches!(err.source, CoreError::Cancelled));
    assert_eq!(err.exit_code(), EXIT_INTERRUPTED);
    assert_eq!(err.reached, PipelineState::Serving);
    assert_eq!(state, PipelineState::Aborted);
    assert!(!h.term.is_raw());
    assert!(!h.stubs.calls().iter().any(|c| c.contains("save")));
    h.assert_scratch_removed();
}

#[tokio::test]
async fn test_already_cancelled_runs_nothing() {
    let h = Harness::new(StubTools::new());
    let config = h.config("build01", "myapp:test");
    let (source, token) = CancelSource::new();
    source.cancel();

    let (result, _) = h.run(&config, token).await;
    let err = result.unwrap_err();
    assert_eq!(err.exit_code(), EXIT_INTERRUPTED);
    assert!(h.stubs.calls().is_empty());
    assert_eq!(h.term.raw_entries(), 0);
    h.assert_scratch_removed();
}

#[tokio::test]
async fn test_occupied_serve_port_aborts_after_archive() {
    let h = Harness::new(StubTools::new());
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = h.config("build01", "myapp:test");
    config.serve_addr = blocker.local_addr().unwrap();

    let (result, _) = h.run(&config, CancelToken::never()).await;
    let err = result.unwrap_err();
    assert!(matches!(err.source, CoreError::ServerBind { .. }));
    assert_eq!(err.reached, PipelineState::ContextPublished);
    assert_eq!(h.stubs.calls().len(), 1);
    h.assert_scratch_removed();
}
