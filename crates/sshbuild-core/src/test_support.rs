//! Test support utilities for sshbuild-core
//!
//! Provides a fake terminal, an output capture buffer and shell-script
//! stand-ins for the external tools so the pipeline can be exercised without
//! a real terminal, ssh access or a container engine.

use crate::{Terminal, Toolchain};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct FakeTerminalState {
    raw: bool,
    raw_entries: usize,
    size_queries: usize,
    size: (u16, u16),
}

/// Terminal double that records mode switches and size queries
#[derive(Debug)]
pub struct FakeTerminal {
    state: Mutex<FakeTerminalState>,
    fail_raw: bool,
}

impl FakeTerminal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeTerminalState {
                size: (100, 30),
                ..FakeTerminalState::default()
            }),
            fail_raw: false,
        }
    }

    /// Make `enable_raw_mode` fail
    pub fn fail_raw_mode(mut self) -> Self {
        self.fail_raw = true;
        self
    }

    pub fn with_size(self, cols: u16, rows: u16) -> Self {
        self.set_size(cols, rows);
        self
    }

    /// Change the reported size, as a user resizing the window would
    pub fn set_size(&self, cols: u16, rows: u16) {
        self.state.lock().unwrap().size = (cols, rows);
    }

    pub fn is_raw(&self) -> bool {
        self.state.lock().unwrap().raw
    }

    /// Number of successful switches into raw mode
    pub fn raw_entries(&self) -> usize {
        self.state.lock().unwrap().raw_entries
    }

    pub fn size_queries(&self) -> usize {
        self.state.lock().unwrap().size_queries
    }
}

impl Default for FakeTerminal {
    fn default() -> Self {
        Self::new()
    }
}

impl Terminal for FakeTerminal {
    fn enable_raw_mode(&self) -> io::Result<()> {
        if self.fail_raw {
            return Err(io::Error::other("raw mode unsupported"));
        }
        let mut state = self.state.lock().unwrap();
        state.raw = true;
        state.raw_entries += 1;
        Ok(())
    }

    fn disable_raw_mode(&self) -> io::Result<()> {
        self.state.lock().unwrap().raw = false;
        Ok(())
    }

    fn size(&self) -> io::Result<(u16, u16)> {
        let mut state = self.state.lock().unwrap();
        state.size_queries += 1;
        Ok(state.size)
    }
}

/// In-memory writer whose clones share one buffer
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock().unwrap()).into_owned()
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A pipe standing in for stdin: (read end for the relay, write end for the test).
///
/// Keep the write end alive for as long as the relay should see an idle,
/// open input.
pub fn idle_input() -> (OwnedFd, OwnedFd) {
    nix::unistd::pipe().expect("failed to create pipe")
}

/// How a stub tool behaves when its matching command runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubBehavior {
    Succeed,
    Fail,
    /// Sleep long enough that only cancellation ends it
    Hang,
}

/// Shell scripts that impersonate tar, ssh and docker.
///
/// Every invocation appends `<tool> <args>` to a shared log. `ssh` dispatches
/// on the remote command (`docker build` / `docker save`).
pub struct StubTools {
    dir: tempfile::TempDir,
    pub archive: StubBehavior,
    pub remote_build: StubBehavior,
    pub remote_save: StubBehavior,
    pub load: StubBehavior,
}

impl StubTools {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create stub dir"),
            archive: StubBehavior::Succeed,
            remote_build: StubBehavior::Succeed,
            remote_save: StubBehavior::Succeed,
            load: StubBehavior::Succeed,
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.path().join("calls.log")
    }

    /// Recorded invocations, one per line
    pub fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.log_path())
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Bytes handed to `docker load`, if it ran
    pub fn loaded_image(&self) -> Option<Vec<u8>> {
        std::fs::read(self.dir.path().join("loaded.tar")).ok()
    }

    /// Working directory the archiver ran in
    pub fn archive_cwd(&self) -> Option<PathBuf> {
        std::fs::read_to_string(self.dir.path().join("tar.cwd"))
            .ok()
            .map(|s| PathBuf::from(s.trim_end()))
    }

    /// Write the scripts and return a toolchain pointing at them
    pub fn install(&self) -> Toolchain {
        let log = self.log_path();
        let log = log.display();

        let dir = self.dir.path().display();
        let tar = format!(
            "#!/bin/sh\necho \"tar $*\" >> '{log}'\npwd > '{dir}/tar.cwd'\n{}",
            archive_behavior(self.archive)
        );
        let ssh = format!(
            "#!/bin/sh\necho \"ssh $*\" >> '{log}'\ncase \"$*\" in\n\
             *'docker build'*) {} ;;\n\
             *'docker save'*) {} ;;\n\
             esac\nexit 0\n",
            behave(self.remote_build),
            save_behavior(self.remote_save),
        );
        let docker = format!(
            "#!/bin/sh\necho \"docker $*\" >> '{log}'\n\
             [ \"$1\" = load ] && cp \"$3\" '{dir}/loaded.tar'\n{}",
            behave(self.load)
        );

        Toolchain {
            archiver: write_script(self.dir.path(), "tar", &tar),
            ssh: write_script(self.dir.path(), "ssh", &ssh),
            engine: write_script(self.dir.path(), "docker", &docker),
        }
    }
}

impl Default for StubTools {
    fn default() -> Self {
        Self::new()
    }
}

fn behave(behavior: StubBehavior) -> &'static str {
    match behavior {
        StubBehavior::Succeed => "exit 0\n",
        StubBehavior::Fail => "echo 'stub failure' >&2; exit 1\n",
        StubBehavior::Hang => "sleep 30; exit 0\n",
    }
}

fn archive_behavior(behavior: StubBehavior) -> &'static str {
    match behavior {
        StubBehavior::Succeed => "printf 'bundle' > \"$2\"; exit 0\n",
        other => behave(other),
    }
}

fn save_behavior(behavior: StubBehavior) -> &'static str {
    match behavior {
        StubBehavior::Succeed => "printf 'image-bytes'; exit 0",
        StubBehavior::Fail => "printf 'partial'; exit 1",
        StubBehavior::Hang => "printf 'partial'; sleep 30; exit 0",
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("failed to write stub script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("failed to chmod stub script");
    path.display().to_string()
}
