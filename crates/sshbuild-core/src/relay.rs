//! Process relay
//!
//! Runs an external command on a host-side pseudo-terminal so it behaves as if
//! it were attached to the user's own terminal: live output, keystrokes
//! (including Ctrl+C) delivered to the command, and window resizes propagated.
//!
//! Per call the relay owns:
//! - the PTY master and the child process
//! - raw mode on the invoking terminal (restored on every exit path)
//! - a SIGWINCH subscription, torn down when the call returns
//! - an input pump thread, told to stop when the call returns
//!
//! The call completes when the output side of the PTY reaches end-of-stream,
//! i.e. the command and everything it spawned on the terminal have exited.

use std::fs::File;
use std::io::{self, IsTerminal, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, OwnedFd};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::libc;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::pty::{openpty, Winsize};
use tokio::process::Child;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

use crate::process::{terminate, KillScope};
use crate::terminal::RawModeGuard;
use crate::{CancelToken, CommandSpec, Console, CoreError, HostTerminal, Result, Terminal};

/// How long to wait for the PTY to drain after a cancelled command is reaped
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Input poll interval; bounds how long the input pump outlives its relay
const INPUT_POLL_MS: u16 = 100;

const FALLBACK_SIZE: (u16, u16) = (80, 24);

/// Runs commands attached to a pseudo-terminal bridged to the user's terminal.
///
/// Only one relayed command can be active at a time: [`Relay::run`] takes
/// `&mut self` because raw mode on the invoking terminal is a singleton.
pub struct Relay {
    terminal: Arc<dyn Terminal>,
    input: OwnedFd,
    output: Console,
}

impl Relay {
    pub fn new(terminal: Arc<dyn Terminal>, input: OwnedFd, output: Console) -> Self {
        Self {
            terminal,
            input,
            output,
        }
    }

    /// Relay bridged to this process's stdin/stdout.
    ///
    /// Fails with [`CoreError::NotATerminal`] if stdin is not interactive.
    pub fn host(output: Console) -> Result<Self> {
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            return Err(CoreError::NotATerminal);
        }
        let input = stdin.as_fd().try_clone_to_owned()?;
        Ok(Self::new(Arc::new(HostTerminal), input, output))
    }

    pub fn console(&self) -> &Console {
        &self.output
    }

    /// Echo and run `spec` on a fresh PTY, blocking until its output ends.
    ///
    /// Returns `Ok` only if the command exited successfully.
    pub async fn run(&mut self, spec: &CommandSpec, cancel: &CancelToken) -> Result<()> {
        let command = spec.to_string();
        self.output.echo(&command);

        let (cols, rows) = self.terminal.size().unwrap_or(FALLBACK_SIZE);
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = openpty(Some(&winsize), None)
            .map_err(|e| CoreError::PtyAllocation(e.to_string()))?;
        let master = File::from(pty.master);

        let mut child = spawn_on_pty(spec, pty.slave)?;
        tracing::debug!("Started `{}` (pid {:?})", command, child.id());

        let raw = match RawModeGuard::enter(self.terminal.as_ref()) {
            Ok(guard) => guard,
            Err(e) => {
                terminate(&mut child, KillScope::ProcessGroup).await;
                return Err(CoreError::TerminalState(e));
            }
        };

        let bridge = Bridge::start(self, &master)?;
        let mut output_task = {
            let out = self.output.clone();
            tokio::task::spawn_blocking(move || forward_output(master, out))
        };

        let drained = tokio::select! {
            res = &mut output_task => Some(res),
            _ = cancel.cancelled() => None,
        };
        let was_drained = drained.is_some();

        let status = if was_drained {
            tokio::select! {
                status = child.wait() => Some(status),
                _ = cancel.cancelled() => None,
            }
        } else {
            None
        };

        // Back to the user's terminal mode before anything else is logged.
        drop(bridge);
        drop(raw);

        if let Some(res) = drained {
            log_output_result(&command, res);
        }

        let Some(status) = status else {
            tracing::warn!("Cancelling `{}`", command);
            terminate(&mut child, KillScope::ProcessGroup).await;
            if !was_drained {
                match tokio::time::timeout(DRAIN_TIMEOUT, &mut output_task).await {
                    Ok(res) => log_output_result(&command, res),
                    Err(_) => tracing::warn!("Terminal of `{}` still open after exit", command),
                }
            }
            return Err(CoreError::Cancelled);
        };
        let status = status?;

        tracing::debug!("`{}` exited with {}", command, status);
        if status.success() {
            Ok(())
        } else {
            Err(CoreError::CommandFailed { command, status })
        }
    }
}

/// Input pump and resize forwarding for one relay call.
///
/// Dropping it stops both.
struct Bridge {
    stop_input: Arc<AtomicBool>,
    resize: Option<JoinHandle<()>>,
}

impl Bridge {
    fn start(relay: &Relay, master: &File) -> io::Result<Self> {
        let stop_input = Arc::new(AtomicBool::new(false));
        {
            let input = relay.input.try_clone()?;
            let pty = master.try_clone()?;
            let stop = stop_input.clone();
            // Detached: the pump notices `stop` within one poll interval.
            std::thread::spawn(move || forward_input(input, pty, stop));
        }

        let resize = start_resize_forwarding(relay.terminal.clone(), master.try_clone()?);

        Ok(Self { stop_input, resize })
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.stop_input.store(true, Ordering::SeqCst);
        if let Some(task) = self.resize.take() {
            task.abort();
        }
    }
}

/// Spawn `spec` with the PTY slave as stdio and controlling terminal
fn spawn_on_pty(spec: &CommandSpec, slave: OwnedFd) -> Result<Child> {
    let spawn_err = |source: io::Error| CoreError::Spawn {
        command: spec.to_string(),
        source,
    };

    // The command owns every slave fd; dropping it before the child exits
    // leaves the child as the only holder, so output hits EOF when it's done.
    let mut cmd = spec.to_command();
    cmd.stdin(Stdio::from(slave.try_clone().map_err(spawn_err)?));
    cmd.stdout(Stdio::from(slave.try_clone().map_err(spawn_err)?));
    cmd.stderr(Stdio::from(slave));
    // SAFETY: only async-signal-safe calls (setsid, ioctl) run between fork and exec
    unsafe {
        cmd.pre_exec(attach_controlling_terminal);
    }
    cmd.spawn().map_err(spawn_err)
}

/// Start a new session with the PTY slave (already on fd 0) as its terminal,
/// so keystrokes like Ctrl+C turn into signals for the child.
fn attach_controlling_terminal() -> io::Result<()> {
    nix::unistd::setsid()?;
    if unsafe { libc::ioctl(0, libc::TIOCSCTTY as _, 0) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Subscribe to SIGWINCH and mirror the terminal size onto the PTY.
///
/// Applies the size once up front. Returns `None` if the subscription could
/// not be set up; resizing is best-effort.
fn start_resize_forwarding(terminal: Arc<dyn Terminal>, pty: File) -> Option<JoinHandle<()>> {
    let winch = signal(SignalKind::window_change());
    apply_window_size(terminal.as_ref(), &pty);

    let mut winch = match winch {
        Ok(winch) => winch,
        Err(e) => {
            tracing::warn!("Terminal resize forwarding unavailable: {}", e);
            return None;
        }
    };

    Some(tokio::spawn(async move {
        while winch.recv().await.is_some() {
            apply_window_size(terminal.as_ref(), &pty);
        }
    }))
}

fn apply_window_size(terminal: &dyn Terminal, pty: &File) {
    let (cols, rows) = match terminal.size() {
        Ok(size) => size,
        Err(e) => {
            tracing::warn!("Failed to read terminal size: {}", e);
            return;
        }
    };
    let ws = libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: pty is an open PTY master and ws outlives the call
    if unsafe { libc::ioctl(pty.as_raw_fd(), libc::TIOCSWINSZ, &ws) } == -1 {
        tracing::warn!("Failed to resize pty: {}", io::Error::last_os_error());
    }
}

/// Copy user input into the PTY until `stop` is set or input closes
fn forward_input(input: OwnedFd, mut pty: File, stop: Arc<AtomicBool>) {
    let mut buf = [0u8; 4096];

    while !stop.load(Ordering::SeqCst) {
        let mut fds = [PollFd::new(input.as_fd(), PollFlags::POLLIN)];
        match nix::poll::poll(&mut fds, PollTimeout::from(INPUT_POLL_MS)) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Err(e) => {
                tracing::debug!("Input poll failed: {}", e);
                return;
            }
            Ok(_) => {}
        }

        // A keystroke arriving after the relay finished belongs to whoever
        // reads the terminal next.
        if stop.load(Ordering::SeqCst) {
            return;
        }

        match nix::unistd::read(input.as_raw_fd(), &mut buf) {
            Ok(0) => return,
            Ok(n) => {
                if let Err(e) = pty.write_all(&buf[..n]) {
                    tracing::debug!("Input forwarding stopped: {}", e);
                    return;
                }
            }
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(e) => {
                tracing::debug!("Input read failed: {}", e);
                return;
            }
        }
    }
}

/// Bytes read from the PTY, and the first console write error if any
struct OutputSummary {
    bytes: u64,
    write_error: Option<io::Error>,
}

/// Copy PTY output to the console until end-of-stream.
///
/// After a console write failure the PTY keeps being drained so the command
/// never blocks on a full terminal buffer. Nothing is logged here: this runs
/// while the terminal is raw.
fn forward_output(mut pty: File, mut out: Console) -> io::Result<OutputSummary> {
    let mut buf = [0u8; 8192];
    let mut summary = OutputSummary {
        bytes: 0,
        write_error: None,
    };

    loop {
        let n = match pty.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // Linux reports EIO on the master once every slave fd is closed
            Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
            Err(e) => return Err(e),
        };
        summary.bytes += n as u64;

        if summary.write_error.is_some() {
            continue;
        }
        if let Err(e) = out.write_all(&buf[..n]).and_then(|_| out.flush()) {
            summary.write_error = Some(e);
        }
    }

    Ok(summary)
}

fn log_output_result(
    command: &str,
    res: std::result::Result<io::Result<OutputSummary>, tokio::task::JoinError>,
) {
    match res {
        Ok(Ok(summary)) => {
            if let Some(e) = summary.write_error {
                tracing::warn!("Failed to write output of `{}`: {}", command, e);
            }
            tracing::debug!("`{}` produced {} bytes of output", command, summary.bytes);
        }
        Ok(Err(e)) => tracing::warn!("Output relay for `{}` failed: {}", command, e),
        Err(e) => tracing::warn!("Output relay for `{}` panicked: {}", command, e),
    }
}
