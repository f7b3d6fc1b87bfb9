//! Image transfer: stream `docker save` output from the remote host to disk
//!
//! Runs without the relay. The output is binary, so stdout goes straight to
//! the image file while stderr stays on the user's terminal.

use std::fs::File;
use std::path::Path;
use std::process::Stdio;

use crate::process::{terminate, KillScope};
use crate::{BuildConfig, CancelToken, CommandSpec, Console, CoreError, Result};

/// ssh session that writes the saved image to its stdout
pub fn save_command(config: &BuildConfig) -> CommandSpec {
    CommandSpec::new(&config.tools.ssh).args([
        config.host.clone(),
        config.tools.engine.clone(),
        "save".to_string(),
        config.tag.clone(),
    ])
}

/// Save the remote image into `dest`.
///
/// `dest` exists and is synced to disk only if this returns `Ok`; on any
/// failure the partial file is removed.
pub async fn transfer_image(
    console: &Console,
    config: &BuildConfig,
    dest: &Path,
    cancel: &CancelToken,
) -> Result<()> {
    let spec = save_command(config);
    let command = spec.to_string();
    console.echo(&format!("{} > {}", command, dest.display()));

    let file = File::create(dest)?;
    let result = save_into(&spec, &command, &file, cancel).await;

    drop(file);
    if result.is_err() {
        if let Err(e) = std::fs::remove_file(dest) {
            tracing::warn!("Failed to remove partial image {}: {}", dest.display(), e);
        }
    } else {
        tracing::info!("Saved {} to {}", config.tag, dest.display());
    }
    result
}

async fn save_into(
    spec: &CommandSpec,
    command: &str,
    file: &File,
    cancel: &CancelToken,
) -> Result<()> {
    let mut cmd = spec.to_command();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(file.try_clone()?))
        // Stays in the foreground process group: ssh may prompt on /dev/tty
        // for a password, passphrase or host key.
        .stderr(Stdio::inherit());
    let mut child = cmd.spawn().map_err(|source| CoreError::Spawn {
        command: command.to_string(),
        source,
    })?;
    drop(cmd);

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            tracing::warn!("Cancelling `{}`", command);
            terminate(&mut child, KillScope::Process).await;
            return Err(CoreError::Cancelled);
        }
    };

    if !status.success() {
        return Err(CoreError::CommandFailed {
            command: command.to_string(),
            status,
        });
    }
    file.sync_all()?;
    Ok(())
}
