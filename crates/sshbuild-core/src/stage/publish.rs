//! Context publishing: bundle the build context, then serve it

use std::path::Path;

use crate::{BuildConfig, CancelToken, CommandSpec, ContentServer, Relay, Result, ScratchDir};

/// Archiver invocation that writes `bundle` from the build context directory
pub fn archive_command(config: &BuildConfig, bundle: &Path) -> CommandSpec {
    CommandSpec::new(&config.tools.archiver)
        .args(["-czf".to_string(), bundle.display().to_string(), ".".to_string()])
        .current_dir(&config.context_dir)
}

/// Archive the build context into the scratch directory
pub async fn package_context(
    relay: &mut Relay,
    config: &BuildConfig,
    scratch: &ScratchDir,
    cancel: &CancelToken,
) -> Result<()> {
    let bundle = scratch.context_archive();
    relay.run(&archive_command(config, &bundle), cancel).await?;
    tracing::info!("Packaged build context into {}", bundle.display());
    Ok(())
}

/// Serve the scratch directory on the configured loopback address.
///
/// The listener is bound when this returns.
pub async fn publish_context(config: &BuildConfig, scratch: &ScratchDir) -> Result<ContentServer> {
    ContentServer::start(scratch.path(), config.serve_addr).await
}
