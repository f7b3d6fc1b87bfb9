//! Image import: load the transferred archive into the local engine

use std::path::Path;

use crate::{BuildConfig, CancelToken, CommandSpec, Relay, Result};

pub fn load_command(config: &BuildConfig, image: &Path) -> CommandSpec {
    CommandSpec::new(&config.tools.engine).args([
        "load".to_string(),
        "-i".to_string(),
        image.display().to_string(),
    ])
}

/// Load `image` into the local image store
pub async fn import_image(
    relay: &mut Relay,
    config: &BuildConfig,
    image: &Path,
    cancel: &CancelToken,
) -> Result<()> {
    relay.run(&load_command(config, image), cancel).await?;
    tracing::info!("Loaded {} into the local image store", config.tag);
    Ok(())
}
