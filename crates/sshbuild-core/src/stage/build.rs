//! Tunnel build: build the image on the remote host from the published bundle

use std::net::SocketAddr;

use crate::{BuildConfig, CancelToken, CommandSpec, Relay, Result, CONTEXT_ARCHIVE};

/// URL the remote engine fetches the bundle from, via the reverse tunnel
pub fn remote_context_url(config: &BuildConfig) -> String {
    format!("http://127.0.0.1:{}/{}", config.remote_port, CONTEXT_ARCHIVE)
}

/// ssh session with a reverse tunnel to `served` that runs the remote build
pub fn tunnel_build_command(config: &BuildConfig, served: SocketAddr) -> CommandSpec {
    CommandSpec::new(&config.tools.ssh)
        .args([
            "-t".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-R".to_string(),
            format!("{}:{}:{}", config.remote_port, served.ip(), served.port()),
            config.host.clone(),
            config.tools.engine.clone(),
            "build".to_string(),
            "-t".to_string(),
            config.tag.clone(),
            remote_context_url(config),
        ])
}

/// Build the tagged image on the remote host
pub async fn tunnel_build(
    relay: &mut Relay,
    config: &BuildConfig,
    served: SocketAddr,
    cancel: &CancelToken,
) -> Result<()> {
    relay
        .run(&tunnel_build_command(config, served), cancel)
        .await?;
    tracing::info!("Built {} on {}", config.tag, config.host);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_build_command() {
        let config = BuildConfig::new("build01", "myapp:test").unwrap();
        let spec = tunnel_build_command(&config, "127.0.0.1:8080".parse().unwrap());

        assert_eq!(
            spec.to_string(),
            "ssh -t -o 'ExitOnForwardFailure=yes' -R 50218:127.0.0.1:8080 build01 \
             docker build -t myapp:test http://127.0.0.1:50218/ctx.tar.gz"
        );
    }

    #[test]
    fn test_tunnel_targets_bound_port() {
        let mut config = BuildConfig::new("user@build02", "app").unwrap();
        config.remote_port = 40000;
        let spec = tunnel_build_command(&config, "127.0.0.1:45123".parse().unwrap());

        assert!(spec.args.contains(&"40000:127.0.0.1:45123".to_string()));
        assert!(spec.args.contains(&"http://127.0.0.1:40000/ctx.tar.gz".to_string()));
        assert!(spec.args.contains(&"user@build02".to_string()));
    }
}
