//! sshbuild - build a container image on a remote host over ssh
//!
//! Packages the current directory, lets the build host fetch it through a
//! reverse tunnel, builds there, then streams the image back and loads it
//! into the local engine.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::builder::NonEmptyStringValueParser;
use clap::Parser;
use sshbuild_core::{
    cancel_on_signals, BuildConfig, CancelSource, Console, CoreError, Pipeline, Relay, Toolchain,
    DEFAULT_REMOTE_PORT, DEFAULT_SERVE_ADDR, EXIT_FAILURE, EXIT_USAGE,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "sshbuild")]
#[command(author, version, about = "Build a container image on a remote host over ssh", long_about = None)]
pub struct Cli {
    /// Build host (anything the ssh client accepts)
    #[arg(long, value_parser = NonEmptyStringValueParser::new())]
    pub host: String,

    /// Image tag to build and load
    #[arg(long, value_parser = NonEmptyStringValueParser::new())]
    pub tag: String,

    /// Build context directory (defaults to the current directory)
    #[arg(long)]
    pub context: Option<PathBuf>,

    /// Parent directory for the scratch directory
    #[arg(long)]
    pub scratch_root: Option<PathBuf>,

    /// Loopback address for the build context server
    #[arg(long, default_value_t = DEFAULT_SERVE_ADDR)]
    pub serve_addr: SocketAddr,

    /// Port opened on the build host by the reverse tunnel
    #[arg(long, default_value_t = DEFAULT_REMOTE_PORT)]
    pub remote_port: u16,

    /// Archiver program
    #[arg(long, default_value = "tar")]
    pub tar: String,

    /// ssh client program
    #[arg(long, default_value = "ssh")]
    pub ssh: String,

    /// Container engine program, local and remote
    #[arg(long, default_value = "docker")]
    pub engine: String,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Turn parsed flags into a run configuration
    pub fn into_config(self) -> Result<BuildConfig, CoreError> {
        let mut config = BuildConfig::new(self.host, self.tag)?;
        if let Some(context) = self.context {
            config.context_dir = context;
        }
        if let Some(root) = self.scratch_root {
            config.scratch_root = root;
        }
        config.serve_addr = self.serve_addr;
        config.remote_port = self.remote_port;
        config.tools = Toolchain {
            archiver: self.tar,
            ssh: self.ssh,
            engine: self.engine,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Initialize logging to stderr; stdout is reserved for relayed output
pub fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

/// Run the pipeline and return the process exit status
pub async fn run(cli: Cli) -> i32 {
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            return if e.is_usage() { EXIT_USAGE } else { EXIT_FAILURE };
        }
    };

    match execute(&config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            EXIT_FAILURE
        }
    }
}

async fn execute(config: &BuildConfig) -> anyhow::Result<i32> {
    let relay = Relay::host(Console::stdout()).context("sshbuild needs an interactive terminal")?;

    let (source, token) = CancelSource::new();
    let signals = cancel_on_signals(source).context("failed to install signal handlers")?;

    let mut pipeline = Pipeline::new(config, relay, token);
    let code = match pipeline.run().await {
        Ok(()) => {
            tracing::info!("{} is ready locally", config.tag);
            0
        }
        Err(e) => e.exit_code(),
    };

    signals.abort();
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_required_flags() {
        let cli = Cli::try_parse_from(["sshbuild", "--host", "build01", "--tag", "myapp:test"]).unwrap();
        assert_eq!(cli.host, "build01");
        assert_eq!(cli.tag, "myapp:test");
        assert_eq!(cli.serve_addr, DEFAULT_SERVE_ADDR);
        assert_eq!(cli.remote_port, DEFAULT_REMOTE_PORT);
        assert!(!cli.verbose);
    }

    #[test]
    fn test_missing_flags_rejected() {
        assert!(Cli::try_parse_from(["sshbuild", "--host", "build01"]).is_err());
        assert!(Cli::try_parse_from(["sshbuild", "--tag", "myapp:test"]).is_err());
    }

    #[test]
    fn test_empty_host_rejected() {
        let err = Cli::try_parse_from(["sshbuild", "--host", "", "--tag", "myapp:test"]).unwrap_err();
        assert_eq!(err.exit_code(), EXIT_USAGE);
    }

    #[test]
    fn test_into_config_overrides() {
        let context = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "sshbuild",
            "--host",
            "build01",
            "--tag",
            "myapp:test",
            "--context",
            context.path().to_str().unwrap(),
            "--remote-port",
            "40000",
            "--serve-addr",
            "127.0.0.1:9000",
            "--engine",
            "podman",
        ])
        .unwrap();

        let config = cli.into_config().unwrap();
        assert_eq!(config.context_dir, context.path());
        assert_eq!(config.remote_port, 40000);
        assert_eq!(config.serve_addr.port(), 9000);
        assert_eq!(config.tools.engine, "podman");
        assert_eq!(config.tools.ssh, "ssh");
    }

    #[test]
    fn test_non_loopback_serve_addr_is_usage_error() {
        let cli = Cli::try_parse_from([
            "sshbuild",
            "--host",
            "build01",
            "--tag",
            "myapp:test",
            "--serve-addr",
            "0.0.0.0:8080",
        ])
        .unwrap();
        assert!(cli.into_config().unwrap_err().is_usage());
    }
}
