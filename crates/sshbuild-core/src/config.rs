//! Run configuration, built once from flags and passed down by reference

use crate::{CoreError, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Loopback address the content server listens on
pub const DEFAULT_SERVE_ADDR: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(Ipv4Addr::LOCALHOST),
    8080,
);

/// Port opened on the build host by the reverse tunnel
pub const DEFAULT_REMOTE_PORT: u16 = 50218;

/// External programs the pipeline drives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    /// Archiver used to bundle the build context (tar-compatible flags)
    pub archiver: String,
    /// Secure shell client
    pub ssh: String,
    /// Container engine, both locally and on the build host
    pub engine: String,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            archiver: "tar".to_string(),
            ssh: "ssh".to_string(),
            engine: "docker".to_string(),
        }
    }
}

/// Everything one remote build run needs to know
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Build host, passed verbatim to the ssh client
    pub host: String,
    /// Image tag used for build, save and load
    pub tag: String,
    /// Directory packaged as the build context
    pub context_dir: PathBuf,
    /// Parent of the per-run scratch directory
    pub scratch_root: PathBuf,
    pub serve_addr: SocketAddr,
    pub remote_port: u16,
    pub tools: Toolchain,
}

impl BuildConfig {
    /// Config with defaults for everything but host and tag
    pub fn new(host: impl Into<String>, tag: impl Into<String>) -> Result<Self> {
        let context_dir = std::env::current_dir()?;
        Ok(Self {
            host: host.into(),
            tag: tag.into(),
            context_dir,
            scratch_root: std::env::temp_dir(),
            serve_addr: DEFAULT_SERVE_ADDR,
            remote_port: DEFAULT_REMOTE_PORT,
            tools: Toolchain::default(),
        })
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(CoreError::InvalidConfig("host must not be empty".into()));
        }
        if self.tag.trim().is_empty() {
            return Err(CoreError::InvalidConfig("tag must not be empty".into()));
        }
        if !self.serve_addr.ip().is_loopback() {
            return Err(CoreError::InvalidConfig(format!(
                "content server address {} is not a loopback address",
                self.serve_addr
            )));
        }
        if self.remote_port == 0 {
            return Err(CoreError::InvalidConfig(
                "remote tunnel port must not be 0".into(),
            ));
        }
        if !self.context_dir.is_dir() {
            return Err(CoreError::InvalidConfig(format!(
                "build context {} is not a directory",
                self.context_dir.display()
            )));
        }
        Ok(())
    }
}
