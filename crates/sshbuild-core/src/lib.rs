//! Core logic for sshbuild
//!
//! This crate provides:
//! - A process relay running commands on a pseudo-terminal bridged to the
//!   user's terminal (raw mode, resize forwarding, cancellation)
//! - Context publishing: archiving the build context and serving it locally
//! - The remote build, image transfer and image import stages
//! - The pipeline orchestrator tying the stages together

mod cancel;
mod command;
mod config;
mod console;
mod error;
mod pipeline;
mod process;
mod relay;
mod scratch;
mod server;
pub mod stage;
mod terminal;

pub use cancel::*;
pub use command::*;
pub use config::*;
pub use console::*;
pub use error::*;
pub use pipeline::*;
pub use relay::*;
pub use scratch::*;
pub use server::*;
pub use terminal::*;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
