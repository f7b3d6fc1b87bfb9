//! Pipeline stages
//!
//! Each stage knows how to build its external command from the run
//! configuration and how to run it. Stages never retry; any failure is
//! returned to the orchestrator.

mod build;
mod import;
mod publish;
mod transfer;

pub use build::*;
pub use import::*;
pub use publish::*;
pub use transfer::*;
