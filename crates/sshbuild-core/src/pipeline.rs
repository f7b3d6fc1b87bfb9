//! Pipeline orchestration
//!
//! Sequences the stages strictly one after another:
//!
//! ```text
//! Init -> ContextPublished -> Serving -> Built -> Transferred -> Imported -> Done
//!   \___________________________ any failure ___________________________/-> Aborted
//! ```
//!
//! The scratch directory is created before the first stage and removed on every
//! exit path. The content server runs from `Serving` until the pipeline
//! returns; if it dies on its own, the command of the stage in flight is
//! terminated and the run aborts.

use std::fmt;
use std::future::Future;

use thiserror::Error;

use crate::stage::{import_image, package_context, publish_context, transfer_image, tunnel_build};
use crate::{
    BuildConfig, CancelSource, CancelToken, ContentServer, CoreError, Relay, Result, ScratchDir,
};

/// Process exit status for a failed run
pub const EXIT_FAILURE: i32 = 1;
/// Process exit status for bad flags
pub const EXIT_USAGE: i32 = 2;
/// Process exit status for a run aborted by SIGINT/SIGTERM
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    ContextPublished,
    Serving,
    Built,
    Transferred,
    Imported,
    Done,
    Aborted,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Init => "init",
            PipelineState::ContextPublished => "context-published",
            PipelineState::Serving => "serving",
            PipelineState::Built => "built",
            PipelineState::Transferred => "transferred",
            PipelineState::Imported => "imported",
            PipelineState::Done => "done",
            PipelineState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// A run that ended in `Aborted`
#[derive(Error, Debug)]
#[error("remote build aborted after reaching {reached}: {source}")]
pub struct PipelineError {
    /// Last state entered before the failure
    pub reached: PipelineState,
    #[source]
    pub source: CoreError,
}

impl PipelineError {
    pub fn exit_code(&self) -> i32 {
        match self.source {
            CoreError::Cancelled => EXIT_INTERRUPTED,
            ref e if e.is_usage() => EXIT_USAGE,
            _ => EXIT_FAILURE,
        }
    }
}

/// One remote build run
pub struct Pipeline<'a> {
    config: &'a BuildConfig,
    relay: Relay,
    cancel: CancelToken,
    state: PipelineState,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a BuildConfig, relay: Relay, cancel: CancelToken) -> Self {
        Self {
            config,
            relay,
            cancel,
            state: PipelineState::Init,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Run every stage, removing the scratch directory before returning
    pub async fn run(&mut self) -> std::result::Result<(), PipelineError> {
        if let Err(e) = self.config.validate() {
            return Err(self.abort(e));
        }
        tracing::info!(
            "Building {} on {} from {}",
            self.config.tag,
            self.config.host,
            self.config.context_dir.display()
        );

        let scratch = match ScratchDir::create_in(&self.config.scratch_root) {
            Ok(scratch) => scratch,
            Err(e) => return Err(self.abort(e)),
        };

        let result = self.run_stages(&scratch).await;
        scratch.close();

        match result {
            Ok(()) => {
                self.advance(PipelineState::Done);
                Ok(())
            }
            Err(e) => Err(self.abort(e)),
        }
    }

    async fn run_stages(&mut self, scratch: &ScratchDir) -> Result<()> {
        self.check_cancelled()?;
        package_context(&mut self.relay, self.config, scratch, &self.cancel).await?;
        self.advance(PipelineState::ContextPublished);

        self.check_cancelled()?;
        let mut server = publish_context(self.config, scratch).await?;
        self.advance(PipelineState::Serving);

        let result = self.run_served_stages(&mut server, scratch).await;
        server.shutdown().await;
        result
    }

    async fn run_served_stages(
        &mut self,
        server: &mut ContentServer,
        scratch: &ScratchDir,
    ) -> Result<()> {
        let served = server.addr();

        self.check_cancelled()?;
        let (abort, token) = CancelSource::new();
        guarded(
            server.failed(),
            &self.cancel,
            &abort,
            tunnel_build(&mut self.relay, self.config, served, &token),
        )
        .await?;
        self.advance(PipelineState::Built);

        self.check_cancelled()?;
        let image = scratch.image_archive();
        let (abort, token) = CancelSource::new();
        guarded(
            server.failed(),
            &self.cancel,
            &abort,
            transfer_image(self.relay.console(), self.config, &image, &token),
        )
        .await?;
        self.advance(PipelineState::Transferred);

        self.check_cancelled()?;
        let (abort, token) = CancelSource::new();
        guarded(
            server.failed(),
            &self.cancel,
            &abort,
            import_image(&mut self.relay, self.config, &image, &token),
        )
        .await?;
        self.advance(PipelineState::Imported);

        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn advance(&mut self, next: PipelineState) {
        tracing::info!("Pipeline: {} -> {}", self.state, next);
        self.state = next;
    }

    fn abort(&mut self, source: CoreError) -> PipelineError {
        let reached = self.state;
        tracing::error!("{}", source);
        self.advance(PipelineState::Aborted);
        PipelineError { reached, source }
    }
}

/// Run a stage, failing it if `failure` resolves first.
///
/// The stage watches `abort`'s token. On interrupt or failure it is tripped
/// and the stage is awaited, so its command is terminated and reaped rather
/// than dropped.
async fn guarded<S, X>(
    failure: X,
    cancel: &CancelToken,
    abort: &CancelSource,
    stage: S,
) -> Result<()>
where
    S: Future<Output = Result<()>>,
    X: Future<Output = CoreError>,
{
    tokio::pin!(stage);
    let failed = tokio::select! {
        res = &mut stage => return res,
        _ = cancel.cancelled() => None,
        err = failure => Some(err),
    };

    abort.cancel();
    let res = stage.await;
    match failed {
        None => res,
        Some(err) => {
            if let Err(e) = res {
                tracing::debug!("Stage stopped after failure: {}", e);
            }
            Err(err)
        }
    }
}
