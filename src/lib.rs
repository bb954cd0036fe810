// src/lib.rs

//! Guarded execution of a single cron command.
//!
//! [`run_guarded`] runs the command through the standard [`Pipeline`]: output
//! is captured and relayed to syslog while it happens, the run is judged by
//! exit code, stderr and an error-keyword pattern, and a failure is recorded
//! exactly once, either at the alert endpoint or in the local error log.

pub mod alert;
pub mod capture;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod quiet;
pub mod realtime;
pub mod runner;
pub mod sink;
pub mod stages;

pub use config::{AlertConfig, FileConfig, Request, RequestBuilder};
pub use error::GuardError;
pub use pipeline::{Handler, Next, Pipeline, RunContext, Stage, Status};
pub use sink::{SharedSink, Sink};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Runs `request` once through the standard chain.
///
/// Returns `Ok` when the run succeeded and also when a failure was handled:
/// suppressed by a quiet window, delivered to the alert endpoint, or written
/// to the error log. An `Err` means the guard itself could not do its job and
/// should exit nonzero (see [`GuardError::exit_code`]).
///
/// Cancelling `cancel` kills the command's process group and ends the run with
/// [`GuardError::Cancelled`], which is recorded like any other failure.
#[instrument(skip_all, fields(name = %request.name, run_id = %request.run_id))]
pub async fn run_guarded(request: &Request, cancel: CancellationToken) -> Result<(), GuardError> {
    let pipeline = Pipeline::standard();
    debug!(stages = ?pipeline.stage_names(), command = %request.command, "Starting guarded run");
    let mut status = Status::default();
    let cx = RunContext::new(request, cancel);
    let result = pipeline.run(&cx, &mut status).await;
    info!(
        exit_code = status.exit_code,
        handled = result.is_ok(),
        "Guarded run finished"
    );
    result
}
