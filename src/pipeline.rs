// src/pipeline.rs

//! The guarded-execution chain.
//!
//! A [`Pipeline`] is an ordered list of [`Stage`]s around one [`Handler`] (the
//! process runner). Running it calls the first stage with a [`Next`] that
//! continues with the rest of the list, so stage `i` wraps stages `i+1..` and
//! the handler.

use crate::alert::Reporter;
use crate::config::Request;
use crate::error::GuardError;
use crate::sink::{discard, SharedSink};
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Request plus the cancellation state for one run.
#[derive(Clone)]
pub struct RunContext<'a> {
    request: &'a Request,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl<'a> RunContext<'a> {
    pub fn new(request: &'a Request, cancel: CancellationToken) -> Self {
        Self {
            request,
            cancel,
            deadline: None,
        }
    }

    pub fn request(&self) -> &'a Request {
        self.request
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// A child context: cancelling it does not cancel `self`, cancelling
    /// `self` cancels it. The deadline only ever gets earlier.
    pub fn child(&self, deadline: Option<Instant>) -> RunContext<'a> {
        let deadline = match (self.deadline, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        RunContext {
            request: self.request,
            cancel: self.cancel.child_token(),
            deadline,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// In-flight outputs of one run. Stages replace the sinks with wrapped
/// versions before delegating; nothing is restored on the way out.
pub struct Status {
    pub stdout: SharedSink,
    pub stderr: SharedSink,
    pub combined: SharedSink,
    pub exit_code: i32,
    pub reporter: Option<Arc<Reporter>>,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            stdout: discard(),
            stderr: discard(),
            combined: discard(),
            exit_code: 0,
            reporter: None,
        }
    }
}

/// Innermost operation of the chain.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, cx: &RunContext<'_>, status: &mut Status) -> Result<(), GuardError>;
}

/// One layer of the chain. `next` must be called at most once.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn call(
        &self,
        cx: &RunContext<'_>,
        status: &mut Status,
        next: Next<'_>,
    ) -> Result<(), GuardError>;
}

/// The remainder of the chain below a stage.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Box<dyn Stage>],
    handler: &'a dyn Handler,
}

impl<'a> Next<'a> {
    pub fn run<'b>(
        self,
        cx: &'b RunContext<'_>,
        status: &'b mut Status,
    ) -> BoxFuture<'b, Result<(), GuardError>>
    where
        'a: 'b,
    {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                debug!(stage = stage.name(), "Entering stage");
                stage.call(
                    cx,
                    status,
                    Next {
                        stages: rest,
                        handler: self.handler,
                    },
                )
            }
            None => self.handler.call(cx, status),
        }
    }
}

pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    handler: Box<dyn Handler>,
}

impl Pipeline {
    /// `stages` is outermost first.
    pub fn new(stages: Vec<Box<dyn Stage>>, handler: Box<dyn Handler>) -> Self {
        Self { stages, handler }
    }

    /// The production chain, outermost first.
    pub fn standard() -> Self {
        use crate::capture::Capturer;
        use crate::runner::ProcessRunner;
        use crate::stages::{
            AlertStage, Annotator, KeywordValidator, LockGuard, QuietFilter, RunIdPrefixer,
            SinkWriter, StderrValidator, TimeoutGuard,
        };
        Self::new(
            vec![
                Box::new(SinkWriter),
                Box::new(AlertStage),
                Box::new(RunIdPrefixer),
                Box::new(Annotator),
                Box::new(LockGuard),
                Box::new(QuietFilter),
                Box::new(StderrValidator),
                Box::new(KeywordValidator),
                Box::new(TimeoutGuard),
                Box::new(Capturer),
            ],
            Box::new(ProcessRunner),
        )
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub async fn run(&self, cx: &RunContext<'_>, status: &mut Status) -> Result<(), GuardError> {
        let next = Next {
            stages: &self.stages,
            handler: self.handler.as_ref(),
        };
        next.run(cx, status).await
    }
}
