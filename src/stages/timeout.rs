// src/stages/timeout.rs

use crate::error::GuardError;
use crate::pipeline::{Next, RunContext, Stage, Status};
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::warn;

/// Bounds the run below with a deadline when a timeout is configured, and
/// turns the resulting cancellation into [`GuardError::Timeout`].
pub struct TimeoutGuard;

#[async_trait]
impl Stage for TimeoutGuard {
    fn name(&self) -> &'static str {
        "timeout"
    }

    async fn call(
        &self,
        cx: &RunContext<'_>,
        status: &mut Status,
        next: Next<'_>,
    ) -> Result<(), GuardError> {
        let timeout = cx.request().timeout;
        let child = cx.child(timeout.map(|t| Instant::now() + t));
        let result = next.run(&child, status).await;
        match (result, timeout) {
            (Err(_), Some(timeout)) if child.deadline_passed() => {
                warn!(timeout = ?timeout, "Command exceeded its timeout");
                Err(GuardError::Timeout(timeout))
            }
            (result, _) => result,
        }
    }
}
