// src/stages/alert.rs

use crate::alert::Reporter;
use crate::error::GuardError;
use crate::pipeline::{Next, RunContext, Stage, Status};
use crate::sink::write_str;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Escalates a failed run to the alert endpoint. A confirmed delivery counts
/// as handling the failure, so the error stops here and nothing is appended
/// to the error log. An endpoint that cannot be set up is noted in the
/// combined log and the run goes ahead without alerting.
pub struct AlertStage;

#[async_trait]
impl Stage for AlertStage {
    fn name(&self) -> &'static str {
        "alert"
    }

    async fn call(
        &self,
        cx: &RunContext<'_>,
        status: &mut Status,
        next: Next<'_>,
    ) -> Result<(), GuardError> {
        let request = cx.request();
        let Some(config) = &request.alert else {
            return next.run(cx, status).await;
        };

        let reporter = match Reporter::new(request, config) {
            Ok(reporter) => Arc::new(reporter),
            Err(e) => {
                warn!(error = %e, "Alerting disabled for this run");
                let notice = format!(
                    "cron-guard: unable to reach alert endpoint: {e}\ncron-guard: running cron anyways\n"
                );
                if let Err(e) = write_str(status.combined.as_ref(), &notice) {
                    warn!(error = %e, "Unable to write alert notice");
                }
                return next.run(cx, status).await;
            }
        };
        reporter.attach(status);
        status.reporter = Some(reporter.clone());

        let result = next.run(cx, status).await;
        if let Err(e) = &result {
            if reporter.finish(e).await {
                info!(error = %e, "Failure delivered to alert endpoint");
                return Ok(());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::testing::{closed_addr, spawn_store};
    use crate::config::{AlertConfig, Request};
    use crate::pipeline::testing::{run_stage, MockRunner};
    use std::time::Duration;

    fn with_alert(dsn: String) -> Request {
        Request::builder("false")
            .alert(Some(AlertConfig {
                dsn,
                flush_timeout: Duration::from_secs(2),
            }))
            .build()
            .unwrap()
    }

    fn keyed(base: &str, project: u32) -> String {
        format!("{}/{project}", base.replace("http://", "http://key@"))
    }

    #[tokio::test]
    async fn delivered_failure_is_handled() {
        let (base, received) = spawn_store().await;
        let request = with_alert(keyed(&base, 1));
        let (result, status, captured) = run_stage(
            &request,
            Box::new(AlertStage),
            MockRunner::ok("partial\n")
                .with_stderr("boom\n")
                .failing(1, || GuardError::Exit { code: 1 }),
        )
        .await;
        result.unwrap();
        assert!(status.reporter.is_some());
        let events = received.events();
        assert_eq!(events.len(), 1);
        let body = &events[0].1;
        assert_eq!(body["extra"]["out_stderr"], "boom\n");
        // local capture is unaffected
        assert_eq!(captured.stdout.text(), "partial\n");
        assert_eq!(captured.stderr.text(), "boom\n");
    }

    #[tokio::test]
    async fn success_sends_nothing() {
        let (base, received) = spawn_store().await;
        let request = with_alert(keyed(&base, 1));
        let (result, _, _) =
            run_stage(&request, Box::new(AlertStage), MockRunner::ok("fine\n")).await;
        result.unwrap();
        assert!(received.events().is_empty());
    }

    #[tokio::test]
    async fn undelivered_failure_propagates() {
        let (base, _) = spawn_store().await;
        let request = with_alert(keyed(&base, 2));
        let (result, _, _) = run_stage(
            &request,
            Box::new(AlertStage),
            MockRunner::ok("").failing(3, || GuardError::Exit { code: 3 }),
        )
        .await;
        assert!(matches!(result, Err(GuardError::Exit { code: 3 })));

        let request = with_alert(keyed(&closed_addr().await, 1));
        let (result, _, _) = run_stage(
            &request,
            Box::new(AlertStage),
            MockRunner::ok("").failing(3, || GuardError::Exit { code: 3 }),
        )
        .await;
        assert!(matches!(result, Err(GuardError::Exit { code: 3 })));
    }

    #[tokio::test]
    async fn bad_endpoint_runs_anyway() {
        let request = with_alert("definitely not a dsn".to_string());
        let (result, status, captured) = run_stage(
            &request,
            Box::new(AlertStage),
            MockRunner::ok("ran\n").failing(1, || GuardError::Exit { code: 1 }),
        )
        .await;
        assert!(matches!(result, Err(GuardError::Exit { code: 1 })));
        assert!(status.reporter.is_none());
        let text = captured.combined.text();
        assert!(text.starts_with("cron-guard: unable to reach alert endpoint: "), "{text}");
        assert!(text.contains("cron-guard: running cron anyways\nran\n"), "{text}");
    }

    #[tokio::test]
    async fn no_endpoint_passes_through() {
        let request = Request::builder("false").build().unwrap();
        let (result, status, _) = run_stage(
            &request,
            Box::new(AlertStage),
            MockRunner::ok("").failing(1, || GuardError::Exit { code: 1 }),
        )
        .await;
        assert!(result.is_err());
        assert!(status.reporter.is_none());
    }
}
