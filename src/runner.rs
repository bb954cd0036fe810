// src/runner.rs

use crate::capture::drain;
use crate::error::GuardError;
use crate::pipeline::{Handler, RunContext, Status};
use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command as StdCommand, ExitStatus, Stdio};
use tokio::process::{Child, Command as TokioCommand};
use tokio::task::JoinSet;
use tokio::time::sleep_until;
use tracing::{debug, instrument, warn};

/// Runs the request's command through `<shell> -c`, with stdout and stderr
/// drained into whatever sinks are installed on [`Status`].
pub struct ProcessRunner;

#[async_trait]
impl Handler for ProcessRunner {
    async fn call(&self, cx: &RunContext<'_>, status: &mut Status) -> Result<(), GuardError> {
        run_process(cx, status).await
    }
}

/// Why the wait loop stopped.
enum Waited {
    Exited(ExitStatus),
    Interrupted(&'static str),
}

/// Builds `<shell> -c <command>` in its own process group, so a kill reaches
/// every process the command started.
fn build_command(shell: &str, command: &str) -> StdCommand {
    let mut cmd = StdCommand::new(shell);
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    unsafe {
        cmd.pre_exec(|| {
            // setpgid(0, 0) makes the child the leader of a new group.
            if libc::setpgid(0, 0) == 0 {
                Ok(())
            } else {
                Err(std::io::Error::last_os_error())
            }
        });
    }
    cmd
}

/// Sends SIGKILL to the process group led by `pgid`.
///
/// Returns `Ok(false)` if the group no longer exists. The group id stays
/// valid after the leader is reaped, as long as any member is alive.
fn kill_group(pgid: u32, reason: &'static str) -> Result<bool, GuardError> {
    warn!(pid = pgid, reason, "Killing process group");
    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) => {
            debug!(pid = pgid, "Process group kill signal (SIGKILL) sent");
            Ok(true)
        }
        Err(nix::errno::Errno::ESRCH) => {
            debug!(pid = pgid, "Process group already gone");
            Ok(false)
        }
        Err(e) => {
            warn!(pid = pgid, error = %e, "Failed to send kill signal to process group");
            Err(GuardError::Kill(format!("process group {pgid}: {e}")))
        }
    }
}

/// Kills the child's group while the child is still unreaped.
///
/// Returns `Ok(Some(status))` if the child turned out to have exited already.
fn kill_process_group(
    child: &mut Child,
    reason: &'static str,
) -> Result<Option<ExitStatus>, GuardError> {
    let Some(pid) = child.id() else {
        warn!("No PID to kill, process might have exited abnormally");
        return Ok(None);
    };
    if kill_group(pid, reason)? {
        Ok(None)
    } else {
        child.try_wait().map_err(GuardError::Wait)
    }
}

/// Resolves once the run is cancelled or its deadline passes.
async fn interrupted(cx: &RunContext<'_>) -> &'static str {
    let deadline = cx.deadline();
    let deadline_sleep = async move {
        match deadline {
            Some(at) => sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;

        _ = cx.cancel_token().cancelled() => "cancelled",
        _ = deadline_sleep => "deadline",
    }
}

async fn wait_or_interrupt(child: &mut Child, cx: &RunContext<'_>) -> Result<Waited, GuardError> {
    tokio::select! {
        biased;

        result = child.wait() => {
            let status = result.map_err(GuardError::Wait)?;
            debug!(status = %status, "Process exited");
            Ok(Waited::Exited(status))
        }
        reason = interrupted(cx) => Ok(Waited::Interrupted(reason)),
    }
}

/// Joins the pipe readers. Processes left in the group after the shell exits
/// keep the pipes open, so the join is raced against cancellation and the
/// deadline. When `watch` is set and either fires, the group is killed (or the
/// readers aborted if the group is gone) and `true` is returned.
async fn join_drains(
    drains: &mut JoinSet<Result<u64, GuardError>>,
    cx: &RunContext<'_>,
    pgid: u32,
    mut watch: bool,
) -> Result<(Option<GuardError>, bool), GuardError> {
    let mut capture_error = None;
    let mut killed = false;
    loop {
        let joined = tokio::select! {
            biased;

            joined = drains.join_next() => joined,
            reason = interrupted(cx), if watch => {
                watch = false;
                killed = true;
                if !kill_group(pgid, reason)? {
                    drains.abort_all();
                }
                continue;
            }
        };
        let Some(joined) = joined else { break };
        match joined {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                capture_error.get_or_insert(e);
            }
            Err(e) if e.is_cancelled() => debug!("Pipe reader aborted"),
            Err(e) => {
                capture_error.get_or_insert(GuardError::Io(std::io::Error::other(e)));
            }
        }
    }
    Ok((capture_error, killed))
}

fn record_exit(status: &mut Status, exit: ExitStatus) -> Result<(), GuardError> {
    match exit.code() {
        Some(0) => {
            status.exit_code = 0;
            Ok(())
        }
        Some(code) => {
            status.exit_code = code;
            Err(GuardError::Exit { code })
        }
        None => {
            status.exit_code = -1;
            Err(GuardError::Signaled {
                signal: exit.signal().unwrap_or_default(),
            })
        }
    }
}

#[instrument(skip_all, fields(command = %cx.request().command))]
async fn run_process(cx: &RunContext<'_>, status: &mut Status) -> Result<(), GuardError> {
    let request = cx.request();
    if cx.is_cancelled() || cx.deadline_passed() {
        debug!("Context already done, not starting command");
        return Err(GuardError::Cancelled);
    }

    let mut child = TokioCommand::from(build_command(&request.shell, &request.command))
        .kill_on_drop(true)
        .spawn()
        .map_err(GuardError::Start)?;
    let pgid = child.id().ok_or_else(|| {
        GuardError::Start(std::io::Error::other("child exited before its pid was read"))
    })?;
    debug!(pid = pgid, "Process spawned successfully");

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| GuardError::Start(std::io::Error::other("stdout pipe missing")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| GuardError::Start(std::io::Error::other("stderr pipe missing")))?;

    let mut drains = JoinSet::new();
    drains.spawn(drain(stdout, status.stdout.clone(), "stdout"));
    drains.spawn(drain(stderr, status.stderr.clone(), "stderr"));

    let waited = wait_or_interrupt(&mut child, cx).await?;
    let exited_on_its_own = matches!(waited, Waited::Exited(_));
    let outcome = match waited {
        Waited::Exited(exit) => Ok(exit),
        Waited::Interrupted(reason) => match kill_process_group(&mut child, reason)? {
            Some(exit) => {
                debug!("Interrupted, but process had already exited");
                Ok(exit)
            }
            None => {
                let exit = child.wait().await.map_err(GuardError::Wait)?;
                debug!(status = %exit, "Process exited after kill");
                Err(exit)
            }
        },
    };

    // A group already signalled needs no watching; its pipes close on their own.
    let (capture_error, killed_late) =
        join_drains(&mut drains, cx, pgid, exited_on_its_own).await?;

    match outcome {
        Ok(exit) if !killed_late => {
            let exited = record_exit(status, exit);
            if let Some(e) = capture_error {
                return Err(e);
            }
            exited
        }
        Ok(exit) => {
            debug!(status = %exit, "Shell exited but its process group outlived the run");
            let _ = record_exit(status, exit);
            Err(GuardError::Cancelled)
        }
        Err(killed) => {
            let _ = record_exit(status, killed);
            Err(GuardError::Cancelled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Request;
    use crate::pipeline::testing::{captured_status, Captured};
    use std::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;
    use tracing_subscriber::{fmt, EnvFilter};

    // Use `RUST_LOG=debug` to see logs, default info
    fn setup_tracing() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    }

    async fn run(cx: &RunContext<'_>) -> (Result<(), GuardError>, Status, Captured) {
        let (mut status, captured) = captured_status();
        let result = ProcessRunner.call(cx, &mut status).await;
        (result, status, captured)
    }

    #[tokio::test]
    async fn command_runs_successfully() {
        setup_tracing();
        let request = Request::builder("echo 'Hello'; sleep 0.1; echo 'World' >&2")
            .build()
            .unwrap();
        let cx = RunContext::new(&request, CancellationToken::new());
        let (result, status, captured) = run(&cx).await;
        result.unwrap();
        assert_eq!(status.exit_code, 0);
        assert_eq!(captured.stdout.text(), "Hello\n");
        assert_eq!(captured.stderr.text(), "World\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        setup_tracing();
        for (command, code) in [("exit 2", 2), ("false", 1), ("echo 'Error message' >&2; exit 55", 55)] {
            let request = Request::builder(command).build().unwrap();
            let cx = RunContext::new(&request, CancellationToken::new());
            let (result, status, _) = run(&cx).await;
            match result {
                Err(GuardError::Exit { code: got }) => assert_eq!(got, code),
                other => panic!("expected exit error for {command}, got {other:?}"),
            }
            assert_eq!(status.exit_code, code);
        }
    }

    #[tokio::test]
    async fn missing_shell_is_a_start_error() {
        setup_tracing();
        let request = Request::builder("true")
            .shell("/nonexistent/shell")
            .build()
            .unwrap();
        let cx = RunContext::new(&request, CancellationToken::new());
        let (result, _, _) = run(&cx).await;
        match result {
            Err(GuardError::Start(e)) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("expected start error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_kills_the_process_group() {
        setup_tracing();
        let request = Request::builder("sleep 5; echo 'This should not appear'")
            .build()
            .unwrap();
        let root = RunContext::new(&request, CancellationToken::new());
        let cx = root.child(Some(tokio::time::Instant::now() + Duration::from_millis(300)));
        let start = Instant::now();
        let (result, status, captured) = run(&cx).await;
        assert!(matches!(result, Err(GuardError::Cancelled)), "{result:?}");
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(status.exit_code, -1);
        assert!(captured.stdout.is_empty());
    }

    #[tokio::test]
    async fn cancellation_kills_the_process_group() {
        setup_tracing();
        let request = Request::builder("echo started; sleep 5").build().unwrap();
        let token = CancellationToken::new();
        let cx = RunContext::new(&request, token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            token.cancel();
        });
        let start = Instant::now();
        let (result, _, captured) = run(&cx).await;
        canceller.await.unwrap();
        assert!(matches!(result, Err(GuardError::Cancelled)), "{result:?}");
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(captured.stdout.text(), "started\n");
    }

    #[tokio::test]
    async fn deadline_reaches_background_children_holding_the_pipes() {
        setup_tracing();
        let request = Request::builder("sleep 3 & echo started").build().unwrap();
        let root = RunContext::new(&request, CancellationToken::new());
        let cx = root.child(Some(tokio::time::Instant::now() + Duration::from_millis(500)));
        let start = Instant::now();
        let (result, status, captured) = run(&cx).await;
        assert!(matches!(result, Err(GuardError::Cancelled)), "{result:?}");
        assert!(start.elapsed() < Duration::from_millis(2500), "{:?}", start.elapsed());
        // the shell itself exited cleanly before the kill
        assert_eq!(status.exit_code, 0);
        assert_eq!(captured.stdout.text(), "started\n");
    }

    #[tokio::test]
    async fn cancellation_reaches_background_children_holding_the_pipes() {
        setup_tracing();
        let request = Request::builder("sleep 3 & echo started").build().unwrap();
        let token = CancellationToken::new();
        let cx = RunContext::new(&request, token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            token.cancel();
        });
        let start = Instant::now();
        let (result, _, captured) = run(&cx).await;
        canceller.await.unwrap();
        assert!(matches!(result, Err(GuardError::Cancelled)), "{result:?}");
        assert!(start.elapsed() < Duration::from_millis(2500), "{:?}", start.elapsed());
        assert_eq!(captured.stdout.text(), "started\n");
    }

    #[tokio::test]
    async fn background_child_closing_its_pipes_is_not_waited_for() {
        setup_tracing();
        let request = Request::builder("sleep 3 >/dev/null 2>&1 & echo started")
            .build()
            .unwrap();
        let cx = RunContext::new(&request, CancellationToken::new());
        let start = Instant::now();
        let (result, _, captured) = run(&cx).await;
        result.unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(captured.stdout.text(), "started\n");
    }

    #[tokio::test]
    async fn already_cancelled_context_does_not_spawn() {
        let request = Request::builder("echo nope").build().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let cx = RunContext::new(&request, token);
        let (result, _, captured) = run(&cx).await;
        assert!(matches!(result, Err(GuardError::Cancelled)));
        assert!(captured.stdout.is_empty());
    }

    #[tokio::test]
    async fn binary_output_is_handled() {
        let request = Request::builder("head -c 50 /dev/urandom").build().unwrap();
        let cx = RunContext::new(&request, CancellationToken::new());
        let (result, _, captured) = run(&cx).await;
        result.unwrap();
        assert_eq!(captured.stdout.len(), 50);
    }
}
