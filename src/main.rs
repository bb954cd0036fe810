use anyhow::{Context, Result};
use clap::Parser;
use cron_guard::config::{ALERT_DSN_ENV, DEFAULT_ERRFILE, DEFAULT_NAME};
use cron_guard::realtime::OUTPUT_TARGET;
use cron_guard::{run_guarded, AlertConfig, FileConfig, GuardError, Request};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Runs a cron command and reports its failures exactly once.
///
/// Example crontab entry:
///
///     */5 * * * * cron-guard --name backup --lockfile /run/backup.lock "/usr/local/bin/backup"
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Job name, used as the syslog process name (cron-guard.<name>).
    #[arg(long, default_value = DEFAULT_NAME)]
    name: String,

    /// File failed runs are appended to.
    #[arg(long, default_value = DEFAULT_ERRFILE)]
    errfile: PathBuf,

    /// Leave start/end/timing lines out of the error report.
    #[arg(long)]
    errfile_quiet: bool,

    /// Do not prefix report lines with the run id.
    #[arg(long)]
    errfile_no_uuid: bool,

    /// Windows in which failures are ignored: 'cron:duration[:cron:duration...]',
    /// e.g. '0 3 * * *:1h'.
    #[arg(long, default_value = "")]
    quiet_times: String,

    /// Kill the command after this long (e.g. 30s, 1h). 0 disables.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "0s")]
    timeout: Duration,

    /// Skip the run while another run holding this lock is alive.
    #[arg(long)]
    lockfile: Option<PathBuf>,

    /// Pattern for bad stdout lines, overriding the err/fail/crit default.
    #[arg(long)]
    regex: Option<String>,

    /// TOML config file (alert settings). Defaults to ./cron-guard.toml or
    /// /etc/cron-guard.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Shell used to run the command as `<shell> -c <command>`.
    #[arg(long, default_value = "sh")]
    shell: String,

    /// Relay output through the diagnostic log instead of syslog.
    #[arg(long)]
    no_syslog: bool,

    /// Verbose diagnostics on stderr.
    #[arg(long)]
    debug: bool,

    /// The command, as a single argument.
    command: String,
}

fn init_tracing(debug: bool) {
    let default = if debug {
        "debug".to_string()
    } else {
        format!("warn,{OUTPUT_TARGET}=info")
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Cancels `token` on the first SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        };
        warn!(signal = name, "Received signal, cancelling run");
        token.cancel();
    });
    Ok(())
}

fn build_request(args: Args) -> Result<Request> {
    let file = FileConfig::load(args.config.as_deref())?;
    let alert = AlertConfig::resolve(std::env::var(ALERT_DSN_ENV).ok(), &file);
    debug!(alerting = alert.is_some(), "Loaded configuration");

    let mut builder = Request::builder(args.command)
        .name(args.name)
        .shell(args.shell)
        .timeout(args.timeout)
        .quiet_times(args.quiet_times)
        .alert(alert)
        .errfile(args.errfile)
        .errfile_quiet(args.errfile_quiet)
        .hide_run_id(args.errfile_no_uuid)
        .syslog(!args.no_syslog);
    if let Some(lockfile) = args.lockfile {
        builder = builder.lockfile(lockfile);
    }
    if let Some(pattern) = args.regex {
        builder = builder.keywords(pattern);
    }
    Ok(builder.build()?)
}

async fn run(args: Args) -> Result<()> {
    let request = build_request(args)?;
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone()).context("installing signal handlers")?;
    run_guarded(&request, cancel).await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.debug);

    if let Err(e) = run(args).await {
        eprintln!("cron-guard: {e:#}");
        let code = e
            .downcast_ref::<GuardError>()
            .map_or(1, GuardError::exit_code);
        std::process::exit(code);
    }
}
