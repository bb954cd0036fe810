// src/alert.rs

//! Failure reports to a Sentry-compatible store endpoint.
//!
//! One [`Reporter`] lives for one run. It keeps its own copies of the run's
//! output (separate from the combined log) and sends at most a handful of
//! small JSON events, each bounded by the flush timeout.

use crate::config::{AlertConfig, Request};
use crate::error::GuardError;
use crate::pipeline::Status;
use crate::sink::{tee, Buffer};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const FALLBACK_HOSTNAME: &str = "no-hostname";
const COMMAND_DISPLAY_MAX: usize = 32;
const COMMAND_DISPLAY_KEEP: usize = 30;

#[derive(Error, Debug)]
pub enum AlertError {
    #[error("invalid DSN: {0}")]
    InvalidDsn(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("report rejected with status {0}")]
    Rejected(StatusCode),
}

/// Kind of report. The name salts the fingerprint so that info reports never
/// group with failures of the same command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Finish,
    Info,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Finish => "finish",
            Level::Info => "info",
        }
    }

    fn severity(self) -> &'static str {
        match self {
            Level::Finish => "error",
            Level::Info => "info",
        }
    }
}

/// Parsed `scheme://key@host[:port]/[path/]project`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dsn {
    public_key: String,
    store_url: Url,
}

impl Dsn {
    pub fn parse(dsn: &str) -> Result<Self, AlertError> {
        let url = Url::parse(dsn).map_err(|e| AlertError::InvalidDsn(format!("{dsn}: {e}")))?;
        let public_key = url.username().to_string();
        if public_key.is_empty() {
            return Err(AlertError::InvalidDsn(format!("{dsn}: missing public key")));
        }
        if url.host_str().is_none() {
            return Err(AlertError::InvalidDsn(format!("{dsn}: missing host")));
        }
        let mut segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        let Some(project) = segments.pop() else {
            return Err(AlertError::InvalidDsn(format!("{dsn}: missing project")));
        };

        let mut path = String::from("/");
        for segment in &segments {
            path.push_str(segment);
            path.push('/');
        }
        path.push_str(&format!("api/{project}/store/"));

        let mut store_url = url.clone();
        store_url.set_path(&path);
        store_url.set_query(None);
        store_url.set_fragment(None);
        store_url
            .set_username("")
            .and_then(|()| store_url.set_password(None))
            .map_err(|()| AlertError::InvalidDsn(format!("{dsn}: cannot strip credentials")))?;

        Ok(Self {
            public_key,
            store_url,
        })
    }

    pub fn store_url(&self) -> &Url {
        &self.store_url
    }

    fn auth_header(&self) -> String {
        format!(
            "Sentry sentry_version=7, sentry_client=cron-guard/{}, sentry_key={}",
            env!("CARGO_PKG_VERSION"),
            self.public_key
        )
    }
}

/// Short host name: everything before the first dot.
pub fn short_hostname() -> String {
    let full = nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_default();
    match full.split('.').next() {
        Some(short) if !short.is_empty() => short.to_string(),
        _ => FALLBACK_HOSTNAME.to_string(),
    }
}

/// Command text as shown in report titles.
pub fn display_command(command: &str) -> String {
    if command.chars().count() > COMMAND_DISPLAY_MAX {
        let kept: String = command.chars().take(COMMAND_DISPLAY_KEEP).collect();
        format!("{kept}...")
    } else {
        command.to_string()
    }
}

/// Level name followed by SHA-256 over command and hostname, hex encoded.
pub fn fingerprint(command: &str, hostname: &str, level: Level) -> String {
    let digest = Sha256::new()
        .chain_update(command.as_bytes())
        .chain_update(hostname.as_bytes())
        .finalize();
    let mut salted = level.as_str().as_bytes().to_vec();
    salted.extend_from_slice(&digest);
    hex::encode(salted)
}

#[derive(Serialize, Debug)]
struct Event {
    event_id: String,
    timestamp: String,
    level: &'static str,
    platform: &'static str,
    message: String,
    fingerprint: Vec<String>,
    server_name: String,
    extra: Map<String, Value>,
}

pub struct Reporter {
    client: Client,
    dsn: Dsn,
    flush_timeout: Duration,
    hostname: String,
    command: String,
    title_command: String,
    started_at: DateTime<Utc>,
    started: Instant,
    combined: Buffer,
    stderr: Buffer,
}

impl Reporter {
    pub fn new(request: &Request, config: &AlertConfig) -> Result<Self, AlertError> {
        let dsn = Dsn::parse(&config.dsn)?;
        let client = Client::builder().timeout(config.flush_timeout).build()?;
        Ok(Self {
            client,
            dsn,
            flush_timeout: config.flush_timeout,
            hostname: short_hostname(),
            command: request.command.clone(),
            title_command: display_command(&request.command),
            started_at: Utc::now(),
            started: Instant::now(),
            combined: Buffer::new(),
            stderr: Buffer::new(),
        })
    }

    /// Tees the run's streams into the reporter's own buffers.
    pub fn attach(&self, status: &mut Status) {
        status.stdout = tee(vec![self.combined.shared(), status.stdout.clone()]);
        status.stderr = tee(vec![
            self.stderr.shared(),
            self.combined.shared(),
            status.stderr.clone(),
        ]);
    }

    /// Reports a terminal failure. `true` when delivery was confirmed.
    pub async fn finish(&self, err: &GuardError) -> bool {
        self.report(err, Level::Finish).await
    }

    /// Reports a recoverable anomaly. `true` when delivery was confirmed.
    pub async fn info(&self, err: &GuardError) -> bool {
        self.report(err, Level::Info).await
    }

    fn event(&self, err: &GuardError, level: Level) -> Event {
        let mut extra = Map::new();
        extra.insert("command".into(), json!(self.command));
        extra.insert(
            "time_start".into(),
            json!(self.started_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        let message = match level {
            Level::Finish => {
                extra.insert(
                    "time_end".into(),
                    json!(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
                );
                extra.insert(
                    "time_duration".into(),
                    json!(format!("{:?}", self.started.elapsed())),
                );
                extra.insert("out_combined".into(), json!(self.combined.text()));
                extra.insert("out_stderr".into(), json!(self.stderr.text()));
                format!("{}: {} ({err})", self.hostname, self.title_command)
            }
            Level::Info => format!(
                "{} ({}): {} ({err})",
                self.hostname,
                level.as_str(),
                self.title_command
            ),
        };
        Event {
            event_id: uuid::Uuid::new_v4().simple().to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level: level.severity(),
            platform: "other",
            message,
            fingerprint: vec![fingerprint(&self.command, &self.hostname, level)],
            server_name: self.hostname.clone(),
            extra,
        }
    }

    async fn report(&self, err: &GuardError, level: Level) -> bool {
        let event = self.event(err, level);
        let sent = tokio::time::timeout(self.flush_timeout, self.send(&event)).await;
        match sent {
            Ok(Ok(())) => {
                debug!(event_id = %event.event_id, level = level.as_str(), "Report delivered");
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, level = level.as_str(), "Report not delivered");
                false
            }
            Err(_) => {
                warn!(timeout = ?self.flush_timeout, level = level.as_str(), "Report not delivered in time");
                false
            }
        }
    }

    async fn send(&self, event: &Event) -> Result<(), AlertError> {
        let response = self
            .client
            .post(self.dsn.store_url().clone())
            .header("X-Sentry-Auth", self.dsn.auth_header())
            .json(event)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(AlertError::Rejected(status))
        }
    }
}
