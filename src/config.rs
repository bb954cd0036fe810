// src/config.rs

use crate::error::GuardError;
use crate::quiet::QuietWindow;
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Matches the words err, fail and crit at a word start, case-insensitively.
/// `failure` and `ERRORS` match, `transferred` does not.
pub const DEFAULT_KEYWORDS: &str = r"(?im)\b(err|fail|crit)";

pub const DEFAULT_NAME: &str = "cron-guard";

pub const DEFAULT_ERRFILE: &str = "/var/log/cronstatus";

/// Environment variable that overrides `alert_dsn` from the config file.
pub const ALERT_DSN_ENV: &str = "CRON_GUARD_ALERT_DSN";

pub const DEFAULT_ALERT_TIMEOUT: Duration = Duration::from_secs(30);

const CONFIG_CANDIDATES: &[&str] = &["cron-guard.toml", "/etc/cron-guard.toml"];

/// Optional settings loaded from a TOML file.
#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub alert_dsn: Option<String>,
    pub alert_timeout_ms: Option<u64>,
}

impl FileConfig {
    pub fn from_path(path: &Path) -> Result<Self, GuardError> {
        let content = fs::read_to_string(path)
            .map_err(|e| GuardError::Config(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| GuardError::Config(format!("parsing {}: {e}", path.display())))
    }

    /// Loads `explicit` if given, otherwise the first existing default
    /// location. No file at all means defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, GuardError> {
        if let Some(path) = explicit {
            return Self::from_path(path);
        }
        for candidate in CONFIG_CANDIDATES {
            let path = Path::new(candidate);
            match fs::metadata(path) {
                Ok(_) => {
                    debug!(path = %path.display(), "Loading config file");
                    return Self::from_path(path);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(GuardError::Config(format!(
                        "reading {}: {e}",
                        path.display()
                    )))
                }
            }
        }
        Ok(Self::default())
    }
}

/// Where and how to deliver failure reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertConfig {
    pub dsn: String,
    pub flush_timeout: Duration,
}

impl AlertConfig {
    /// The environment value wins over the file; an empty DSN disables
    /// alerting.
    pub fn resolve(env_dsn: Option<String>, file: &FileConfig) -> Option<Self> {
        let dsn = env_dsn.or_else(|| file.alert_dsn.clone())?;
        if dsn.trim().is_empty() {
            return None;
        }
        let flush_timeout = file
            .alert_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_ALERT_TIMEOUT);
        Some(Self {
            dsn: dsn.trim().to_string(),
            flush_timeout,
        })
    }
}

/// One guarded run. Built once and shared by reference with every stage.
#[derive(Debug)]
pub struct Request {
    pub name: String,
    pub command: String,
    pub shell: String,
    pub keywords: Regex,
    pub timeout: Option<Duration>,
    pub lockfile: Option<PathBuf>,
    pub quiet_windows: Vec<QuietWindow>,
    pub alert: Option<AlertConfig>,
    pub errfile: PathBuf,
    pub errfile_quiet: bool,
    pub hide_run_id: bool,
    pub run_id: String,
    pub syslog: bool,
}

impl Request {
    pub fn builder(command: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(command)
    }

    /// Name used as the syslog process name, always under the guard's prefix.
    pub fn process_name(&self) -> String {
        if self.name.starts_with(DEFAULT_NAME) {
            self.name.clone()
        } else {
            format!("{DEFAULT_NAME}.{}", self.name)
        }
    }
}

pub struct RequestBuilder {
    name: String,
    command: String,
    shell: String,
    keywords: Option<String>,
    timeout: Option<Duration>,
    lockfile: Option<PathBuf>,
    quiet_times: String,
    alert: Option<AlertConfig>,
    errfile: PathBuf,
    errfile_quiet: bool,
    hide_run_id: bool,
    syslog: bool,
}

impl RequestBuilder {
    fn new(command: impl Into<String>) -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            command: command.into(),
            shell: "sh".to_string(),
            keywords: None,
            timeout: None,
            lockfile: None,
            quiet_times: String::new(),
            alert: None,
            errfile: PathBuf::from(DEFAULT_ERRFILE),
            errfile_quiet: false,
            hide_run_id: false,
            syslog: true,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn keywords(mut self, pattern: impl Into<String>) -> Self {
        self.keywords = Some(pattern.into());
        self
    }

    /// A zero duration disables the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn lockfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.lockfile = Some(path.into());
        self
    }

    pub fn quiet_times(mut self, spec: impl Into<String>) -> Self {
        self.quiet_times = spec.into();
        self
    }

    pub fn alert(mut self, alert: Option<AlertConfig>) -> Self {
        self.alert = alert;
        self
    }

    pub fn errfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.errfile = path.into();
        self
    }

    pub fn errfile_quiet(mut self, quiet: bool) -> Self {
        self.errfile_quiet = quiet;
        self
    }

    pub fn hide_run_id(mut self, hide: bool) -> Self {
        self.hide_run_id = hide;
        self
    }

    pub fn syslog(mut self, enabled: bool) -> Self {
        self.syslog = enabled;
        self
    }

    pub fn build(self) -> Result<Request, GuardError> {
        if self.command.trim().is_empty() {
            return Err(GuardError::Config("empty command".to_string()));
        }
        let pattern = self.keywords.as_deref().unwrap_or(DEFAULT_KEYWORDS);
        let keywords = Regex::new(pattern)
            .map_err(|e| GuardError::Config(format!("invalid regex '{pattern}': {e}")))?;
        let quiet_windows = QuietWindow::parse_list(&self.quiet_times)?;
        Ok(Request {
            name: self.name,
            command: self.command,
            shell: self.shell,
            keywords,
            timeout: self.timeout,
            lockfile: self.lockfile,
            quiet_windows,
            alert: self.alert,
            errfile: self.errfile,
            errfile_quiet: self.errfile_quiet,
            hide_run_id: self.hide_run_id,
            run_id: uuid::Uuid::new_v4().simple().to_string(),
            syslog: self.syslog,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_keywords() {
        let request = Request::builder("true").build().unwrap();
        let re = &request.keywords;
        for line in ["fail", "failure", "ERR", "ERROR", "Crit", "Critical", "transferred error"] {
            assert!(re.is_match(line), "{line} should match");
        }
        for line in ["transferred", "all good", "prefail"] {
            assert!(!re.is_match(line), "{line} should not match");
        }
    }

    #[test]
    fn build_rejects_bad_input() {
        assert!(matches!(
            Request::builder("true").keywords("(unclosed").build(),
            Err(GuardError::Config(_))
        ));
        assert!(matches!(
            Request::builder("true").quiet_times("0 * * * *").build(),
            Err(GuardError::Config(_))
        ));
        assert!(matches!(
            Request::builder("  ").build(),
            Err(GuardError::Config(_))
        ));
    }

    #[test]
    fn zero_timeout_disables() {
        let request = Request::builder("true")
            .timeout(Duration::ZERO)
            .build()
            .unwrap();
        assert_eq!(request.timeout, None);
        let request = Request::builder("true")
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        assert_eq!(request.timeout, Some(Duration::from_millis(500)));
    }

    #[test]
    fn run_id_is_fixed_width_and_unique() {
        let a = Request::builder("true").build().unwrap();
        let b = Request::builder("true").build().unwrap();
        assert_eq!(a.run_id.len(), 32);
        assert_ne!(a.run_id, b.run_id);
    }

    #[test]
    fn process_name_is_prefixed() {
        let request = Request::builder("true").name("backup").build().unwrap();
        assert_eq!(request.process_name(), "cron-guard.backup");
        let request = Request::builder("true").build().unwrap();
        assert_eq!(request.process_name(), "cron-guard");
    }

    #[test]
    fn env_dsn_overrides_file() {
        let file = FileConfig {
            alert_dsn: Some("http://file@host/1".into()),
            alert_timeout_ms: Some(1500),
        };
        let alert = AlertConfig::resolve(Some("http://env@host/2".into()), &file).unwrap();
        assert_eq!(alert.dsn, "http://env@host/2");
        assert_eq!(alert.flush_timeout, Duration::from_millis(1500));

        let alert = AlertConfig::resolve(None, &file).unwrap();
        assert_eq!(alert.dsn, "http://file@host/1");

        assert_eq!(AlertConfig::resolve(Some(String::new()), &file), None);
        assert_eq!(AlertConfig::resolve(None, &FileConfig::default()), None);
    }

    #[test]
    fn file_config_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "alert_dsn = \"https://key@alerts.example.com/7\"").unwrap();
        writeln!(file, "alert_timeout_ms = 2000").unwrap();
        let config = FileConfig::load(Some(file.path())).unwrap();
        assert_eq!(
            config.alert_dsn.as_deref(),
            Some("https://key@alerts.example.com/7")
        );
        assert_eq!(config.alert_timeout_ms, Some(2000));

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        writeln!(broken, "alert_dsn = ").unwrap();
        assert!(matches!(
            FileConfig::load(Some(broken.path())),
            Err(GuardError::Config(_))
        ));
    }
}
