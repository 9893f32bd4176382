use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::models::TrackedFile;

pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_TRACKED_FILES: &[&str] = &["chart/values-test.yaml", "chart/values-prod.yaml"];

/// Object-store connection used to cross-reference evaluation results.
#[derive(Clone)]
pub struct ResultStoreConfig {
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    /// Base URL of the object browser used to build viewer links.
    pub ui_base_url: Option<String>,
}

impl fmt::Debug for ResultStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultStoreConfig")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key", &self.access_key.as_ref().map(|_| "<redacted>"))
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("ui_base_url", &self.ui_base_url)
            .finish()
    }
}

/// Everything one monitor needs. Immutable once validated.
#[derive(Clone)]
pub struct MonitorConfig {
    /// Empty means "track the working copy at `local_path`".
    pub repo_url: String,
    pub local_path: PathBuf,
    pub username: Option<String>,
    pub password: Option<String>,
    pub branch: String,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    pub results_refresh_interval: Duration,
    pub tracked_files: Vec<TrackedFile>,
    pub work_dir: PathBuf,
    pub results: Option<ResultStoreConfig>,
}

impl fmt::Debug for MonitorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorConfig")
            .field("repo_url", &self.repo_url)
            .field("local_path", &self.local_path)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("branch", &self.branch)
            .field("poll_interval", &self.poll_interval)
            .field("error_backoff", &self.error_backoff)
            .field("results_refresh_interval", &self.results_refresh_interval)
            .field("tracked_files", &self.tracked_files)
            .field("work_dir", &self.work_dir)
            .field("results", &self.results)
            .finish()
    }
}

impl MonitorConfig {
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.branch.trim().is_empty() {
            return Err(ConfigError::EmptyBranch);
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("monitor_interval"));
        }
        if self.error_backoff.is_zero() {
            return Err(ConfigError::ZeroInterval("error_backoff"));
        }
        if self.results_refresh_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("results_refresh_interval"));
        }
        if self.tracked_files.is_empty() {
            return Err(ConfigError::NoTrackedFiles);
        }
        if self.username.is_some() && self.password.is_none() {
            return Err(ConfigError::MissingPassword);
        }
        Ok(self)
    }

    /// Identity of this configuration in the registry.
    pub fn key(&self) -> String {
        format!("{}-{}", self.repo_url, self.branch)
    }

    pub fn is_remote(&self) -> bool {
        !self.repo_url.is_empty()
    }

    /// Same configuration pointed at another repository/branch.
    pub fn with_overrides(&self, overrides: &MonitorOverrides) -> Result<Self, ConfigError> {
        let mut config = self.clone();
        if let Some(url) = non_empty(&overrides.git_repo_url) {
            config.repo_url = url;
            config.username = None;
            config.password = None;
        }
        if let Some(username) = non_empty(&overrides.git_username) {
            config.username = Some(username);
        }
        if let Some(password) = non_empty(&overrides.git_password) {
            config.password = Some(password);
        }
        if let Some(branch) = non_empty(&overrides.git_branch) {
            config.branch = branch;
        }
        if let Some(interval) = non_empty(&overrides.monitor_interval) {
            let secs = parse_secs("monitor_interval", &interval)?;
            config.poll_interval = Duration::from_secs(secs);
        }
        config.validate()
    }
}

/// Per-request configuration parameters, as accepted by the HTTP API.
#[derive(Debug, Default, Clone, serde::Deserialize)]
pub struct MonitorOverrides {
    pub git_repo_url: Option<String>,
    pub git_username: Option<String>,
    pub git_password: Option<String>,
    pub git_branch: Option<String>,
    pub monitor_interval: Option<String>,
}

/// Process-level settings, read once at startup.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_address: String,
    pub default_monitor: MonitorConfig,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let secs = |name: &'static str, default: u64| -> Result<Duration, ConfigError> {
            match var(name) {
                Some(raw) => Ok(Duration::from_secs(parse_secs(name, &raw)?)),
                None => Ok(Duration::from_secs(default)),
            }
        };

        let tracked_files = match var("TRACKED_FILES") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(TrackedFile::new)
                .collect(),
            None => DEFAULT_TRACKED_FILES
                .iter()
                .copied()
                .map(TrackedFile::new)
                .collect(),
        };

        let results = var("S3_BUCKET").map(|bucket| ResultStoreConfig {
            bucket,
            endpoint: var("S3_ENDPOINT"),
            region: var("S3_REGION").unwrap_or_else(|| "us-east-1".into()),
            access_key: var("S3_ACCESS_KEY"),
            secret_key: var("S3_SECRET_KEY"),
            ui_base_url: var("RESULTS_UI_URL").map(|u| u.trim_end_matches('/').to_string()),
        });

        let default_monitor = MonitorConfig {
            repo_url: var("GIT_REPO_URL").unwrap_or_default(),
            local_path: PathBuf::from(var("GIT_REPO_PATH").unwrap_or_else(|| ".".into())),
            username: var("GIT_USERNAME"),
            password: var("GIT_PASSWORD"),
            branch: var("GIT_BRANCH").unwrap_or_else(|| DEFAULT_BRANCH.into()),
            poll_interval: secs("MONITOR_INTERVAL", 30)?,
            error_backoff: secs("ERROR_BACKOFF_SECS", 60)?,
            results_refresh_interval: secs("RESULTS_REFRESH_INTERVAL", 300)?,
            tracked_files,
            work_dir: var("GIT_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("prompt-tracker-repos")),
            results,
        }
        .validate()?;

        Ok(Self {
            bind_address: var("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:5001".into()),
            default_monitor,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

fn parse_secs(name: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(vars: &[(&str, &str)]) -> Result<ServiceConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_map(&[]).unwrap();
        let monitor = &config.default_monitor;
        assert_eq!(config.bind_address, "0.0.0.0:5001");
        assert_eq!(monitor.branch, "main");
        assert_eq!(monitor.poll_interval, Duration::from_secs(30));
        assert_eq!(monitor.error_backoff, Duration::from_secs(60));
        assert!(!monitor.is_remote());
        assert!(monitor.results.is_none());
        let envs: Vec<_> = monitor
            .tracked_files
            .iter()
            .map(|f| f.environment.as_str())
            .collect();
        assert_eq!(envs, vec!["test", "prod"]);
    }

    #[test]
    fn test_results_store_from_env() {
        let config = from_map(&[
            ("S3_BUCKET", "evals"),
            ("S3_ENDPOINT", "http://minio:9000"),
            ("RESULTS_UI_URL", "http://console:9001/"),
        ])
        .unwrap();
        let results = config.default_monitor.results.unwrap();
        assert_eq!(results.bucket, "evals");
        assert_eq!(results.region, "us-east-1");
        assert_eq!(results.ui_base_url.as_deref(), Some("http://console:9001"));
    }

    #[test]
    fn test_invalid_interval_rejected() {
        assert!(matches!(
            from_map(&[("MONITOR_INTERVAL", "soon")]),
            Err(ConfigError::InvalidValue { name: "MONITOR_INTERVAL", .. })
        ));
        assert!(matches!(
            from_map(&[("MONITOR_INTERVAL", "0")]),
            Err(ConfigError::ZeroInterval(_))
        ));
    }

    #[test]
    fn test_username_requires_password() {
        assert!(matches!(
            from_map(&[("GIT_USERNAME", "bot")]),
            Err(ConfigError::MissingPassword)
        ));
    }

    #[test]
    fn test_overrides_change_identity() {
        let base = from_map(&[]).unwrap().default_monitor;
        let overrides = MonitorOverrides {
            git_repo_url: Some("https://git.example.com/team/app.git".into()),
            git_branch: Some("release".into()),
            monitor_interval: Some("10".into()),
            ..Default::default()
        };
        let config = base.with_overrides(&overrides).unwrap();
        assert_eq!(config.key(), "https://git.example.com/team/app.git-release");
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_ne!(config.key(), base.key());
    }

    #[test]
    fn test_debug_redacts_password() {
        let mut config = from_map(&[]).unwrap().default_monitor;
        config.password = Some("hunter2".into());
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
