//! Application-level configuration loading: storage, OCR, delivery and worker settings.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

use crate::sheets::ocr::EMBEDDED_TEXT_MODEL;

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "PLAYBYMAIL_CONFIG_PATH";

/// How a delivery channel reaches its mailing service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// In-memory transport that accepts everything and records it.
    #[default]
    Fake,
    /// HTTP mailing service.
    Http {
        /// Endpoint the artifact is posted to.
        endpoint: String,
        /// Bearer token, if the service requires one.
        #[serde(default)]
        api_key: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// SQLite database file.
    pub database_path: PathBuf,
    /// HTTP listen port.
    pub port: u16,
    /// Token expected in `x-admin-token`; admin routes are open when unset.
    pub admin_token: Option<String>,
    /// OCR backend; anything other than `embedded-text` selects the HTTP engine.
    pub ocr_model: String,
    /// Endpoint of the HTTP OCR engine.
    pub ocr_endpoint: Option<String>,
    /// Tries per delivery channel before it is abandoned.
    pub delivery_retry_budget: u32,
    /// First delivery backoff delay.
    pub delivery_backoff_base_seconds: u64,
    /// Failed executions tolerated before a job is given up.
    pub job_attempt_budget: u32,
    /// Wall-clock limit for one job execution.
    pub job_deadline_seconds: u64,
    /// How long a claim stays valid before another worker may reclaim it.
    pub job_lease_seconds: u64,
    /// Number of queue workers.
    pub worker_count: usize,
    /// Delay between polls of an empty queue.
    pub poll_interval_ms: u64,
    /// Directory the `physical_local` transport spools into.
    pub spool_dir: PathBuf,
    /// Email transport.
    pub email: TransportConfig,
    /// Physical post transport.
    pub physical_post: TransportConfig,
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(config) => {
                    info!(
                        path = %path.display(),
                        database = %config.database_path.display(),
                        ocr_model = %config.ocr_model,
                        workers = config.worker_count,
                        "loaded configuration"
                    );
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// First delivery backoff delay as a [`Duration`].
    pub fn delivery_backoff_base(&self) -> Duration {
        Duration::from_secs(self.delivery_backoff_base_seconds)
    }

    /// Job deadline as a [`Duration`].
    pub fn job_deadline(&self) -> Duration {
        Duration::from_secs(self.job_deadline_seconds)
    }

    /// Job lease as a [`Duration`].
    pub fn job_lease(&self) -> Duration {
        Duration::from_secs(self.job_lease_seconds)
    }

    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Whether the OCR model names the built-in embedded text engine.
    pub fn uses_embedded_ocr(&self) -> bool {
        self.ocr_model == EMBEDDED_TEXT_MODEL
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/playbymail.db"),
            port: 8080,
            admin_token: None,
            ocr_model: EMBEDDED_TEXT_MODEL.to_owned(),
            ocr_endpoint: None,
            delivery_retry_budget: 3,
            delivery_backoff_base_seconds: 30,
            job_attempt_budget: 5,
            job_deadline_seconds: 60,
            job_lease_seconds: 300,
            worker_count: 4,
            poll_interval_ms: 500,
            spool_dir: PathBuf::from("spool"),
            email: TransportConfig::Fake,
            physical_post: TransportConfig::Fake,
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let config: AppConfig = serde_json::from_str(
            r#"{
                "delivery_retry_budget": 5,
                "email": { "kind": "http", "endpoint": "https://mail.example/send", "api_key": "k" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.delivery_retry_budget, 5);
        assert_eq!(config.delivery_backoff_base_seconds, 30);
        assert!(config.uses_embedded_ocr());
        assert_eq!(
            config.email,
            TransportConfig::Http {
                endpoint: "https://mail.example/send".into(),
                api_key: Some("k".into()),
            }
        );
        assert_eq!(config.physical_post, TransportConfig::Fake);
    }

    #[test]
    fn unknown_transport_kind_is_rejected() {
        let parsed = serde_json::from_str::<AppConfig>(r#"{ "email": { "kind": "smtp" } }"#);
        assert!(parsed.is_err());
    }
}
