use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

use crate::models::Subject;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(String),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },

    #[error("could not read subjects file {path}: {reason}")]
    SubjectsFile { path: String, reason: String },
}

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Process configuration, read once at startup from the environment
/// (optionally seeded from a .env file).
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,

    pub firewall_url: String,
    pub firewall_api_key: String,
    pub wireless_url: String,
    pub wireless_api_key: String,

    /// Webhook for push notifications; notifications are off when unset
    pub notify_url: Option<String>,

    pub state_path: PathBuf,
    pub subjects_path: PathBuf,

    pub tick_secs: u64,
    pub http_timeout_secs: u64,

    /// Device identifiers never to block, comma separated in the env
    pub excluded_macs: HashSet<String>,

    pub log_level: String,
    pub log_file: Option<String>,
}

fn optional(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn require(var: &str) -> ConfigResult<String> {
    optional(var).ok_or_else(|| ConfigError::MissingVar(var.to_string()))
}

fn parse_or<T>(var: &str, default: T) -> ConfigResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(var) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var: var.to_string(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> ConfigResult<Self> {
        Ok(Self {
            listen_addr: parse_or("CURFEW_LISTEN_ADDR", "0.0.0.0:8080".parse().unwrap())?,
            firewall_url: require("CURFEW_FIREWALL_URL")?,
            firewall_api_key: require("CURFEW_FIREWALL_API_KEY")?,
            wireless_url: require("CURFEW_WIRELESS_URL")?,
            wireless_api_key: require("CURFEW_WIRELESS_API_KEY")?,
            notify_url: optional("CURFEW_NOTIFY_URL"),
            state_path: optional("CURFEW_STATE_PATH")
                .unwrap_or_else(|| "curfew-state.json".to_string())
                .into(),
            subjects_path: optional("CURFEW_SUBJECTS_PATH")
                .unwrap_or_else(|| "subjects.json".to_string())
                .into(),
            tick_secs: parse_or(
                "CURFEW_TICK_SECS",
                crate::engine::reconcile::DEFAULT_TICK_SECS,
            )?,
            http_timeout_secs: parse_or("CURFEW_HTTP_TIMEOUT_SECS", 20)?,
            excluded_macs: optional("CURFEW_EXCLUDED_MACS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            log_level: optional("CURFEW_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_file: optional("CURFEW_LOG_FILE"),
        })
    }
}

/// Load the fixed subject roster from its JSON file.
pub async fn load_subjects(path: &Path) -> ConfigResult<Vec<Subject>> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ConfigError::SubjectsFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    serde_json::from_slice(&bytes).map_err(|e| ConfigError::SubjectsFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subjects_file_round_trips() {
        let path = std::env::temp_dir().join(format!("curfew-subjects-{}.json", uuid::Uuid::new_v4()));
        tokio::fs::write(
            &path,
            r#"[
                {"tracker": "tr1", "name": "kid", "rule_id": "r1"},
                {"tracker": "tr2", "name": "teen", "rule_id": "r2", "schedule_rule_id": "s2"}
            ]"#,
        )
        .await
        .unwrap();

        let subjects = load_subjects(&path).await.unwrap();
        assert_eq!(subjects.len(), 2);
        assert_eq!(subjects[0].name, "kid");
        assert_eq!(subjects[0].schedule_rule_id, None);
        assert_eq!(subjects[1].schedule_rule_id.as_deref(), Some("s2"));

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn missing_subjects_file_is_an_error() {
        let path = std::env::temp_dir().join("curfew-subjects-does-not-exist.json");
        assert!(matches!(
            load_subjects(&path).await,
            Err(ConfigError::SubjectsFile { .. })
        ));
    }
}
