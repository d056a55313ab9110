use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use shared_logging::LogLevel;

/// Static, read-only settings shared by every request evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageConfig {
    /// Master switch; when off every request passes through untouched.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Decision oracle endpoint receiving `{src_ip, payload}` posts.
    #[serde(default = "default_oracle_endpoint")]
    pub oracle_endpoint: String,
    /// Hard deadline for a single oracle call, in milliseconds.
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
    /// Base URL prepended to rooted redirect targets.
    #[serde(default = "default_redirect_base_url")]
    pub redirect_base_url: String,
    /// Tarpit delay applied when a verdict does not carry one, in milliseconds.
    #[serde(default = "default_tarpit_delay_ms")]
    pub tarpit_delay_ms: u64,
    /// Tokens escalating a request to the oracle (matched case-insensitively).
    #[serde(default = "default_suspicion_tokens")]
    pub suspicion_tokens: Vec<String>,
    /// Path prefixes that bypass triage entirely.
    #[serde(default = "default_skip_prefixes")]
    pub skip_prefixes: Vec<String>,
    /// Largest request body buffered for inspection.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// JSON-lines file receiving one record per terminal outcome.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// JSON-lines event log consumed by the dashboard.
    #[serde(default)]
    pub event_log_path: Option<PathBuf>,
    /// Minimum level written to `log_path`.
    #[serde(default)]
    pub log_level: LogLevel,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            oracle_endpoint: default_oracle_endpoint(),
            deadline_ms: default_deadline_ms(),
            redirect_base_url: default_redirect_base_url(),
            tarpit_delay_ms: default_tarpit_delay_ms(),
            suspicion_tokens: default_suspicion_tokens(),
            skip_prefixes: default_skip_prefixes(),
            max_body_bytes: default_max_body_bytes(),
            log_path: None,
            event_log_path: None,
            log_level: LogLevel::default(),
        }
    }
}

impl TriageConfig {
    /// Loads configuration from a TOML file and applies environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading triage config {}", path.display()))?;
        let mut config: Self =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        let source_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        for candidate in [&mut config.log_path, &mut config.event_log_path]
            .into_iter()
            .flatten()
        {
            if candidate.is_relative() {
                *candidate = source_dir.join(&*candidate);
            }
        }
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for deployments without a config file.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `TRIPWIRE_*` overrides using `lookup` to read variables.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup("TRIPWIRE_ENABLED") {
            self.enabled = parse_flag(&value);
        }
        if let Some(value) = lookup("TRIPWIRE_ORACLE_URL") {
            self.oracle_endpoint = value;
        }
        if let Some(value) = lookup("TRIPWIRE_DEADLINE_MS") {
            self.deadline_ms = value
                .trim()
                .parse()
                .with_context(|| format!("TRIPWIRE_DEADLINE_MS=`{value}` is not a number"))?;
        }
        if let Some(value) = lookup("TRIPWIRE_BASE_URL") {
            self.redirect_base_url = value;
        }
        if let Some(value) = lookup("TRIPWIRE_TARPIT_DELAY_MS") {
            self.tarpit_delay_ms = value
                .trim()
                .parse()
                .with_context(|| format!("TRIPWIRE_TARPIT_DELAY_MS=`{value}` is not a number"))?;
        }
        if let Some(value) = lookup("TRIPWIRE_TOKENS") {
            self.suspicion_tokens = value.split(',').map(str::to_owned).collect();
        }
        if let Some(value) = lookup("TRIPWIRE_LOG_PATH") {
            self.log_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("TRIPWIRE_EVENT_LOG") {
            self.event_log_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("TRIPWIRE_LOG_LEVEL") {
            self.log_level = value.parse()?;
        }
        Ok(())
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.deadline_ms == 0 {
            bail!("deadline_ms must be greater than zero");
        }
        if self.suspicion_tokens.iter().all(|t| t.trim().is_empty()) {
            bail!("at least one non-blank suspicion token is required");
        }
        let base = self.redirect_base_url.trim();
        if !base.is_empty() && !(base.starts_with("http://") || base.starts_with("https://")) {
            bail!("redirect_base_url `{base}` must be empty or an http(s) URL");
        }
        if self.oracle_endpoint.trim().is_empty() {
            bail!("oracle_endpoint must not be empty");
        }
        Ok(())
    }

    /// Oracle deadline.
    #[must_use]
    pub const fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    /// Default tarpit delay.
    #[must_use]
    pub const fn tarpit_delay(&self) -> Duration {
        Duration::from_millis(self.tarpit_delay_ms)
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

const fn default_true() -> bool {
    true
}

fn default_oracle_endpoint() -> String {
    "http://127.0.0.1:5000/simulate_traffic".into()
}

const fn default_deadline_ms() -> u64 {
    2_000
}

fn default_redirect_base_url() -> String {
    "http://127.0.0.1:5000".into()
}

const fn default_tarpit_delay_ms() -> u64 {
    1_000
}

const fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_suspicion_tokens() -> Vec<String> {
    [
        "select",
        "union",
        "insert",
        "update",
        "delete",
        "drop",
        "sql",
        "information_schema",
        "--",
        "<script",
        "javascript:",
        "onerror=",
        "onload=",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_skip_prefixes() -> Vec<String> {
    vec!["/static".into(), "/health".into()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_values() {
        let config = TriageConfig::default();
        assert!(config.enabled);
        assert_eq!(config.deadline(), Duration::from_millis(2_000));
        assert_eq!(config.tarpit_delay(), Duration::from_millis(1_000));
        assert!(config.suspicion_tokens.iter().any(|t| t == "union"));
        config.validate().unwrap();
    }

    #[test]
    fn loads_file_and_resolves_relative_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("triage.toml");
        fs::write(
            &path,
            r#"
deadline_ms = 250
redirect_base_url = "http://h:5000/"
suspicion_tokens = ["select", "<script"]
log_path = "logs/triage.jsonl"
log_level = "WARN"
"#,
        )
        .unwrap();
        let config = TriageConfig::load(&path).unwrap();
        assert_eq!(config.deadline_ms, 250);
        assert_eq!(config.suspicion_tokens.len(), 2);
        assert_eq!(config.log_level, LogLevel::Warn);
        let log_path = config.log_path.unwrap();
        assert!(log_path.starts_with(dir.path()));
        assert_eq!(config.tarpit_delay_ms, 1_000);
    }

    #[test]
    fn environment_overrides_take_precedence() {
        let vars: HashMap<&str, &str> = [
            ("TRIPWIRE_ENABLED", "off"),
            ("TRIPWIRE_DEADLINE_MS", "75"),
            ("TRIPWIRE_TOKENS", "nmap,scan"),
        ]
        .into_iter()
        .collect();
        let mut config = TriageConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| (*v).to_string()))
            .unwrap();
        assert!(!config.enabled);
        assert_eq!(config.deadline_ms, 75);
        assert_eq!(config.suspicion_tokens, vec!["nmap", "scan"]);
    }

    #[test]
    fn rejects_unusable_settings() {
        let mut config = TriageConfig {
            deadline_ms: 0,
            ..TriageConfig::default()
        };
        assert!(config.validate().is_err());
        config.deadline_ms = 10;
        config.suspicion_tokens = vec!["  ".into()];
        assert!(config.validate().is_err());
        config.suspicion_tokens = vec!["drop".into()];
        config.redirect_base_url = "ftp://decoy".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_numeric_deadline_override() {
        let mut config = TriageConfig::default();
        let err = config
            .apply_overrides(|key| (key == "TRIPWIRE_DEADLINE_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("TRIPWIRE_DEADLINE_MS"));
    }
}
