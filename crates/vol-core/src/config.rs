//! volgrid.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolgridConfig {
    pub state: StateConfig,
    pub reconciler: ReconcilerConfig,
    pub membership: MembershipConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub data_dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/volgrid"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Interval between periodic reconciliation passes.
    pub tick_interval: String,
    /// Upper bound on a single plugin publish/unpublish call.
    pub plugin_timeout: String,
    /// Plugin failures tolerated before a volume is marked degraded.
    pub max_plugin_attempts: u32,
    /// First retry delay after a failure.
    pub backoff_base: String,
    /// Retry delay ceiling.
    pub backoff_max: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tick_interval: "1s".to_string(),
            plugin_timeout: "30s".to_string(),
            max_plugin_attempts: 5,
            backoff_base: "1s".to_string(),
            backoff_max: "60s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Missed-heartbeat window after which a node is considered down.
    pub dead_timeout: String,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            dead_timeout: "30s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`.
    pub filter: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info,volgrid=debug".to_string(),
            json: false,
        }
    }
}

impl VolgridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: VolgridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check that every duration string parses.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (field, value) in [
            ("reconciler.tick_interval", &self.reconciler.tick_interval),
            ("reconciler.plugin_timeout", &self.reconciler.plugin_timeout),
            ("reconciler.backoff_base", &self.reconciler.backoff_base),
            ("reconciler.backoff_max", &self.reconciler.backoff_max),
            ("membership.dead_timeout", &self.membership.dead_timeout),
        ] {
            if parse_duration(value).is_none() {
                anyhow::bail!("invalid duration for {field}: {value:?}");
            }
        }
        if self.reconciler.max_plugin_attempts == 0 {
            anyhow::bail!("reconciler.max_plugin_attempts must be at least 1");
        }
        Ok(())
    }
}

impl ReconcilerConfig {
    pub fn tick_interval(&self) -> Duration {
        parse_duration(&self.tick_interval).unwrap_or(Duration::from_secs(1))
    }

    pub fn plugin_timeout(&self) -> Duration {
        parse_duration(&self.plugin_timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn backoff_base(&self) -> Duration {
        parse_duration(&self.backoff_base).unwrap_or(Duration::from_secs(1))
    }

    pub fn backoff_max(&self) -> Duration {
        parse_duration(&self.backoff_max).unwrap_or(Duration::from_secs(60))
    }
}

impl MembershipConfig {
    pub fn dead_timeout(&self) -> Duration {
        parse_duration(&self.dead_timeout).unwrap_or(Duration::from_secs(30))
    }
}

/// Parse `"250ms"`, `"5s"`, `"2m"` or `"1h"`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.parse::<u64>().ok().map(Duration::from_secs);
    }
    if let Some(mins) = s.strip_suffix('m') {
        return mins
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs);
    }
    if let Some(hours) = s.strip_suffix('h') {
        return hours
            .parse::<u64>()
            .ok()
            .and_then(|h| h.checked_mul(3600))
            .map(Duration::from_secs);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip() {
        let config = VolgridConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("tick_interval"));
        let parsed = VolgridConfig::from_toml(&toml_str).unwrap();
        assert_eq!(parsed.reconciler.max_plugin_attempts, 5);
    }

    #[test]
    fn test_parse_partial() {
        let toml_str = r#"
[reconciler]
tick_interval = "250ms"
max_plugin_attempts = 3

[log]
json = true
"#;
        let config = VolgridConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.reconciler.tick_interval(), Duration::from_millis(250));
        assert_eq!(config.reconciler.max_plugin_attempts, 3);
        assert_eq!(config.reconciler.backoff_max(), Duration::from_secs(60));
        assert!(config.log.json);
        assert_eq!(config.state.data_dir, PathBuf::from("/var/lib/volgrid"));
    }

    #[test]
    fn test_reject_bad_duration() {
        let toml_str = r#"
[membership]
dead_timeout = "soon"
"#;
        assert!(VolgridConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("fast"), None);
    }

    #[test]
    fn test_parse_duration_overflow() {
        assert_eq!(parse_duration(&format!("{}m", u64::MAX)), None);
        assert_eq!(parse_duration(&format!("{}h", u64::MAX / 60)), None);
        let toml_str = format!("[membership]\ndead_timeout = \"{}h\"\n", u64::MAX);
        assert!(VolgridConfig::from_toml(&toml_str).is_err());
    }
}
