//! Reaper configuration

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Reaper server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Listen address (e.g., "0.0.0.0:8080")
    pub listen_addr: String,
    /// How long to wait for the first client before giving up
    #[serde(with = "duration_secs")]
    pub connection_timeout: Duration,
    /// Grace period after the last client disconnected before sweeping
    #[serde(with = "duration_secs")]
    pub reconnection_timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            connection_timeout: Duration::from_secs(60),
            reconnection_timeout: Duration::from_secs(10),
        }
    }
}

impl ReaperConfig {
    /// Load configuration from file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path).await?;

        match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(&contents)?),
            _ => Ok(serde_json::from_str(&contents)?),
        }
    }
}

/// Parse a duration given as plain seconds or with an `ms`, `s` or `m` suffix
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: u64 = number
        .parse()
        .map_err(|_| Error::Config(format!("invalid duration '{}'", raw)))?;

    match unit {
        "" | "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        other => Err(Error::Config(format!(
            "unknown duration unit '{}' in '{}'",
            other, raw
        ))),
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("60").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("5h").is_err());
    }

    #[tokio::test]
    async fn test_from_yaml_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "listen_addr: 127.0.0.1:9090").unwrap();
        writeln!(file, "reconnection_timeout: 3").unwrap();

        let config = ReaperConfig::from_file(file.path()).await.unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9090");
        assert_eq!(config.reconnection_timeout, Duration::from_secs(3));
        assert_eq!(config.connection_timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_from_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"connection_timeout": 5}}"#).unwrap();

        let config = ReaperConfig::from_file(file.path()).await.unwrap();
        assert_eq!(config.connection_timeout, Duration::from_secs(5));
        assert_eq!(config.listen_addr, ReaperConfig::default().listen_addr);
    }
}
