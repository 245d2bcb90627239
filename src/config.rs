//! Engine configuration.
//!
//! Loaded from `pos-sync.json` in the data directory, or built in code.
//! Secrets may be left out of the file; they are then looked up in the OS
//! credential store (see [`crate::storage`]).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::ConfigError;
use crate::storage;

pub const CONFIG_FILE_NAME: &str = "pos-sync.json";

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct CloudConfig {
    pub base_url: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

impl fmt::Debug for CloudConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    pub url: String,
    #[serde(default, skip_serializing)]
    pub secret: Option<String>,
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("url", &self.url)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Intervals and timeouts, all optional in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub replay_interval_secs: u64,
    pub relay_pull_interval_secs: u64,
    pub ack_check_delay_ms: u64,
    pub cloud_timeout_ms: u64,
    pub relay_cooldown_secs: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            replay_interval_secs: 15,
            relay_pull_interval_secs: 5,
            ack_check_delay_ms: 3000,
            cloud_timeout_ms: 8000,
            relay_cooldown_secs: 15,
        }
    }
}

impl Timings {
    pub fn replay_interval(&self) -> Duration {
        Duration::from_secs(self.replay_interval_secs)
    }

    pub fn relay_pull_interval(&self) -> Duration {
        Duration::from_secs(self.relay_pull_interval_secs)
    }

    pub fn ack_check_delay(&self) -> Duration {
        Duration::from_millis(self.ack_check_delay_ms)
    }

    pub fn cloud_timeout(&self) -> Duration {
        Duration::from_millis(self.cloud_timeout_ms)
    }

    pub fn relay_cooldown(&self) -> Duration {
        Duration::from_secs(self.relay_cooldown_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    #[serde(default)]
    pub terminal_id: Option<String>,
    #[serde(default)]
    pub unit_name: Option<String>,
    #[serde(default)]
    pub cloud: Option<CloudConfig>,
    #[serde(default)]
    pub relay: Option<RelayConfig>,
    #[serde(default)]
    pub legacy_import_path: Option<PathBuf>,
    /// Rolling log files go here; defaults to `{data_dir}/logs`.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub timings: Timings,
}

/// Secrets and identity after resolution. Secrets are wiped on drop.
pub struct Credentials {
    pub terminal_id: String,
    pub cloud_api_key: Option<Zeroizing<String>>,
    pub relay_secret: Option<Zeroizing<String>>,
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let mut config: EngineConfig = serde_json::from_str(&raw)?;
        if config.data_dir.as_os_str().is_empty() {
            if let Some(parent) = path.parent() {
                config.data_dir = parent.to_path_buf();
            }
        }
        config.validate()?;
        info!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    /// Load `{data_dir}/pos-sync.json`, or fall back to defaults when the
    /// file does not exist.
    pub fn load_from_dir(data_dir: &Path) -> Result<Self, ConfigError> {
        let path = data_dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            let mut config = Self::load(&path)?;
            config.data_dir = data_dir.to_path_buf();
            Ok(config)
        } else {
            info!("No {CONFIG_FILE_NAME} in {}, using defaults", data_dir.display());
            Ok(Self::new(data_dir))
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.timings;
        if t.replay_interval_secs == 0 || t.relay_pull_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "background intervals must be greater than zero".into(),
            ));
        }
        if t.cloud_timeout_ms == 0 {
            return Err(ConfigError::Invalid("cloud timeout must be greater than zero".into()));
        }
        if let Some(cloud) = &self.cloud {
            if cloud.base_url.trim().is_empty() {
                return Err(ConfigError::Invalid("cloud.base_url is empty".into()));
            }
        }
        if let Some(relay) = &self.relay {
            if relay.url.trim().is_empty() {
                return Err(ConfigError::Invalid("relay.url is empty".into()));
            }
        }
        Ok(())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("logs"))
    }

    /// Resolve identity and secrets, falling back to the OS credential store.
    pub fn resolve_credentials(&mut self) -> Result<Credentials, ConfigError> {
        self.resolve_credentials_with(storage::get_credential)
    }

    /// Like [`resolve_credentials`](Self::resolve_credentials) with an
    /// explicit fallback lookup. Secrets found in the config are moved out of
    /// it so only the zeroizing copy remains.
    pub fn resolve_credentials_with(
        &mut self,
        lookup: impl Fn(&str) -> Option<Zeroizing<String>>,
    ) -> Result<Credentials, ConfigError> {
        let terminal_id = match self
            .terminal_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            Some(id) => id.to_string(),
            None => lookup(storage::KEY_TERMINAL_ID)
                .map(|id| id.trim().to_string())
                .ok_or_else(|| ConfigError::Invalid("terminal id is not configured".into()))?,
        };

        let cloud_api_key = match self.cloud.as_mut() {
            None => None,
            Some(cloud) => {
                let key = take_secret(&mut cloud.api_key)
                    .or_else(|| lookup(storage::KEY_CLOUD_API_KEY));
                if key.is_none() {
                    warn!("Cloud URL configured without an API key; cloud sync disabled");
                }
                key
            }
        };

        let relay_secret = match self.relay.as_mut() {
            None => None,
            Some(relay) => {
                let secret =
                    take_secret(&mut relay.secret).or_else(|| lookup(storage::KEY_RELAY_SECRET));
                if secret.is_none() {
                    warn!("Relay URL configured without a shared secret; LAN relay disabled");
                }
                secret
            }
        };

        Ok(Credentials {
            terminal_id,
            cloud_api_key,
            relay_secret,
        })
    }
}

fn take_secret(slot: &mut Option<String>) -> Option<Zeroizing<String>> {
    let value = Zeroizing::new(slot.take()?);
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_keyring(_: &str) -> Option<Zeroizing<String>> {
        None
    }

    #[test]
    fn test_parse_minimal_config_uses_default_timings() {
        let config: EngineConfig = serde_json::from_str(
            r#"{
                "data_dir": "/var/lib/pos",
                "terminal_id": "t1",
                "cloud": { "base_url": "https://admin.thesmall.app", "api_key": "k" },
                "timings": { "replay_interval_secs": 30 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.timings.replay_interval(), Duration::from_secs(30));
        assert_eq!(config.timings.relay_pull_interval(), Duration::from_secs(5));
        assert_eq!(config.timings.ack_check_delay(), Duration::from_millis(3000));
        assert!(config.relay.is_none());
        assert_eq!(config.log_dir(), PathBuf::from("/var/lib/pos/logs"));
    }

    #[test]
    fn test_secrets_are_not_serialized_or_debug_printed() {
        let config = EngineConfig {
            cloud: Some(CloudConfig {
                base_url: "https://c".into(),
                api_key: Some("super-secret".into()),
            }),
            ..EngineConfig::new("/tmp/pos")
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("super-secret"));
        assert!(!format!("{config:?}").contains("super-secret"));
    }

    #[test]
    fn test_resolve_moves_secrets_out_of_config() {
        let mut config = EngineConfig {
            terminal_id: Some(" t1 ".into()),
            cloud: Some(CloudConfig {
                base_url: "https://c".into(),
                api_key: Some("key".into()),
            }),
            relay: Some(RelayConfig {
                url: "http://10.0.0.2:7070".into(),
                secret: None,
            }),
            ..EngineConfig::new("/tmp/pos")
        };

        let creds = config
            .resolve_credentials_with(|key| {
                (key == storage::KEY_RELAY_SECRET).then(|| Zeroizing::new("shh".to_string()))
            })
            .unwrap();
        assert_eq!(creds.terminal_id, "t1");
        assert_eq!(creds.cloud_api_key.as_deref().map(String::as_str), Some("key"));
        assert_eq!(creds.relay_secret.as_deref().map(String::as_str), Some("shh"));
        assert!(config.cloud.as_ref().unwrap().api_key.is_none());
    }

    #[test]
    fn test_missing_terminal_id_is_an_error() {
        let mut config = EngineConfig::new("/tmp/pos");
        assert!(matches!(
            config.resolve_credentials_with(no_keyring),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = EngineConfig::new("/tmp/pos");
        config.timings.relay_pull_interval_secs = 0;
        assert!(config.validate().is_err());
    }
}
