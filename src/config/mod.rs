//! Configuration for the MIDI access gateway
//!
//! Handles loading, validating and hot-reloading the YAML configuration.
//! Every field has a default, so an empty file is a valid configuration.

pub mod watcher;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

pub use watcher::ConfigWatcher;

use crate::error::{Error, Result};
use crate::handlers::HandlerSettings;
use crate::permission::{AccessOptions, PERMISSION_TIMEOUT_CEILING};
use crate::reconnect::ReconnectPolicy;
use crate::security::FingerprintRules;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub midi: MidiConfig,
    #[serde(default)]
    pub permission: PermissionConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Replaces the built-in fingerprint table when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprints: Option<FingerprintRules>,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
}

/// MIDI client identity
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MidiConfig {
    #[serde(default = "default_client_name")]
    pub client_name: String,
}

impl Default for MidiConfig {
    fn default() -> Self {
        Self {
            client_name: default_client_name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PermissionConfig {
    /// Wait for the host's answer; clamped to 30 s
    #[serde(default = "default_permission_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub sysex: bool,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_permission_timeout_ms(),
            sysex: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_disconnect_rescan_delay_ms")]
    pub disconnect_rescan_delay_ms: u64,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Port list polling interval for hotplug detection
    #[serde(default = "default_hotplug_poll_ms")]
    pub hotplug_poll_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            disconnect_rescan_delay_ms: default_disconnect_rescan_delay_ms(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            hotplug_poll_ms: default_hotplug_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PersistenceConfig {
    /// Connectivity snapshot file; kept in memory when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_note_duration_ms")]
    pub note_duration_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            note_duration_ms: default_note_duration_ms(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file with validation
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .map_err(|e| Error::Config(format!("failed to read config file {}: {}", path, e)))?;

        let config = Self::from_yaml(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path, e)))?;
        Ok(config)
    }

    /// Parse and validate YAML text
    pub fn from_yaml(contents: &str) -> Result<Self> {
        // An empty document deserializes to unit, not to a mapping
        let config: AppConfig = if contents.trim().is_empty() {
            AppConfig::default()
        } else {
            serde_yaml::from_str(contents)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, path: &str) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)
            .await
            .map_err(|e| Error::Config(format!("failed to write config file {}: {}", path, e)))?;
        Ok(())
    }

    /// Validate configuration for correctness and consistency
    pub fn validate(&self) -> Result<()> {
        if self.midi.client_name.trim().is_empty() {
            return Err(Error::Config("midi.client_name cannot be empty".into()));
        }
        if self.permission.timeout_ms == 0 {
            return Err(Error::Config("permission.timeout_ms must be positive".into()));
        }

        let r = &self.reconnect;
        if r.retry_base_delay_ms == 0 {
            return Err(Error::Config("reconnect.retry_base_delay_ms must be positive".into()));
        }
        if r.retry_max_delay_ms < r.retry_base_delay_ms {
            return Err(Error::Config(format!(
                "reconnect.retry_max_delay_ms ({}) is below retry_base_delay_ms ({})",
                r.retry_max_delay_ms, r.retry_base_delay_ms
            )));
        }
        if r.hotplug_poll_ms == 0 {
            return Err(Error::Config("reconnect.hotplug_poll_ms must be positive".into()));
        }

        if let Some(rules) = &self.fingerprints {
            if rules.allow.iter().all(|t| t.trim().is_empty()) {
                return Err(Error::Config("fingerprints.allow cannot be empty".into()));
            }
            for rule in &rules.exclude {
                if rule.family.trim().is_empty() {
                    return Err(Error::Config("exclusion family name cannot be empty".into()));
                }
                if rule.tokens.is_empty() {
                    return Err(Error::Config(format!(
                        "exclusion family '{}' has no tokens",
                        rule.family
                    )));
                }
            }
        }

        if self.playback.note_duration_ms == 0 {
            return Err(Error::Config("playback.note_duration_ms must be positive".into()));
        }

        Ok(())
    }

    pub fn access_options(&self) -> AccessOptions {
        AccessOptions {
            sysex: self.permission.sysex,
            timeout: Duration::from_millis(self.permission.timeout_ms).min(PERMISSION_TIMEOUT_CEILING),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries: self.reconnect.max_retries,
            disconnect_rescan_delay: Duration::from_millis(self.reconnect.disconnect_rescan_delay_ms),
            retry_base_delay: Duration::from_millis(self.reconnect.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(self.reconnect.retry_max_delay_ms),
        }
    }

    pub fn hotplug_poll(&self) -> Duration {
        Duration::from_millis(self.reconnect.hotplug_poll_ms)
    }

    pub fn fingerprint_rules(&self) -> FingerprintRules {
        self.fingerprints.clone().unwrap_or_default()
    }

    pub fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings {
            note_duration_ms: self.playback.note_duration_ms,
            playback_enabled: self.playback.enabled,
        }
    }
}

fn default_client_name() -> String { "midi-gatekeeper".to_string() }
fn default_permission_timeout_ms() -> u64 { 10_000 }
fn default_max_retries() -> u32 { 3 }
fn default_disconnect_rescan_delay_ms() -> u64 { 250 }
fn default_retry_base_delay_ms() -> u64 { 400 }
fn default_retry_max_delay_ms() -> u64 { 1_200 }
fn default_hotplug_poll_ms() -> u64 { 1_000 }
fn default_true() -> bool { true }
fn default_note_duration_ms() -> u64 { 500 }
