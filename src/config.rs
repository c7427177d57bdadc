//! Konfiguration
//!
//! Reihenfolge: Defaults → `config.json` im Konfigurationsverzeichnis der
//! Plattform → Umgebungsvariablen.

use crate::call_engine::MediaKinds;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Standard-Relay (lokaler Signaling-Server)
pub const DEFAULT_RELAY_URL: &str = "http://localhost:3000";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

// ============================================================================
// CONFIG TYPES
// ============================================================================

/// Wie der Gesprächspartner gefunden wird
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressingMode {
    /// Anruf direkt an eine Endpoint-ID
    #[default]
    Direct,
    /// Beide Seiten treten einem Raum bei; der Relay bestimmt den Initiator
    Room,
}

/// STUN/TURN Server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        username: None,
        credential: None,
    }]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub relay_url: String,
    pub ring_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub media: MediaKinds,
    pub addressing: AddressingMode,
    pub auto_answer: bool,
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            ring_timeout_secs: 30,
            heartbeat_interval_secs: 25,
            media: MediaKinds::default(),
            addressing: AddressingMode::Direct,
            auto_answer: false,
            ice_servers: default_ice_servers(),
        }
    }
}

impl Config {
    /// Lädt Datei (falls vorhanden) und wendet Umgebungsvariablen an
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading config from {:?}", path);
                Self::from_file(&path)?
            }
            _ => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Ermittelt den Pfad zur Konfigurationsdatei
    pub fn config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "ringr", "ringr")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }

    /// Überschreibt Werte aus einer Key-Value-Quelle (normalerweise `std::env`)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("SIGNALING_URL") {
            self.relay_url = url;
        }

        if let Some(raw) = lookup("RINGR_RING_TIMEOUT_SECS") {
            self.ring_timeout_secs = raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "RINGR_RING_TIMEOUT_SECS",
                value: raw.clone(),
            })?;
        }

        if let Some(raw) = lookup("RINGR_VIDEO") {
            self.media.video = parse_flag("RINGR_VIDEO", &raw)?;
        }

        if let Some(raw) = lookup("RINGR_AUTO_ANSWER") {
            self.auto_answer = parse_flag("RINGR_AUTO_ANSWER", &raw)?;
        }

        Ok(())
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

fn parse_flag(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
        }),
    }
}

// ============================================================================
// TESTS
// ============================================================================
