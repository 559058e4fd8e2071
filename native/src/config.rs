use crate::port::Thresholds;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const SETTINGS_FILE: &str = "settings.json";

pub const ENV_PASSING_VOLTAGE: &str = "POE_PASSING_VOLTAGE";
pub const ENV_PASSING_POWER: &str = "POE_PASSING_POWER";
pub const ENV_POLL_INTERVAL_MS: &str = "POE_POLL_INTERVAL_MS";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config directory not accessible")]
    ConfigDirError,
    #[error("Invalid value {value:?} for {name}")]
    InvalidOverride { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub passing_voltage: f64,
    pub passing_power: f64,
    pub poll_interval_ms: u64,
    pub window_title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_directory: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_trace: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        let thresholds = Thresholds::default();
        Self {
            passing_voltage: thresholds.voltage,
            passing_power: thresholds.power,
            poll_interval_ms: 100,
            window_title: "PoE Burn-In".to_string(),
            device_directory: None,
            active_device: None,
            sample_trace: None,
        }
    }
}

impl Settings {
    /// Load from the user config directory, creating the file with defaults
    /// when it does not exist yet.
    pub fn load() -> Result<Self, SettingsError> {
        let path = get_config_directory()?.join(SETTINGS_FILE);
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            let settings = Self::default();
            if let Err(e) = settings.save_to(path) {
                warn!("[SETTINGS] Could not write defaults to {:?}: {}", path, e);
            } else {
                info!("[SETTINGS] Created default settings at {:?}", path);
            }
            return Ok(settings);
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        info!("[SETTINGS] Loaded {:?}", path);
        Ok(settings)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Apply `POE_*` environment variables on top of the file values.
    pub fn apply_env_overrides(&mut self) -> Result<(), SettingsError> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(volts) = parse_override(&lookup, ENV_PASSING_VOLTAGE)? {
            self.passing_voltage = volts;
        }
        if let Some(watts) = parse_override(&lookup, ENV_PASSING_POWER)? {
            self.passing_power = watts;
        }
        if let Some(ms) = parse_override(&lookup, ENV_POLL_INTERVAL_MS)? {
            self.poll_interval_ms = ms;
        }
        Ok(())
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            voltage: self.passing_voltage,
            power: self.passing_power,
        }
    }

    /// Poll period, never shorter than one millisecond.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn parse_override<F, T>(lookup: &F, name: &'static str) -> Result<Option<T>, SettingsError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => {
            let value = raw
                .trim()
                .parse::<T>()
                .map_err(|_| SettingsError::InvalidOverride {
                    name,
                    value: raw.clone(),
                })?;
            info!("[SETTINGS] {} overrides settings file", name);
            Ok(Some(value))
        }
    }
}

pub fn get_config_directory() -> Result<PathBuf, SettingsError> {
    dirs::config_dir()
        .map(|dir| dir.join("PoeBurnIn"))
        .ok_or(SettingsError::ConfigDirError)
}
