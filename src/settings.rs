//! Supervisor settings persisted to the app data directory.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tauri::{AppHandle, Manager};

use crate::backend::health::HealthGateOptions;

// Settings that tune the supervisor only; the backend's own captioning
// configuration lives behind its /api/config endpoint and never passes
// through here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSettings {
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    #[serde(default = "default_health_initial_delay_ms")]
    pub health_initial_delay_ms: u64,
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
}

fn default_port_range_start() -> u16 {
    5000
}

fn default_port_range_end() -> u16 {
    5099
}

fn default_health_initial_delay_ms() -> u64 {
    1000
}

fn default_health_interval_ms() -> u64 {
    100
}

fn default_health_timeout_ms() -> u64 {
    30_000
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            health_initial_delay_ms: default_health_initial_delay_ms(),
            health_interval_ms: default_health_interval_ms(),
            health_timeout_ms: default_health_timeout_ms(),
        }
    }
}

impl SupervisorSettings {
    pub fn health_gate(&self) -> HealthGateOptions {
        HealthGateOptions {
            initial_delay: Duration::from_millis(self.health_initial_delay_ms),
            interval: Duration::from_millis(self.health_interval_ms),
            timeout: Duration::from_millis(self.health_timeout_ms),
        }
    }
}

fn validate_settings(settings: &SupervisorSettings) -> Result<(), String> {
    if settings.port_range_start > settings.port_range_end {
        return Err("Port range start must not exceed range end".to_string());
    }
    if settings.health_interval_ms == 0 {
        return Err("Health probe interval must be greater than zero".to_string());
    }
    if settings.health_timeout_ms == 0 {
        return Err("Health timeout must be greater than zero".to_string());
    }
    Ok(())
}

pub fn get_settings_path(app: &AppHandle) -> Result<PathBuf, String> {
    let app_data_dir = app
        .path()
        .app_data_dir()
        .map_err(|e| format!("Failed to get app data directory: {e}"))?;

    // Ensure the directory exists
    std::fs::create_dir_all(&app_data_dir)
        .map_err(|e| format!("Failed to create app data directory: {e}"))?;

    Ok(app_data_dir.join("supervisor-settings.json"))
}

/// Settings for the startup path: any problem falls back to defaults so
/// a corrupt file can never keep the shell from starting.
pub fn load_or_default(app: &AppHandle) -> SupervisorSettings {
    match get_settings_path(app) {
        Ok(path) if path.exists() => match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(settings) => settings,
                Err(e) => {
                    log::warn!("Failed to parse supervisor settings, using defaults: {e}");
                    SupervisorSettings::default()
                }
            },
            Err(e) => {
                log::warn!("Failed to read supervisor settings, using defaults: {e}");
                SupervisorSettings::default()
            }
        },
        _ => SupervisorSettings::default(),
    }
}

#[tauri::command]
pub async fn load_settings(app: AppHandle) -> Result<SupervisorSettings, String> {
    log::trace!("Loading supervisor settings from disk");
    let path = get_settings_path(&app)?;

    if !path.exists() {
        log::trace!("Settings file not found, using defaults");
        return Ok(SupervisorSettings::default());
    }

    let contents = std::fs::read_to_string(&path).map_err(|e| {
        log::error!("Failed to read settings file: {e}");
        format!("Failed to read settings file: {e}")
    })?;

    serde_json::from_str(&contents).map_err(|e| {
        log::error!("Failed to parse settings JSON: {e}");
        format!("Failed to parse settings: {e}")
    })
}

#[tauri::command]
pub async fn save_settings(app: AppHandle, settings: SupervisorSettings) -> Result<(), String> {
    validate_settings(&settings)?;

    log::trace!("Saving supervisor settings to disk");
    let path = get_settings_path(&app)?;

    let json_content = serde_json::to_string_pretty(&settings).map_err(|e| {
        log::error!("Failed to serialize settings: {e}");
        format!("Failed to serialize settings: {e}")
    })?;

    // Write to a temporary file first, then rename (atomic operation)
    // Use unique temp file to avoid race conditions with concurrent saves
    let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));

    std::fs::write(&temp_path, json_content).map_err(|e| {
        log::error!("Failed to write settings file: {e}");
        format!("Failed to write settings file: {e}")
    })?;

    std::fs::rename(&temp_path, &path).map_err(|e| {
        // Clean up temp file on rename failure
        let _ = std::fs::remove_file(&temp_path);
        log::error!("Failed to finalize settings file: {e}");
        format!("Failed to finalize settings file: {e}")
    })?;

    log::trace!("Saved supervisor settings to {path:?}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let settings: SupervisorSettings = serde_json::from_str("{}").expect("parse");
        assert_eq!(settings.port_range_start, 5000);
        assert_eq!(settings.port_range_end, 5099);
        assert_eq!(settings.health_timeout_ms, 30_000);
    }

    #[test]
    fn partial_document_keeps_remaining_defaults() {
        let settings: SupervisorSettings =
            serde_json::from_str(r#"{ "port_range_start": 6000, "port_range_end": 6010 }"#)
                .expect("parse");
        assert_eq!(settings.port_range_start, 6000);
        assert_eq!(settings.port_range_end, 6010);
        assert_eq!(settings.health_interval_ms, 100);
    }

    #[test]
    fn inverted_port_range_is_rejected() {
        let settings = SupervisorSettings {
            port_range_start: 6000,
            port_range_end: 5000,
            ..SupervisorSettings::default()
        };
        assert!(validate_settings(&settings).is_err());
    }

    #[test]
    fn zero_timings_are_rejected() {
        let settings = SupervisorSettings {
            health_interval_ms: 0,
            ..SupervisorSettings::default()
        };
        assert!(validate_settings(&settings).is_err());

        let settings = SupervisorSettings {
            health_timeout_ms: 0,
            ..SupervisorSettings::default()
        };
        assert!(validate_settings(&settings).is_err());
    }

    #[test]
    fn health_gate_conversion_uses_milliseconds() {
        let options = SupervisorSettings::default().health_gate();
        assert_eq!(options.initial_delay, Duration::from_millis(1000));
        assert_eq!(options.interval, Duration::from_millis(100));
        assert_eq!(options.timeout, Duration::from_millis(30_000));
    }
}
