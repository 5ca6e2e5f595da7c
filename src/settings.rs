use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, sync::RwLock, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".into(),
            auth_token: None,
            request_timeout_secs: 10,
        }
    }
}

impl ApiSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PresenceSettings {
    pub socket_url: String,
    pub capture_interval_ms: u64,
    pub capture_timeout_ms: u64,
    pub frame_width: u32,
    pub frame_height: u32,
    pub jpeg_quality: u8,
    /// Substring marking an inbound message as "person present".
    pub present_marker: String,
    /// Substring marking an inbound message as "person absent". Checked first.
    pub absent_marker: String,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            socket_url: "ws://127.0.0.1:8765".into(),
            capture_interval_ms: 1000,
            capture_timeout_ms: 3000,
            frame_width: 320,
            frame_height: 240,
            jpeg_quality: 40,
            present_marker: "person_detected".into(),
            absent_marker: "no_person".into(),
        }
    }
}

/// Accounting rules for a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionRules {
    /// A background interval strictly longer than this is a violation.
    pub violation_threshold_secs: u64,
    pub penalty_unit_secs: u64,
    pub milestone_percents: Vec<u8>,
    pub warning_thresholds_secs: Vec<u64>,
    pub notice_dismiss_secs: u64,
    /// Relaunch gaps longer than this are treated as corrupted markers.
    pub max_recovery_gap_secs: u64,
    pub persist_every_ticks: u32,
}

impl Default for SessionRules {
    fn default() -> Self {
        Self {
            violation_threshold_secs: 60,
            penalty_unit_secs: 60,
            milestone_percents: vec![20, 40, 60, 80],
            warning_thresholds_secs: vec![180, 60],
            notice_dismiss_secs: 3,
            max_recovery_gap_secs: 24 * 60 * 60,
            persist_every_ticks: 10,
        }
    }
}

impl SessionRules {
    /// Applies `STUDYTRACK_DEBUG`, which persists progress on every tick.
    pub fn with_env_overrides(mut self) -> Self {
        let debug_mode = std::env::var("STUDYTRACK_DEBUG")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if debug_mode {
            self.persist_every_ticks = 1;
        }
        self
    }

    pub fn penalty_minutes(&self, secs: u64) -> u64 {
        secs / self.penalty_unit_secs.max(1)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StudySettings {
    pub api: ApiSettings,
    pub presence: PresenceSettings,
    pub rules: SessionRules,
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<StudySettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!("Settings at {} unparsable ({err}); using defaults", path.display());
                StudySettings::default()
            })
        } else {
            StudySettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn current(&self) -> StudySettings {
        match self.data.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update(&self, settings: StudySettings) -> Result<()> {
        let mut guard = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = settings;
        self.persist(&guard)
    }

    fn persist(&self, data: &StudySettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json")).unwrap();

        let settings = store.current();
        assert_eq!(settings.rules.violation_threshold_secs, 60);
        assert_eq!(settings.rules.milestone_percents, vec![20, 40, 60, 80]);
        assert_eq!(settings.presence.capture_interval_ms, 1000);
    }

    #[test]
    fn update_persists_and_partial_files_merge_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::new(path.clone()).unwrap();

        let mut settings = store.current();
        settings.api.base_url = "https://api.example.test".into();
        store.update(settings).unwrap();

        let reloaded = SettingsStore::new(path.clone()).unwrap();
        assert_eq!(reloaded.current().api.base_url, "https://api.example.test");

        fs::write(&path, r#"{"rules":{"notice_dismiss_secs":5}}"#).unwrap();
        let partial = SettingsStore::new(path).unwrap().current();
        assert_eq!(partial.rules.notice_dismiss_secs, 5);
        assert_eq!(partial.rules.warning_thresholds_secs, vec![180, 60]);
    }

    #[test]
    fn garbage_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "}{").unwrap();

        let store = SettingsStore::new(path).unwrap();
        assert_eq!(store.current(), StudySettings::default());
    }

    #[test]
    fn penalty_minutes_round_down() {
        let rules = SessionRules::default();
        assert_eq!(rules.penalty_minutes(59), 0);
        assert_eq!(rules.penalty_minutes(70), 1);
        assert_eq!(rules.penalty_minutes(125), 2);
    }
}
