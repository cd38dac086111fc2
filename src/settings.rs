use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, sync::RwLock};

use crate::session::{AlarmTime, SessionConfig, SleepDuration};

const SETTINGS_ENV: &str = "SLEEPALARM_SETTINGS";
const APP_DIR: &str = "sleepalarm";

/// Startup configuration. Missing fields fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UserSettings {
    pub sleep_duration: SleepDuration,
    pub sleep_duration_options: Vec<SleepDuration>,
    pub alarm_time: AlarmTime,
    /// `brown_noise`, `rain`, or a path to an audio file.
    pub sleep_sound: String,
    /// `chime`, or a path to an audio file.
    pub alarm_sound: String,
    pub alarm_title: String,
    pub alarm_message: String,
    pub volume: f32,
    pub recordings_dir: Option<PathBuf>,
    pub journal_path: Option<PathBuf>,
    pub optimistic_permissions: bool,
}

impl Default for UserSettings {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            sleep_duration: session.sleep_duration,
            sleep_duration_options: session.sleep_duration_options,
            alarm_time: session.alarm_time,
            sleep_sound: "rain".into(),
            alarm_sound: "chime".into(),
            alarm_title: session.alarm_title,
            alarm_message: session.alarm_message,
            volume: 0.8,
            recordings_dir: None,
            journal_path: None,
            optimistic_permissions: session.optimistic_permissions,
        }
    }
}

impl UserSettings {
    pub fn recordings_dir(&self) -> PathBuf {
        self.recordings_dir
            .clone()
            .unwrap_or_else(|| data_dir().join("recordings"))
    }

    pub fn journal_path(&self) -> PathBuf {
        self.journal_path
            .clone()
            .unwrap_or_else(|| data_dir().join("sleepalarm.sqlite3"))
    }
}

impl From<&UserSettings> for SessionConfig {
    fn from(settings: &UserSettings) -> Self {
        Self {
            sleep_duration: settings.sleep_duration,
            sleep_duration_options: settings.sleep_duration_options.clone(),
            alarm_time: settings.alarm_time,
            alarm_title: settings.alarm_title.clone(),
            alarm_message: settings.alarm_message.clone(),
            optimistic_permissions: settings.optimistic_permissions,
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<UserSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                log::warn!(
                    "Ignoring malformed settings in {}: {err}",
                    path.display()
                );
                UserSettings::default()
            })
        } else {
            UserSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// `$SLEEPALARM_SETTINGS`, else `<config dir>/sleepalarm/settings.json`.
    pub fn default_path() -> PathBuf {
        if let Some(path) = std::env::var_os(SETTINGS_ENV) {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR)
            .join("settings.json")
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn settings(&self) -> UserSettings {
        match self.data.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json")).unwrap();
        let settings = store.settings();

        assert_eq!(settings, UserSettings::default());
        assert_eq!(settings.sleep_duration, SleepDuration::Minutes(20));
        assert_eq!(settings.alarm_time.to_string(), "08:30");
        assert_eq!(settings.sleep_sound, "rain");
    }

    #[test]
    fn partial_json_overrides_only_given_fields() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "sleepDuration": {{ "kind": "seconds", "value": 10.0 }},
                "alarmTime": "6:45",
                "sleepSound": "brown_noise",
                "optimisticPermissions": true
            }}"#
        )
        .unwrap();

        let settings = SettingsStore::new(file.path().to_path_buf())
            .unwrap()
            .settings();
        assert_eq!(settings.sleep_duration, SleepDuration::Seconds(10.0));
        assert_eq!(settings.alarm_time, AlarmTime::new(6, 45).unwrap());
        assert_eq!(settings.sleep_sound, "brown_noise");
        assert_eq!(settings.alarm_sound, "chime");
        assert_eq!(settings.alarm_title, "Wake up!");

        let config = SessionConfig::from(&settings);
        assert!(config.optimistic_permissions);
        assert_eq!(config.sleep_duration_options, SleepDuration::standard_options());
    }

    #[test]
    fn malformed_json_falls_back_to_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();

        let settings = SettingsStore::new(file.path().to_path_buf())
            .unwrap()
            .settings();
        assert_eq!(settings, UserSettings::default());
    }

    #[test]
    fn invalid_alarm_time_falls_back_to_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "alarmTime": "25:00" }}"#).unwrap();

        let settings = SettingsStore::new(file.path().to_path_buf())
            .unwrap()
            .settings();
        assert_eq!(settings.alarm_time, AlarmTime::default());
    }

    #[test]
    fn explicit_paths_win_over_data_dir() {
        let settings = UserSettings {
            recordings_dir: Some(PathBuf::from("/tmp/nights")),
            ..UserSettings::default()
        };
        assert_eq!(settings.recordings_dir(), PathBuf::from("/tmp/nights"));
        assert!(settings.journal_path().ends_with("sleepalarm/sleepalarm.sqlite3"));
    }
}
