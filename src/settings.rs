use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, sync::RwLock};

use crate::measure::SidePreference;

/// Which camera the frames come from; recorded on snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraFacing {
    User,
    Environment,
}

impl CameraFacing {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraFacing::User => "user",
            CameraFacing::Environment => "environment",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserSettings {
    side_preference: SidePreference,
    camera_facing: CameraFacing,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            side_preference: SidePreference::default(),
            camera_facing: CameraFacing::User,
        }
    }
}

/// Durable user preferences. Read once at startup; setters persist
/// synchronously before returning, so the file never lags the in-memory
/// value. The UI thread is the only writer.
pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<UserSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_default()
        } else {
            UserSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn side_preference(&self) -> SidePreference {
        self.data.read().unwrap().side_preference
    }

    pub fn set_side_preference(&self, preference: SidePreference) -> Result<()> {
        let mut guard = self.data.write().unwrap();
        guard.side_preference = preference;
        self.persist(&guard)
    }

    pub fn camera_facing(&self) -> CameraFacing {
        self.data.read().unwrap().camera_facing
    }

    pub fn set_camera_facing(&self, facing: CameraFacing) -> Result<()> {
        let mut guard = self.data.write().unwrap();
        guard.camera_facing = facing;
        self.persist(&guard)
    }

    fn persist(&self, data: &UserSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_settings_path() -> PathBuf {
        std::env::temp_dir().join(format!("flexion-settings-{}.json", uuid::Uuid::new_v4()))
    }

    #[test]
    fn defaults_to_left_when_no_file_exists() {
        let store = SettingsStore::new(temp_settings_path()).unwrap();
        assert_eq!(store.side_preference(), SidePreference::Left);
        assert_eq!(store.camera_facing(), CameraFacing::User);
    }

    #[test]
    fn preference_survives_a_restart() {
        let path = temp_settings_path();
        {
            let store = SettingsStore::new(path.clone()).unwrap();
            store.set_side_preference(SidePreference::Auto).unwrap();
            store.set_camera_facing(CameraFacing::Environment).unwrap();
        }

        let reopened = SettingsStore::new(path.clone()).unwrap();
        assert_eq!(reopened.side_preference(), SidePreference::Auto);
        assert_eq!(reopened.camera_facing(), CameraFacing::Environment);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn corrupt_settings_fall_back_to_defaults() {
        let path = temp_settings_path();
        fs::write(&path, "{not json").unwrap();

        let store = SettingsStore::new(path.clone()).unwrap();
        assert_eq!(store.side_preference(), SidePreference::Left);

        let _ = fs::remove_file(path);
    }
}
