//! User settings persisted across restarts.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::policy::UidRule;
use crate::proxy::ProxyInfo;
use crate::types::NetworkType;

pub const SETTINGS_FILENAME: &str = "settings.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub network_preference: Option<NetworkType>,
    pub mobile_data_enabled: Option<bool>,
    pub global_proxy: Option<ProxyInfo>,
    pub uid_rules: HashMap<u32, UidRule>,
}

pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(SETTINGS_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Settings> {
        if !self.path.exists() {
            return Ok(Settings::default());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(Settings::default());
        }
        let settings = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        debug!("Loaded settings from {}", self.path.display());
        Ok(settings)
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("failed to create settings directory")?;
        }

        let temp_path = self.path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(settings).context("failed to encode settings")?;

        {
            #[cfg(unix)]
            use std::os::unix::fs::OpenOptionsExt;

            let mut options = OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            options.mode(0o600);
            let mut file = options
                .open(&temp_path)
                .context("failed to open temp settings file")?;

            file.write_all(&bytes).context("failed to write settings")?;
            file.sync_all().context("failed to sync settings")?;
        }

        fs::rename(&temp_path, &self.path).context("failed to rename settings file")?;
        debug!("Saved settings to {}", self.path.display());
        Ok(())
    }

    /// Load, apply `change`, save.
    pub fn update(&self, change: impl FnOnce(&mut Settings)) -> Result<Settings> {
        let mut settings = self.load()?;
        change(&mut settings);
        self.save(&settings)?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let store = SettingsStore::new(temp_dir.path());
        assert_eq!(store.load().unwrap(), Settings::default());
    }

    #[test]
    fn update_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = SettingsStore::new(temp_dir.path());
            store
                .update(|s| {
                    s.network_preference = Some(NetworkType::MOBILE);
                    s.uid_rules.insert(10_050, UidRule::RejectMetered);
                })
                .unwrap();
        }

        let store = SettingsStore::new(temp_dir.path());
        let settings = store.load().unwrap();
        assert_eq!(settings.network_preference, Some(NetworkType::MOBILE));
        assert_eq!(settings.uid_rules.get(&10_050), Some(&UidRule::RejectMetered));
        assert!(!store.path().with_extension("tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn settings_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let store = SettingsStore::new(temp_dir.path());
        store.save(&Settings::default()).unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = SettingsStore::new(temp_dir.path());
        fs::write(store.path(), "{ not json").unwrap();
        assert!(store.load().is_err());
    }
}
