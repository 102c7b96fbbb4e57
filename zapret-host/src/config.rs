//! Persisted config store
//!
//! Handles:
//! - Lazy load of config.json with per-field fallback to defaults
//! - Seeding the version from a bundled ./release/<version> tree
//! - Whole-document atomic saves (temp file + rename)
//! - One in-memory Config per process behind a mutex

use crate::error::{HostError, Result};
use crate::models::Config;
use crate::settings::Settings;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct ConfigStore {
    config_path: PathBuf,
    releases_dir: PathBuf,
    logs_dir: PathBuf,
    bundled_release_dir: PathBuf,
    config: Mutex<Option<Config>>,
}

impl ConfigStore {
    pub fn new(settings: &Settings) -> Self {
        Self {
            config_path: settings.config_path(),
            releases_dir: settings.releases_dir(),
            logs_dir: settings.logs_dir(),
            bundled_release_dir: settings.bundled_release_dir.clone(),
            config: Mutex::new(None),
        }
    }

    /// Current config, loading it from disk on first use
    pub fn load(&self) -> Result<Config> {
        self.read(|cfg| cfg.clone())
    }

    /// Run `f` against the loaded config without persisting
    pub fn read<R>(&self, f: impl FnOnce(&Config) -> R) -> Result<R> {
        let mut guard = self.config.lock();
        let config = self.ensure_loaded(&mut guard)?;
        Ok(f(config))
    }

    /// Load → modify → save under one lock. Save failures are logged, not returned.
    pub fn update<R>(&self, f: impl FnOnce(&mut Config) -> R) -> Result<R> {
        let mut guard = self.config.lock();
        let config = self.ensure_loaded(&mut guard)?;
        let out = f(&mut *config);
        if let Err(e) = write_document(&self.config_path, config) {
            warn!(path = %self.config_path.display(), "failed to save config: {}", e);
        }
        Ok(out)
    }

    pub fn releases_dir(&self) -> &Path {
        &self.releases_dir
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// releases/<version>, or None while no version is recorded
    pub fn current_release_path(&self) -> Result<Option<PathBuf>> {
        self.read(|cfg| {
            if cfg.version.is_empty() {
                None
            } else {
                Some(self.releases_dir.join(&cfg.version))
            }
        })
    }

    /// Create base, releases and logs directories
    pub fn ensure_dirs(&self) -> Result<()> {
        if let Some(base) = self.config_path.parent() {
            std::fs::create_dir_all(base)?;
        }
        std::fs::create_dir_all(&self.releases_dir)?;
        std::fs::create_dir_all(&self.logs_dir)?;
        Ok(())
    }

    fn ensure_loaded<'a>(&self, slot: &'a mut Option<Config>) -> Result<&'a mut Config> {
        if slot.is_none() {
            self.ensure_dirs()?;

            let mut config = match std::fs::read_to_string(&self.config_path) {
                Ok(raw) => decode_lenient(&raw),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
                Err(e) => {
                    warn!(path = %self.config_path.display(), "unreadable config, using defaults: {}", e);
                    Config::default()
                }
            };

            if config.version.is_empty() {
                match seed_local_release(&self.bundled_release_dir, &self.releases_dir) {
                    Ok(Some(version)) => {
                        info!("Seeded version {} from bundled release", version);
                        config.version = version;
                    }
                    Ok(None) => {}
                    Err(e) => debug!("no bundled release seeded: {}", e),
                }
            }

            *slot = Some(config);
        }

        slot.as_mut()
            .ok_or_else(|| HostError::Config("config not loaded".to_string()))
    }
}

fn write_document(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(config)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Decode config.json; malformed fields fall back to their defaults one by one
fn decode_lenient(raw: &str) -> Config {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!("config.json is not valid JSON, using defaults: {}", e);
            return Config::default();
        }
    };
    let Value::Object(map) = value else {
        warn!("config.json is not an object, using defaults");
        return Config::default();
    };

    Config {
        version: field(&map, "version"),
        last_strategy: field(&map, "lastStrategy"),
        last_test_at: field(&map, "lastTestAt"),
        test_results: field(&map, "testResults"),
        best_strategy: field(&map, "bestStrategy"),
        last_test_log: field(&map, "lastTestLog"),
        meta: field(&map, "meta"),
        running: field(&map, "running"),
        test_in_progress: field(&map, "testInProgress"),
    }
}

fn field<T: DeserializeOwned + Default>(map: &Map<String, Value>, key: &str) -> T {
    match map.get(key) {
        None | Some(Value::Null) => T::default(),
        Some(v) => serde_json::from_value(v.clone()).unwrap_or_else(|e| {
            warn!(field = key, "malformed config field, using default: {}", e);
            T::default()
        }),
    }
}

/// Copy the lexicographically greatest `<bundled>/<version>` into the releases store
fn seed_local_release(bundled: &Path, releases_dir: &Path) -> Result<Option<String>> {
    let entries = match std::fs::read_dir(bundled) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut versions = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            versions.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    versions.sort();

    let Some(latest) = versions.pop() else {
        return Ok(None);
    };

    let dst = releases_dir.join(&latest);
    if !dst.exists() {
        copy_dir(&bundled.join(&latest), &dst)?;
    }
    Ok(Some(latest))
}

fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
