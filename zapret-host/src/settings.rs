//! Host settings: filesystem layout, remote endpoints, process visibility
//!
//! Handles:
//! - Per-user base directory (config.json, releases/, logs/)
//! - Release endpoints (overridable for mirrors and tests)
//! - RUN_PROCESS_HIDDEN toggle for spawned console windows

use crate::error::{HostError, Result};
use std::path::PathBuf;
use tracing::debug;

pub const DEFAULT_LATEST_URL: &str =
    "https://github.com/Flowseal/zapret-discord-youtube/releases/latest";
pub const DEFAULT_DOWNLOAD_TEMPLATE: &str =
    "https://github.com/Flowseal/zapret-discord-youtube/releases/download/{tag}/zapret-discord-youtube-{tag}.zip";
/// Image name of the strategy runtime spawned by every general*.bat
pub const STRATEGY_IMAGE: &str = "winws.exe";

const APP_DIR_NAME: &str = "ZapretUI";
const HIDDEN_ENV: &str = "RUN_PROCESS_HIDDEN";

/// How scripts from the bundle get executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptHost {
    /// Windows: PowerShell drives .ps1 files and Start-Process for .bat files
    PowerShell,
    /// Unix development hosts: scripts are handed to `sh`
    Shell,
}

impl Default for ScriptHost {
    fn default() -> Self {
        if cfg!(windows) {
            ScriptHost::PowerShell
        } else {
            ScriptHost::Shell
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub base_dir: PathBuf,
    /// Optional `./release/<version>` tree shipped next to the binary
    pub bundled_release_dir: PathBuf,
    pub latest_url: String,
    /// `{tag}` is substituted with the release tag
    pub download_template: String,
    pub strategy_image: String,
    pub hide_processes: bool,
    pub script_host: ScriptHost,
}

impl Settings {
    /// Settings rooted at an explicit base directory, everything else default
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let bundled_release_dir = std::env::current_dir()
            .map(|cwd| cwd.join("release"))
            .unwrap_or_else(|_| PathBuf::from("release"));

        Self {
            base_dir: base_dir.into(),
            bundled_release_dir,
            latest_url: DEFAULT_LATEST_URL.to_string(),
            download_template: DEFAULT_DOWNLOAD_TEMPLATE.to_string(),
            strategy_image: STRATEGY_IMAGE.to_string(),
            hide_processes: false,
            script_host: ScriptHost::default(),
        }
    }

    /// Build settings from the OS layout plus environment overrides
    pub fn from_env() -> Result<Self> {
        let base_dir = match std::env::var("ZAPRET_HOME") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir.trim()),
            _ => Self::default_base_dir()?,
        };

        let mut settings = Self::with_base_dir(base_dir);

        if let Ok(url) = std::env::var("ZAPRET_LATEST_URL") {
            settings.latest_url = url;
        }
        if let Ok(template) = std::env::var("ZAPRET_DOWNLOAD_TEMPLATE") {
            settings.download_template = template;
        }
        if let Ok(raw) = std::env::var(HIDDEN_ENV) {
            if let Some(hidden) = parse_toggle(&raw) {
                settings.hide_processes = hidden;
            }
        }

        debug!(
            base_dir = %settings.base_dir.display(),
            hidden = settings.hide_processes,
            "settings resolved"
        );
        Ok(settings)
    }

    fn default_base_dir() -> Result<PathBuf> {
        if let Some(mut dir) = dirs::cache_dir() {
            dir.push(APP_DIR_NAME);
            return Ok(dir);
        }
        let mut home = dirs::home_dir()
            .ok_or_else(|| HostError::Config("could not find a home directory".to_string()))?;
        home.push("AppData");
        home.push("Local");
        home.push(APP_DIR_NAME);
        Ok(home)
    }

    pub fn config_path(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.base_dir.join("releases")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn download_url(&self, tag: &str) -> String {
        self.download_template.replace("{tag}", tag)
    }
}

/// Parse the literal values accepted by RUN_PROCESS_HIDDEN
pub fn parse_toggle(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "0" | "false" | "no" | "off" => Some(false),
        "1" | "true" | "yes" | "on" => Some(true),
        _ => None,
    }
}
