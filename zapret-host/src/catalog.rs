//! Strategy discovery inside a release directory

use crate::error::Result;
use std::path::{Path, PathBuf};

/// Harness script, relative to the release root
pub const HARNESS_SCRIPT: &str = "utils/test zapret.ps1";
/// Directory the harness writes test_results_*.txt into
pub const REPORT_DIR: &str = "utils/test results";

const STRATEGY_PREFIX: &str = "general";
const SERVICE_PREFIX: &str = "service";
const SCRIPT_EXTENSION: &str = ".bat";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyFile {
    pub name: String,
    pub path: PathBuf,
}

pub fn is_strategy_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    !lower.starts_with(SERVICE_PREFIX)
        && lower.starts_with(STRATEGY_PREFIX)
        && lower.ends_with(SCRIPT_EXTENSION)
}

/// general*.bat files directly under `release_dir`, sorted by name.
/// `None` (no active release) yields an empty list.
pub fn list_strategies(release_dir: Option<&Path>) -> Result<Vec<StrategyFile>> {
    let Some(dir) = release_dir else {
        return Ok(Vec::new());
    };

    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_strategy_name(&name) {
            found.push(StrategyFile {
                path: dir.join(&name),
                name,
            });
        }
    }

    found.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(found)
}
