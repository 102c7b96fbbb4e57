use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Persisted host state (config.json)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub version: String,
    pub last_strategy: String,
    pub last_test_at: Option<DateTime<Utc>>,
    pub test_results: BTreeMap<String, TestResult>,
    pub best_strategy: String,
    /// Harness log of the last test run
    pub last_test_log: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running: Option<RunningInfo>,
    pub test_in_progress: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Ok,
    #[default]
    Fail,
}

/// Per-strategy analytics line from the test harness report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestResult {
    pub name: String,
    pub http_ok: u32,
    pub http_err: u32,
    pub http_unsup: u32,
    pub ping_ok: u32,
    pub ping_fail: u32,
    pub fail: u32,
    pub blocked: u32,
    pub status: TestStatus,
    pub last_tested_at: Option<DateTime<Utc>>,
}

/// The single foreground strategy process we track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningInfo {
    pub file: String,
    pub pid: i64,
    pub started_at: DateTime<Utc>,
}

/// A general*.bat from the active release with its last known result
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Strategy {
    pub name: String,
    pub file: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TestResult>,
    pub best: bool,
}

/// Snapshot handed to the presentation layer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub config: Config,
    pub strategies: Vec<Strategy>,
    pub latest_tag: String,
    pub has_update: bool,
    pub current_path: String,
    pub last_test_log: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running: Option<RunningInfo>,
}
