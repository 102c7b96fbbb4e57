//! Parser for the analytics emitted by "test zapret.ps1"
//!
//! Two line shapes are recognised, per strategy:
//! - standard: `<name> : HTTP OK: n, ERR: n, UNSUP: n, Ping OK: n, Fail: n`
//! - DPI summary: `<name> : OK: n, FAIL: n, UNSUP: n, BLOCKED: n`
//!
//! plus `Best strategy: <name>`. Everything else is ignored.

use crate::error::{HostError, Result};
use crate::models::{TestResult, TestStatus};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;
use tracing::debug;

const BEST_PREFIX: &str = "Best strategy:";
const SECTION_MARKER: &str = "=== ANALYTICS ===";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedReport {
    pub results: BTreeMap<String, TestResult>,
    pub best: String,
}

fn standard_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(.*) : HTTP OK: (\d+), ERR: (\d+), UNSUP: (\d+), Ping OK: (\d+), Fail: (\d+)")
            .expect("standard report regex")
    })
}

fn dpi_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(.*) : OK: (\d+), FAIL: (\d+), UNSUP: (\d+), BLOCKED: (\d+)")
            .expect("dpi report regex")
    })
}

/// `None` when the counter does not fit, which disqualifies the whole line
fn count(caps: &regex::Captures<'_>, idx: usize) -> Option<u32> {
    caps.get(idx)?.as_str().parse().ok()
}

fn standard_result(caps: &regex::Captures<'_>) -> Option<TestResult> {
    let mut result = TestResult {
        name: caps[1].trim().to_string(),
        http_ok: count(caps, 2)?,
        http_err: count(caps, 3)?,
        http_unsup: count(caps, 4)?,
        ping_ok: count(caps, 5)?,
        ping_fail: count(caps, 6)?,
        ..Default::default()
    };
    result.status = if result.http_err == 0 && result.ping_fail == 0 {
        TestStatus::Ok
    } else {
        TestStatus::Fail
    };
    Some(result)
}

fn dpi_result(caps: &regex::Captures<'_>) -> Option<TestResult> {
    let mut result = TestResult {
        name: caps[1].trim().to_string(),
        http_ok: count(caps, 2)?,
        fail: count(caps, 3)?,
        http_unsup: count(caps, 4)?,
        blocked: count(caps, 5)?,
        ..Default::default()
    };
    result.status = if result.fail == 0 && result.blocked == 0 {
        TestStatus::Ok
    } else {
        TestStatus::Fail
    };
    Some(result)
}

/// Parse harness output. Fails when not a single result line was recognised,
/// which is also how a half-written report looks while polling.
pub fn parse_report(content: &str) -> Result<ParsedReport> {
    let mut report = ParsedReport::default();

    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line == SECTION_MARKER {
            continue;
        }
        if let Some(best) = line.strip_prefix(BEST_PREFIX) {
            report.best = best.trim().to_string();
            continue;
        }

        let parsed = if let Some(caps) = standard_line().captures(line) {
            standard_result(&caps)
        } else if let Some(caps) = dpi_line().captures(line) {
            dpi_result(&caps)
        } else {
            None
        };
        match parsed {
            Some(result) => {
                report.results.insert(result.name.clone(), result);
            }
            None => debug!(line, "skipping unrecognised report line"),
        }
    }

    if report.results.is_empty() {
        return Err(HostError::Parse("no analytics parsed".to_string()));
    }
    Ok(report)
}

/// `test_results_*.txt`, case-insensitive
pub fn is_report_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("test_results_") && lower.ends_with(".txt")
}

/// Newest report file in `dir` (modification time, then name)
pub fn latest_report_file(dir: &Path) -> Result<Option<PathBuf>> {
    let mut latest: Option<(SystemTime, String, PathBuf)> = None;

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_report_file(&name) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let newer = match &latest {
            None => true,
            Some((t, n, _)) => (modified, &name) > (*t, n),
        };
        if newer {
            latest = Some((modified, name, entry.path()));
        }
    }

    Ok(latest.map(|(_, _, path)| path))
}

/// Parse the newest report in `dir`
pub fn parse_latest_report(dir: &Path) -> Result<ParsedReport> {
    let path = latest_report_file(dir)?
        .ok_or_else(|| HostError::NotFound("no test results found".to_string()))?;
    debug!(path = %path.display(), "parsing report");
    let content = std::fs::read_to_string(&path)?;
    parse_report(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_REPORT: &str = "\
Running tests...

=== ANALYTICS ===
general.bat : HTTP OK: 12, ERR: 0, UNSUP: 1, Ping OK: 4, Fail: 0
general (ALT).bat : HTTP OK: 9, ERR: 3, UNSUP: 0, Ping OK: 4, Fail: 0
general (FAKE TLS).bat : HTTP OK: 12, ERR: 0, UNSUP: 0, Ping OK: 2, Fail: 2

Best strategy: general.bat
";

    #[test]
    fn test_nginx_scenario() {
        let parsed = parse_report(
            "nginx : HTTP OK: 5, ERR: 0, UNSUP: 0, Ping OK: 5, Fail: 0\nBest strategy: nginx",
        )
        .unwrap();

        assert_eq!(parsed.results.len(), 1);
        let nginx = &parsed.results["nginx"];
        assert_eq!(nginx.http_ok, 5);
        assert_eq!(nginx.ping_ok, 5);
        assert_eq!(nginx.status, TestStatus::Ok);
        assert_eq!(parsed.best, "nginx");
    }

    #[test]
    fn test_dpi_line_with_failures() {
        let parsed = parse_report("general1 : OK: 2, FAIL: 1, UNSUP: 0, BLOCKED: 1").unwrap();
        let r = &parsed.results["general1"];
        assert_eq!(r.http_ok, 2);
        assert_eq!(r.fail, 1);
        assert_eq!(r.blocked, 1);
        assert_eq!(r.status, TestStatus::Fail);
        assert_eq!(parsed.best, "");
    }

    #[test]
    fn test_dpi_status_rule() {
        let cases = [
            ("a : OK: 3, FAIL: 0, UNSUP: 2, BLOCKED: 0", TestStatus::Ok),
            ("a : OK: 3, FAIL: 1, UNSUP: 0, BLOCKED: 0", TestStatus::Fail),
            ("a : OK: 3, FAIL: 0, UNSUP: 0, BLOCKED: 4", TestStatus::Fail),
        ];
        for (line, expected) in cases {
            assert_eq!(parse_report(line).unwrap().results["a"].status, expected, "{line}");
        }
    }

    #[test]
    fn test_standard_status_rule() {
        let cases = [
            ("s : HTTP OK: 0, ERR: 0, UNSUP: 7, Ping OK: 0, Fail: 0", TestStatus::Ok),
            ("s : HTTP OK: 9, ERR: 1, UNSUP: 0, Ping OK: 9, Fail: 0", TestStatus::Fail),
            ("s : HTTP OK: 9, ERR: 0, UNSUP: 0, Ping OK: 9, Fail: 1", TestStatus::Fail),
        ];
        for (line, expected) in cases {
            assert_eq!(parse_report(line).unwrap().results["s"].status, expected, "{line}");
        }
    }

    #[test]
    fn test_full_report_entries_and_best() {
        let parsed = parse_report(FULL_REPORT).unwrap();
        assert_eq!(parsed.results.len(), 3);
        assert!(parsed.results.contains_key("general (ALT).bat"));
        assert_eq!(parsed.results["general (ALT).bat"].status, TestStatus::Fail);
        assert_eq!(parsed.results["general (FAKE TLS).bat"].ping_fail, 2);
        assert_eq!(parsed.best, "general.bat");
    }

    #[test]
    fn test_last_write_wins() {
        let parsed = parse_report(
            "x : OK: 1, FAIL: 1, UNSUP: 0, BLOCKED: 0\n\
             Best strategy: x\n\
             x : HTTP OK: 4, ERR: 0, UNSUP: 0, Ping OK: 4, Fail: 0\n\
             Best strategy: y",
        )
        .unwrap();
        assert_eq!(parsed.results.len(), 1);
        assert_eq!(parsed.results["x"].http_ok, 4);
        assert_eq!(parsed.results["x"].fail, 0);
        assert_eq!(parsed.best, "y");
    }

    #[test]
    fn test_names_are_trimmed() {
        let parsed = parse_report("   spaced name    : OK: 1, FAIL: 0, UNSUP: 0, BLOCKED: 0").unwrap();
        assert!(parsed.results.contains_key("spaced name"));
    }

    #[test]
    fn test_oversized_counter_discards_line() {
        let parsed = parse_report(
            "general.bat : HTTP OK: 4, ERR: 99999999999, UNSUP: 0, Ping OK: 4, Fail: 0\n\
             general (ALT).bat : OK: 3, FAIL: 0, UNSUP: 0, BLOCKED: 4294967296\n\
             general2.bat : HTTP OK: 4, ERR: 0, UNSUP: 0, Ping OK: 4, Fail: 0",
        )
        .unwrap();
        assert_eq!(parsed.results.len(), 1);
        assert!(parsed.results.contains_key("general2.bat"));

        let only_oversized = "general.bat : HTTP OK: 4, ERR: 99999999999, UNSUP: 0, Ping OK: 4, Fail: 0";
        assert!(matches!(parse_report(only_oversized), Err(HostError::Parse(_))));
    }

    #[test]
    fn test_no_result_lines_is_parse_error() {
        for input in ["", "\n\n", "=== ANALYTICS ===\nBest strategy: general.bat\n", "garbage"] {
            assert!(matches!(parse_report(input), Err(HostError::Parse(_))), "{input:?}");
        }
    }

    #[test]
    fn test_report_file_names() {
        assert!(is_report_file("test_results_2024-01-01.txt"));
        assert!(is_report_file("TEST_RESULTS_x.TXT"));
        assert!(!is_report_file("test_results.log"));
        assert!(!is_report_file("results_1.txt"));
    }

    #[test]
    fn test_newest_report_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let old = tmp.path().join("test_results_old.txt");
        let new = tmp.path().join("test_results_new.txt");
        std::fs::write(&old, "old : OK: 1, FAIL: 0, UNSUP: 0, BLOCKED: 0").unwrap();
        std::fs::write(&new, "new : OK: 1, FAIL: 0, UNSUP: 0, BLOCKED: 0").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        let past = SystemTime::now() - std::time::Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(past)
            .unwrap();

        let parsed = parse_latest_report(tmp.path()).unwrap();
        assert!(parsed.results.contains_key("new"));
        assert!(!parsed.results.contains_key("old"));
    }

    #[test]
    fn test_empty_report_dir_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(parse_latest_report(tmp.path()), Err(HostError::NotFound(_))));
    }
}
