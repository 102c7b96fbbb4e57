//! Zapret Host - local manager for the zapret strategy bundle
//!
//! This crate drives a versioned bundle of circumvention strategies:
//! - Release updates from the GitHub "latest" redirect, unpacked per version
//! - Discovery of the general*.bat strategies inside the active release
//! - Supervised runs of the bundled test harness and parsing of its report
//! - One tracked strategy process, stopped along with any orphaned winws.exe

pub mod catalog;
pub mod config;
pub mod error;
pub mod execution;
pub mod models;
pub mod report;
pub mod service;
pub mod settings;
pub mod supervisor;
pub mod updater;

pub use config::ConfigStore;
pub use error::{HostError, Result};
pub use models::{Config, RunningInfo, State, Strategy, TestResult, TestStatus};
pub use service::Service;
pub use settings::{ScriptHost, Settings};
pub use supervisor::{RunPhase, TestOutcome, TestSupervisor};
