//! Report and exception handlers.
//!
//! Handlers run after every client run: report handlers on success,
//! exception handlers on failure. They are best-effort. A failing handler is
//! logged and the remaining handlers still run.

use crate::config::HandlerConfig;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use depot::{Node, RunListItem};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// What happened during one client run.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub node_name: Option<String>,
    pub run_list: Vec<RunListItem>,
    /// The node as the run left it, absent if the run failed before building it
    pub node: Option<Node>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub success: bool,
    /// Error message of a failed run
    pub exception: Option<String>,
    /// Cache entries written by the sync
    pub updated_files: usize,
    /// Resources the converger declared
    pub resources: usize,
}

impl RunStatus {
    pub fn start() -> Self {
        Self {
            node_name: None,
            run_list: Vec::new(),
            node: None,
            start_time: Utc::now(),
            end_time: None,
            success: false,
            exception: None,
            updated_files: 0,
            resources: 0,
        }
    }

    pub fn finish(&mut self) {
        self.end_time = Some(Utc::now());
        self.success = true;
    }

    pub fn fail(&mut self, error: &Error) {
        self.end_time = Some(Utc::now());
        self.success = false;
        self.exception = Some(error.to_string());
    }

    /// Seconds from start to end, or to now while the run is in progress.
    pub fn elapsed_secs(&self) -> f64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).num_milliseconds() as f64 / 1000.0
    }
}

/// Called after a successful run.
pub trait ReportHandler {
    fn name(&self) -> &str;
    fn report(&self, status: &RunStatus) -> Result<()>;
}

/// Called after a failed run, with the error that ended it.
pub trait ExceptionHandler {
    fn name(&self) -> &str;
    fn report_failure(&self, status: &RunStatus, error: &Error) -> Result<()>;
}

// ============================================================================
// Built-in handlers
// ============================================================================

/// Logs a one-line summary.
pub struct LogReport;

impl ReportHandler for LogReport {
    fn name(&self) -> &str {
        "log"
    }

    fn report(&self, status: &RunStatus) -> Result<()> {
        log::info!(
            "Run for {} completed in {:.1}s: {} file(s) updated, {} resource(s)",
            status.node_name.as_deref().unwrap_or("<unknown>"),
            status.elapsed_secs(),
            status.updated_files,
            status.resources
        );
        Ok(())
    }
}

impl ExceptionHandler for LogReport {
    fn name(&self) -> &str {
        "log"
    }

    fn report_failure(&self, status: &RunStatus, error: &Error) -> Result<()> {
        log::error!(
            "Run for {} failed after {:.1}s: {error}",
            status.node_name.as_deref().unwrap_or("<unknown>"),
            status.elapsed_secs()
        );
        Ok(())
    }
}

/// Writes `run-<timestamp>.json` into a directory.
pub struct JsonFileReport {
    dir: PathBuf,
}

impl JsonFileReport {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write(&self, status: &RunStatus) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        let stamp = status.end_time.unwrap_or(status.start_time);
        let path = self
            .dir
            .join(format!("run-{}.json", stamp.format("%Y%m%d%H%M%S%3f")));
        let json = serde_json::to_string_pretty(status)?;
        std::fs::write(&path, json).map_err(|e| Error::io(&path, e))?;
        log::debug!("Wrote run report {}", path.display());
        Ok(path)
    }
}

impl ReportHandler for JsonFileReport {
    fn name(&self) -> &str {
        "json_file"
    }

    fn report(&self, status: &RunStatus) -> Result<()> {
        self.write(status).map(|_| ())
    }
}

impl ExceptionHandler for JsonFileReport {
    fn name(&self) -> &str {
        "json_file"
    }

    fn report_failure(&self, status: &RunStatus, _error: &Error) -> Result<()> {
        self.write(status).map(|_| ())
    }
}

// ============================================================================
// Handler set
// ============================================================================

/// Ordered report and exception handlers.
#[derive(Default)]
pub struct HandlerSet {
    report: Vec<Box<dyn ReportHandler>>,
    exception: Vec<Box<dyn ExceptionHandler>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in handlers the configuration switches on.
    pub fn from_config(config: &HandlerConfig, report_dir: Option<PathBuf>) -> Self {
        let mut set = Self::new();
        if config.log {
            set.add_report(LogReport);
            set.add_exception(LogReport);
        }
        if let Some(dir) = report_dir {
            set.add_report(JsonFileReport::new(&dir));
            set.add_exception(JsonFileReport::new(dir));
        }
        set
    }

    pub fn add_report(&mut self, handler: impl ReportHandler + 'static) {
        self.report.push(Box::new(handler));
    }

    pub fn add_exception(&mut self, handler: impl ExceptionHandler + 'static) {
        self.exception.push(Box::new(handler));
    }

    pub fn is_empty(&self) -> bool {
        self.report.is_empty() && self.exception.is_empty()
    }

    /// Run every report handler. Returns the names of the ones that failed.
    pub fn run_report(&self, status: &RunStatus) -> Vec<String> {
        let mut failed = Vec::new();
        for handler in &self.report {
            if let Err(e) = handler.report(status) {
                log::warn!("Report handler {} failed: {e}", handler.name());
                failed.push(handler.name().to_string());
            }
        }
        failed
    }

    /// Run every exception handler. Returns the names of the ones that failed.
    pub fn run_exception(&self, status: &RunStatus, error: &Error) -> Vec<String> {
        let mut failed = Vec::new();
        for handler in &self.exception {
            if let Err(e) = handler.report_failure(status, error) {
                log::warn!("Exception handler {} failed: {e}", handler.name());
                failed.push(handler.name().to_string());
            }
        }
        failed
    }
}
