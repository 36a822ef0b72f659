//! Persistence of finished reports, keyed by the serial of the cable tested.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::StoreError;
use crate::report::TestReport;

pub trait ReportStore {
    fn store(&mut self, cable_id: &str, report: &TestReport) -> Result<(), StoreError>;
}

#[derive(Serialize)]
struct StoredReport<'a> {
    cable_id: &'a str,
    stored_at: DateTime<Utc>,
    report: &'a TestReport,
}

/// Appends one JSON object per report to a file.
#[derive(Debug, Clone)]
pub struct JsonLinesReportStore {
    path: PathBuf,
}

impl JsonLinesReportStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReportStore for JsonLinesReportStore {
    fn store(&mut self, cable_id: &str, report: &TestReport) -> Result<(), StoreError> {
        let entry = StoredReport {
            cable_id,
            stored_at: Utc::now(),
            report,
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        info!(cable_id, path = %self.path.display(), passed = report.overall_passed, "report stored");
        Ok(())
    }
}

/// Keeps reports in memory; used where nothing should touch the disk.
#[derive(Debug, Default)]
pub struct MemoryReportStore {
    pub reports: Vec<(String, TestReport)>,
}

impl ReportStore for MemoryReportStore {
    fn store(&mut self, cable_id: &str, report: &TestReport) -> Result<(), StoreError> {
        self.reports.push((cable_id.to_string(), report.clone()));
        Ok(())
    }
}
