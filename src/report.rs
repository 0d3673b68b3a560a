/// Run report: a JSON summary of the session written when the run ends.
///
/// Uses atomic write pattern: write to temp file then rename.
use crate::recorder::SampleStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// How the run ended, as written to the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportOutcome {
    Completed,
    InitTimeout,
    ScanTimeout,
    ScannerError,
    Interrupted,
    Failed,
}

/// The JSON payload written to the report file.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub pid: u32,
    pub outcome: ReportOutcome,
    /// Diagnostic text for aborted or failed runs.
    pub detail: Option<String>,
    pub budget: u32,
    pub attempts: u32,
    pub recorded: u64,
    pub skipped: u32,
    pub output_file: String,
    pub min_found_time: Option<u64>,
    pub max_found_time: Option<u64>,
    pub mean_found_time: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Fill in sample statistics and stamp the finish time.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        outcome: ReportOutcome,
        detail: Option<String>,
        budget: u32,
        attempts: u32,
        skipped: u32,
        output_file: &Path,
        stats: SampleStats,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            pid: std::process::id(),
            outcome,
            detail,
            budget,
            attempts,
            recorded: stats.count,
            skipped,
            output_file: output_file.display().to_string(),
            min_found_time: stats.min,
            max_found_time: stats.max,
            mean_found_time: stats.mean(),
            started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Errors that can occur while writing the report.
#[derive(Debug)]
pub enum ReportError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ReportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportError::Serialize { source } => {
                write!(f, "failed to serialize run report: {source}")
            }
            ReportError::Write { path, source } => {
                write!(f, "failed to write {}: {}", path.display(), source)
            }
            ReportError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} to {}: {}",
                    from.display(),
                    to.display(),
                    source
                )
            }
        }
    }
}

impl std::error::Error for ReportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReportError::Serialize { source } => Some(source),
            ReportError::Write { source, .. } => Some(source),
            ReportError::Rename { source, .. } => Some(source),
        }
    }
}

/// Atomically write the report to `path`.
///
/// Writes to a temporary file in the same directory, then renames
/// to ensure readers never see a partial write.
pub fn write_report(path: &Path, report: &RunReport) -> Result<(), ReportError> {
    let json =
        serde_json::to_string_pretty(report).map_err(|e| ReportError::Serialize { source: e })?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let tmp_path = dir.join(format!(".probe-report.tmp.{}", std::process::id()));

    std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| ReportError::Write {
        path: tmp_path.clone(),
        source: e,
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| ReportError::Rename {
        from: tmp_path,
        to: path.to_path_buf(),
        source: e,
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report(outcome: ReportOutcome) -> RunReport {
        let mut stats = SampleStats::default();
        stats.push(100);
        stats.push(300);
        RunReport::new(
            outcome,
            None,
            5,
            6,
            4,
            Path::new("output.txt"),
            stats,
            Utc::now(),
        )
    }

    #[test]
    fn test_report_fields_from_stats() {
        let report = sample_report(ReportOutcome::Completed);
        assert_eq!(report.recorded, 2);
        assert_eq!(report.min_found_time, Some(100));
        assert_eq!(report.max_found_time, Some(300));
        assert_eq!(report.mean_found_time, Some(200.0));
        assert_eq!(report.pid, std::process::id());
        assert!(report.finished_at >= report.started_at);
    }

    #[test]
    fn test_write_report_round_trips_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let mut report = sample_report(ReportOutcome::ScanTimeout);
        report.detail = Some("scanner timeout".to_string());

        write_report(&path, &report).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["outcome"], "scan_timeout");
        assert_eq!(value["detail"], "scanner timeout");
        assert_eq!(value["budget"], 5);
        assert_eq!(value["attempts"], 6);
        assert_eq!(value["skipped"], 4);
        assert_eq!(value["output_file"], "output.txt");
    }

    #[test]
    fn test_write_report_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        write_report(&path, &sample_report(ReportOutcome::Completed)).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("report.json")]);
    }

    #[test]
    fn test_empty_stats_serialize_as_null() {
        let report = RunReport::new(
            ReportOutcome::InitTimeout,
            Some("scanner failed to initialize".to_string()),
            1,
            1,
            0,
            Path::new("output.txt"),
            SampleStats::default(),
            Utc::now(),
        );
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["outcome"], "init_timeout");
        assert!(value["min_found_time"].is_null());
        assert!(value["mean_found_time"].is_null());
        assert_eq!(value["recorded"], 0);
    }

    #[test]
    fn test_write_report_bad_dir() {
        let err = write_report(
            Path::new("/nonexistent-dir/impossible/report.json"),
            &sample_report(ReportOutcome::Failed),
        )
        .unwrap_err();
        assert!(matches!(err, ReportError::Write { .. }));
    }
}
