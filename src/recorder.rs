/// Sample file: one decimal found time per line, appended in attempt order.
///
/// The file is created (or truncated) when the run starts and held under an
/// exclusive advisory lock until the recorder is dropped, so two probes can't
/// interleave samples in the same file.
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Running min/max/mean over recorded samples.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SampleStats {
    pub count: u64,
    pub min: Option<u64>,
    pub max: Option<u64>,
    sum: u128,
}

impl SampleStats {
    pub fn push(&mut self, value: u64) {
        self.count += 1;
        self.sum += u128::from(value);
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum as f64 / self.count as f64)
        }
    }
}

/// Errors that can occur while writing samples.
#[derive(Debug)]
pub enum RecorderError {
    /// Failed to create or truncate the sample file.
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Another process holds the sample file.
    Locked {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to append a sample.
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for RecorderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecorderError::Create { path, source } => {
                write!(f, "failed to create sample file {}: {}", path.display(), source)
            }
            RecorderError::Locked { path, source } => {
                write!(
                    f,
                    "sample file {} is in use by another process: {}",
                    path.display(),
                    source
                )
            }
            RecorderError::Write { path, source } => {
                write!(f, "failed to write sample to {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for RecorderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecorderError::Create { source, .. } => Some(source),
            RecorderError::Locked { source, .. } => Some(source),
            RecorderError::Write { source, .. } => Some(source),
        }
    }
}

/// Exclusively owned, append-only sample file.
#[derive(Debug)]
pub struct SampleFile {
    path: PathBuf,
    file: File,
    stats: SampleStats,
}

impl SampleFile {
    /// Open `path` for writing, lock it, then truncate it.
    ///
    /// Truncation happens after the lock is taken, so a file held by a
    /// running probe is never wiped.
    pub fn create(path: &Path) -> Result<Self, RecorderError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| RecorderError::Create {
                path: path.to_path_buf(),
                source: e,
            })?;

        file.try_lock_exclusive()
            .map_err(|e| RecorderError::Locked {
                path: path.to_path_buf(),
                source: e,
            })?;

        file.set_len(0).map_err(|e| RecorderError::Create {
            path: path.to_path_buf(),
            source: e,
        })?;

        tracing::debug!(path = %path.display(), "sample file opened");
        Ok(Self {
            path: path.to_path_buf(),
            file,
            stats: SampleStats::default(),
        })
    }

    /// Append one sample as a decimal line and flush it to the OS.
    pub fn append(&mut self, found_time: u64) -> Result<(), RecorderError> {
        let line = format!("{found_time}\n");
        self.file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.flush())
            .map_err(|e| RecorderError::Write {
                path: self.path.clone(),
                source: e,
            })?;
        self.stats.push(found_time);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> SampleStats {
        self.stats
    }
}
