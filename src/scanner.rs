/// Single scan attempt lifecycle: spawn the scanner subprocess, wait for its
/// init marker, wait for it to finish, and hand back everything it printed.
///
/// Both waits are bounded read loops over the child's stdout and stderr.
/// On deadline expiry or shutdown the child's process group is killed.
use crate::config::ProbeConfig;
use crate::output::find_marker;
use crate::signals::Shutdown;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::Instant;

/// How long to wait for a killed child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

const CHUNK_SIZE: usize = 1024;

/// `from + timeout`, saturating to a far-future instant instead of overflowing.
fn deadline_after(from: Instant, timeout: Duration) -> Instant {
    from.checked_add(timeout)
        .unwrap_or_else(|| from + Duration::from_secs(100 * 365 * 24 * 60 * 60))
}

/// Everything needed to run one scan.
#[derive(Debug, Clone)]
pub struct ScanSpec {
    pub command: String,
    pub args: Vec<String>,
    pub init_marker: String,
    pub init_timeout: Duration,
    pub scan_timeout: Duration,
}

impl ScanSpec {
    pub fn from_config(config: &ProbeConfig) -> Self {
        Self {
            command: config.scanner.command.clone(),
            args: config.scanner_args(),
            init_marker: config.markers.init.clone(),
            init_timeout: config.init_timeout(),
            scan_timeout: config.scan_timeout(),
        }
    }
}

/// Output and exit details of a scan that ran (to completion or not).
#[derive(Debug)]
pub struct ScanCapture {
    /// stdout and stderr, interleaved in arrival order.
    pub output: Vec<u8>,
    /// Process exit code (None if killed by signal or never reaped).
    pub exit_code: Option<i32>,
    /// Wall-clock time since spawn.
    pub elapsed: Duration,
    /// Child PID (for logging/diagnostics).
    pub pid: u32,
}

impl ScanCapture {
    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output).trim().to_string()
    }
}

/// How a scan attempt ended, before its output is interpreted.
#[derive(Debug)]
pub enum ScanOutcome {
    /// The init marker appeared and the scanner closed its output in time.
    Finished(ScanCapture),
    /// The init marker did not appear before the init deadline.
    InitTimeout(ScanCapture),
    /// The scanner closed its output without ever printing the init marker.
    ExitedBeforeInit(ScanCapture),
    /// The scanner initialized but did not finish before the scan deadline.
    ScanTimeout(ScanCapture),
    /// Shutdown was requested while the scan was in flight.
    Interrupted,
}

/// Errors that can occur during scan execution.
#[derive(Debug)]
pub enum ScanError {
    /// Failed to spawn the scanner subprocess.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// Failed to read from child stdout/stderr or wait on it.
    Io { source: std::io::Error },
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::Spawn { command, source } => {
                write!(f, "failed to spawn scanner {command}: {source}")
            }
            ScanError::Io { source } => {
                write!(f, "I/O error during scan: {}", source)
            }
        }
    }
}

impl std::error::Error for ScanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScanError::Spawn { source, .. } => Some(source),
            ScanError::Io { source } => Some(source),
        }
    }
}

/// The child's output streams plus everything read from them so far.
struct OutputPipes {
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    captured: Vec<u8>,
}

impl OutputPipes {
    /// Read one chunk from whichever stream is ready.
    ///
    /// Returns `false` once both streams have hit end-of-output.
    async fn read_chunk(&mut self) -> std::io::Result<bool> {
        let mut out_buf = [0u8; CHUNK_SIZE];
        let mut err_buf = [0u8; CHUNK_SIZE];
        let (n, from_stdout) = match (self.stdout.as_mut(), self.stderr.as_mut()) {
            (None, None) => return Ok(false),
            (Some(out), None) => (out.read(&mut out_buf).await?, true),
            (None, Some(err)) => (err.read(&mut err_buf).await?, false),
            (Some(out), Some(err)) => tokio::select! {
                r = out.read(&mut out_buf) => (r?, true),
                r = err.read(&mut err_buf) => (r?, false),
            },
        };

        if n == 0 {
            if from_stdout {
                self.stdout = None;
            } else {
                self.stderr = None;
            }
        } else if from_stdout {
            self.captured.extend_from_slice(&out_buf[..n]);
        } else {
            self.captured.extend_from_slice(&err_buf[..n]);
        }
        Ok(true)
    }
}

/// Result of one bounded read loop.
#[derive(Debug, PartialEq, Eq)]
enum Wait {
    /// The stop condition matched.
    Matched,
    /// Both streams closed first.
    Eof,
    TimedOut,
    Interrupted,
}

/// Read until `stop` matches the captured bytes, output ends, the deadline
/// passes, or shutdown is requested.
async fn read_until<F>(
    pipes: &mut OutputPipes,
    deadline: Instant,
    shutdown: &mut Shutdown,
    mut stop: F,
) -> Result<Wait, ScanError>
where
    F: FnMut(&[u8]) -> bool,
{
    loop {
        if stop(&pipes.captured) {
            return Ok(Wait::Matched);
        }
        if shutdown.is_requested() {
            return Ok(Wait::Interrupted);
        }
        tokio::select! {
            read = tokio::time::timeout_at(deadline, pipes.read_chunk()) => match read {
                Err(_) => return Ok(Wait::TimedOut),
                Ok(Ok(true)) => continue,
                Ok(Ok(false)) => return Ok(Wait::Eof),
                Ok(Err(e)) => return Err(ScanError::Io { source: e }),
            },
            () = shutdown.requested() => return Ok(Wait::Interrupted),
        }
    }
}

/// Kill the scanner's process group, then the child itself, and reap it.
async fn kill_scanner(child: &mut Child, pid: u32) -> Option<i32> {
    if pid > 0 {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::warn!(pid, error = %e, "failed to signal scanner process group");
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(pid, error = %e, "failed to kill scanner");
    }
    match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => {
            tracing::warn!(pid, error = %e, "failed to reap killed scanner");
            None
        }
        Err(_) => {
            tracing::warn!(pid, "killed scanner did not exit in time");
            None
        }
    }
}

/// Spawn the scanner, run both bounded waits, and return how it ended.
///
/// The subprocess is spawned in its own process group (via `process_group(0)`)
/// so a timeout can kill everything it started, including a `sudo` wrapper's
/// children.
pub async fn run_scan(spec: &ScanSpec, shutdown: &mut Shutdown) -> Result<ScanOutcome, ScanError> {
    tracing::debug!(
        command = %spec.command,
        args = ?spec.args,
        "spawning scanner"
    );

    let start = Instant::now();

    let mut child = Command::new(&spec.command)
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0) // New process group for clean kill
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ScanError::Spawn {
            command: spec.command.clone(),
            source: e,
        })?;

    let pid = child.id().unwrap_or(0);
    tracing::debug!(pid, "scanner subprocess started");

    let mut pipes = OutputPipes {
        stdout: child.stdout.take(),
        stderr: child.stderr.take(),
        captured: Vec::new(),
    };

    let init_deadline = deadline_after(start, spec.init_timeout);
    let marker = spec.init_marker.as_str();
    let init = read_until(&mut pipes, init_deadline, shutdown, |bytes| {
        find_marker(bytes, marker).is_some()
    })
    .await?;

    match init {
        Wait::Matched => {
            tracing::debug!(pid, "scanner init successful");
        }
        Wait::Eof => {
            let exit_code = match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => status.code(),
                Ok(Err(e)) => return Err(ScanError::Io { source: e }),
                Err(_) => kill_scanner(&mut child, pid).await,
            };
            return Ok(ScanOutcome::ExitedBeforeInit(ScanCapture {
                output: pipes.captured,
                exit_code,
                elapsed: start.elapsed(),
                pid,
            }));
        }
        Wait::TimedOut => {
            let exit_code = kill_scanner(&mut child, pid).await;
            return Ok(ScanOutcome::InitTimeout(ScanCapture {
                output: pipes.captured,
                exit_code,
                elapsed: start.elapsed(),
                pid,
            }));
        }
        Wait::Interrupted => {
            kill_scanner(&mut child, pid).await;
            return Ok(ScanOutcome::Interrupted);
        }
    }

    let scan_deadline = deadline_after(Instant::now(), spec.scan_timeout);
    let scan = read_until(&mut pipes, scan_deadline, shutdown, |_| false).await?;

    match scan {
        Wait::Eof => {}
        Wait::Interrupted => {
            kill_scanner(&mut child, pid).await;
            return Ok(ScanOutcome::Interrupted);
        }
        // `stop` never matches, so only a deadline remains.
        Wait::TimedOut | Wait::Matched => {
            let exit_code = kill_scanner(&mut child, pid).await;
            return Ok(ScanOutcome::ScanTimeout(ScanCapture {
                output: pipes.captured,
                exit_code,
                elapsed: start.elapsed(),
                pid,
            }));
        }
    }

    // Output is closed; the process itself must still exit before the deadline.
    let exit_code = match tokio::time::timeout_at(scan_deadline, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => return Err(ScanError::Io { source: e }),
        Err(_) => {
            let exit_code = kill_scanner(&mut child, pid).await;
            return Ok(ScanOutcome::ScanTimeout(ScanCapture {
                output: pipes.captured,
                exit_code,
                elapsed: start.elapsed(),
                pid,
            }));
        }
    };

    let elapsed = start.elapsed();
    tracing::debug!(
        pid,
        exit_code = ?exit_code,
        output_bytes = pipes.captured.len(),
        elapsed_ms = elapsed.as_millis() as u64,
        "scanner finished"
    );

    Ok(ScanOutcome::Finished(ScanCapture {
        output: pipes.captured,
        exit_code,
        elapsed,
        pid,
    }))
}
