/// The supervised scan loop.
///
/// For every slot in the budget: sleep a random sub-second delay, run one
/// scan, classify its output, and either record the found time, skip the
/// attempt, or abort the whole run. The budget is counted down to zero
/// inclusive, so a budget of N runs N + 1 attempts.
use crate::config::{MarkerConfig, ProbeConfig};
use crate::output::{classify, has_error_token, Classification, SkipReason};
use crate::recorder::{RecorderError, SampleFile, SampleStats};
use crate::scanner::{run_scan, ScanError, ScanOutcome, ScanSpec};
use crate::signals::Shutdown;
use rand::Rng;
use std::path::Path;
use std::time::Duration;

/// Why a run was aborted. Every variant ends the run immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The scanner never printed its init marker.
    InitTimeout,
    /// The scanner initialized but never finished.
    ScanTimeout,
    /// The scanner printed the error marker; carries its output.
    ScannerError { output: String },
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::InitTimeout => write!(f, "scanner failed to initialize"),
            AbortReason::ScanTimeout => write!(f, "scanner timeout"),
            AbortReason::ScannerError { output } => write!(f, "scanner error: {output}"),
        }
    }
}

/// Result of a single attempt, dispatched on by the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Recorded(u64),
    Skip(SkipReason),
    Fatal(AbortReason),
    Interrupted,
}

/// How a run session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Aborted(AbortReason),
    Interrupted,
}

/// Infrastructure failures that stop a run.
#[derive(Debug)]
pub enum RunError {
    Scan(ScanError),
    Recorder(RecorderError),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Scan(e) => write!(f, "{e}"),
            RunError::Recorder(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Scan(e) => Some(e),
            RunError::Recorder(e) => Some(e),
        }
    }
}

impl From<ScanError> for RunError {
    fn from(e: ScanError) -> Self {
        RunError::Scan(e)
    }
}

impl From<RecorderError> for RunError {
    fn from(e: RecorderError) -> Self {
        RunError::Recorder(e)
    }
}

/// Map a finished scan to an attempt outcome.
pub fn interpret(outcome: ScanOutcome, markers: &MarkerConfig) -> AttemptOutcome {
    match outcome {
        ScanOutcome::Finished(capture) => match classify(&capture.output, markers) {
            Classification::FoundTime(found_time) => AttemptOutcome::Recorded(found_time),
            Classification::Malformed(reason) => {
                tracing::debug!(output = %capture.output_text(), "unexpected scanner output");
                AttemptOutcome::Skip(reason)
            }
            Classification::ScannerError => AttemptOutcome::Fatal(AbortReason::ScannerError {
                output: capture.output_text(),
            }),
        },
        ScanOutcome::ExitedBeforeInit(capture) => {
            if has_error_token(&capture.output, &markers.error) {
                AttemptOutcome::Fatal(AbortReason::ScannerError {
                    output: capture.output_text(),
                })
            } else {
                tracing::debug!(
                    exit_code = ?capture.exit_code,
                    output = %capture.output_text(),
                    "scanner exited before init marker"
                );
                AttemptOutcome::Fatal(AbortReason::InitTimeout)
            }
        }
        ScanOutcome::InitTimeout(capture) => {
            tracing::debug!(
                pid = capture.pid,
                output = %capture.output_text(),
                "no init marker before deadline"
            );
            AttemptOutcome::Fatal(AbortReason::InitTimeout)
        }
        ScanOutcome::ScanTimeout(capture) => {
            tracing::debug!(
                pid = capture.pid,
                elapsed_secs = capture.elapsed.as_secs(),
                "scanner still running at deadline"
            );
            AttemptOutcome::Fatal(AbortReason::ScanTimeout)
        }
        ScanOutcome::Interrupted => AttemptOutcome::Interrupted,
    }
}

/// Uniform random delay in `[0, max)`.
fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    max.mul_f64(rand::rng().random::<f64>())
}

/// One execution of the supervisor, from the first attempt until the
/// budget runs out or an attempt aborts.
#[derive(Debug)]
pub struct RunSession {
    budget: u32,
    attempts: u32,
    skipped: u32,
    max_delay: Duration,
    spec: ScanSpec,
    markers: MarkerConfig,
    samples: SampleFile,
}

impl RunSession {
    /// Create the sample file and resolve the scan settings.
    pub fn open(config: &ProbeConfig) -> Result<Self, RunError> {
        let samples = SampleFile::create(&config.session.output_file)?;
        Ok(Self {
            budget: config.session.iterations,
            attempts: 0,
            skipped: 0,
            max_delay: config.max_delay(),
            spec: ScanSpec::from_config(config),
            markers: config.markers.clone(),
            samples,
        })
    }

    /// Run attempts until the budget is spent, an attempt aborts, or
    /// shutdown is requested.
    pub async fn run(&mut self, shutdown: &mut Shutdown) -> Result<RunOutcome, RunError> {
        tracing::info!(
            iterations = self.budget,
            output = %self.samples.path().display(),
            "running scan loop"
        );

        for remaining in (0..=self.budget).rev() {
            let iteration = self.budget - remaining + 1;
            if shutdown.is_requested() {
                return Ok(RunOutcome::Interrupted);
            }

            let delay = jitter(self.max_delay);
            tracing::debug!(iteration, delay_ms = delay.as_millis() as u64, "waiting before scan");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown.requested() => return Ok(RunOutcome::Interrupted),
            }

            let scan = run_scan(&self.spec, shutdown).await?;
            self.attempts += 1;

            match interpret(scan, &self.markers) {
                AttemptOutcome::Recorded(found_time) => {
                    self.samples.append(found_time)?;
                    tracing::info!(iteration, found_time, "found target");
                }
                AttemptOutcome::Skip(reason) => {
                    self.skipped += 1;
                    tracing::warn!(
                        iteration,
                        %reason,
                        "unexpected scanner output, no sample recorded"
                    );
                }
                AttemptOutcome::Fatal(reason) => {
                    tracing::error!(iteration, %reason, "aborting run");
                    return Ok(RunOutcome::Aborted(reason));
                }
                AttemptOutcome::Interrupted => {
                    tracing::warn!(iteration, "scan interrupted");
                    return Ok(RunOutcome::Interrupted);
                }
            }
        }

        Ok(RunOutcome::Completed)
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    /// Attempts that ran a scan, whatever their outcome.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn skipped(&self) -> u32 {
        self.skipped
    }

    pub fn stats(&self) -> SampleStats {
        self.samples.stats()
    }

    pub fn output_path(&self) -> &Path {
        self.samples.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenizeFrom;
    use crate::scanner::ScanCapture;
    use crate::signals::shutdown_pair;
    use std::path::PathBuf;

    /// Config driving `sh -c <script>` as the scanner, with short deadlines.
    fn sh_config(output: PathBuf, iterations: u32, script: &str) -> ProbeConfig {
        let mut config = ProbeConfig::default();
        config.session.iterations = iterations;
        config.session.output_file = output;
        config.session.max_delay_ms = 0;
        config.scanner.command = "sh".to_string();
        config.scanner.args = vec!["-c".to_string(), script.to_string()];
        config.timeouts.init_secs = 1;
        config.timeouts.scan_secs = 1;
        config
    }

    fn read_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn capture(text: &str) -> ScanCapture {
        ScanCapture {
            output: text.as_bytes().to_vec(),
            exit_code: Some(0),
            elapsed: Duration::from_millis(10),
            pid: 1,
        }
    }

    #[test]
    fn test_interpret_seven_tokens_records() {
        let outcome = interpret(
            ScanOutcome::Finished(capture("Using hci0\ntarget bdaddr found after 42 ms\n")),
            &MarkerConfig::default(),
        );
        assert_eq!(outcome, AttemptOutcome::Recorded(42));
    }

    #[test]
    fn test_interpret_short_output_skips() {
        let outcome = interpret(
            ScanOutcome::Finished(capture("Using hci0 found 42 ms")),
            &MarkerConfig::default(),
        );
        assert!(matches!(outcome, AttemptOutcome::Skip(SkipReason::TokenCount { found: 4, .. })));
    }

    #[test]
    fn test_interpret_error_token_is_fatal() {
        let outcome = interpret(
            ScanOutcome::Finished(capture("Using hci0\n ERROR: Failed to reset.\n")),
            &MarkerConfig::default(),
        );
        assert_eq!(
            outcome,
            AttemptOutcome::Fatal(AbortReason::ScannerError {
                output: "Using hci0\n ERROR: Failed to reset.".to_string()
            })
        );
    }

    #[test]
    fn test_interpret_exit_before_init() {
        let markers = MarkerConfig::default();
        assert_eq!(
            interpret(ScanOutcome::ExitedBeforeInit(capture("bye")), &markers),
            AttemptOutcome::Fatal(AbortReason::InitTimeout)
        );
        assert!(matches!(
            interpret(
                ScanOutcome::ExitedBeforeInit(capture(" ERROR: Failed to open HCI device.")),
                &markers
            ),
            AttemptOutcome::Fatal(AbortReason::ScannerError { .. })
        ));
    }

    #[test]
    fn test_interpret_timeouts() {
        let markers = MarkerConfig::default();
        assert_eq!(
            interpret(ScanOutcome::InitTimeout(capture("")), &markers),
            AttemptOutcome::Fatal(AbortReason::InitTimeout)
        );
        assert_eq!(
            interpret(ScanOutcome::ScanTimeout(capture("Using hci0")), &markers),
            AttemptOutcome::Fatal(AbortReason::ScanTimeout)
        );
    }

    #[test]
    fn test_jitter_within_bounds() {
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            assert!(jitter(Duration::from_secs(1)) < Duration::from_secs(1));
        }
    }

    #[test]
    fn test_abort_reason_display() {
        assert_eq!(AbortReason::InitTimeout.to_string(), "scanner failed to initialize");
        assert_eq!(AbortReason::ScanTimeout.to_string(), "scanner timeout");
    }

    #[tokio::test]
    async fn test_completed_run_records_budget_plus_one_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.txt");
        let config = sh_config(
            path.clone(),
            3,
            "echo Using hci0; echo target bdaddr found after 42 ms",
        );
        let (_trigger, mut shutdown) = shutdown_pair();

        let mut session = RunSession::open(&config).unwrap();
        let outcome = session.run(&mut shutdown).await.unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(session.attempts(), 4);
        assert_eq!(session.skipped(), 0);
        assert_eq!(read_lines(&path), vec!["42", "42", "42", "42"]);
        assert_eq!(session.stats().count, 4);
    }

    #[tokio::test]
    async fn test_samples_are_in_attempt_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.txt");
        let counter = dir.path().join("counter");
        // Each run bumps a counter file and reports it as the found time.
        let script = format!(
            "n=$(cat {c} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {c}; \
             echo Using hci0; echo target bdaddr found after $n ms",
            c = counter.display()
        );
        let config = sh_config(path.clone(), 4, &script);
        let (_trigger, mut shutdown) = shutdown_pair();

        let mut session = RunSession::open(&config).unwrap();
        assert_eq!(session.run(&mut shutdown).await.unwrap(), RunOutcome::Completed);

        let lines = read_lines(&path);
        assert_eq!(lines, vec!["1", "2", "3", "4", "5"]);
        assert!(lines.iter().all(|l| l.parse::<u64>().is_ok()));
    }

    #[tokio::test]
    async fn test_malformed_output_consumes_budget_without_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.txt");
        let counter = dir.path().join("counter");
        // Odd attempts print five tokens after the marker, even attempts print a valid line.
        let script = format!(
            "n=$(cat {c} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {c}; \
             if [ $((n % 2)) -eq 1 ]; then echo Using one two three 42 ms; \
             else echo Using hci0; echo target bdaddr found after 42 ms; fi",
            c = counter.display()
        );
        let config = sh_config(path.clone(), 3, &script);
        let (_trigger, mut shutdown) = shutdown_pair();

        let mut session = RunSession::open(&config).unwrap();
        let outcome = session.run(&mut shutdown).await.unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(session.attempts(), 4);
        assert_eq!(session.skipped(), 2);
        assert_eq!(read_lines(&path), vec!["42", "42"]);
    }

    #[tokio::test]
    async fn test_full_tokenize_records_single_line_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.txt");
        let counter = dir.path().join("counter");
        // First scan prints one seven-token line, the second only five tokens.
        let script = format!(
            "n=$(cat {c} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {c}; \
             if [ $n -eq 1 ]; then echo Using hci0 bdaddr found after 42 ms; \
             else echo Using hci0 found 42 ms; fi",
            c = counter.display()
        );
        let mut config = sh_config(path.clone(), 1, &script);
        config.markers.tokenize = TokenizeFrom::Full;
        let (_trigger, mut shutdown) = shutdown_pair();

        let mut session = RunSession::open(&config).unwrap();
        let outcome = session.run(&mut shutdown).await.unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(session.attempts(), 2);
        assert_eq!(session.skipped(), 1);
        assert_eq!(read_lines(&path), vec!["42"]);
    }

    #[tokio::test]
    async fn test_after_init_tokenize_skips_single_line_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.txt");
        let config = sh_config(path.clone(), 1, "echo Using hci0 bdaddr found after 42 ms");
        assert_eq!(config.markers.tokenize, TokenizeFrom::AfterInit);
        let (_trigger, mut shutdown) = shutdown_pair();

        let mut session = RunSession::open(&config).unwrap();
        assert_eq!(session.run(&mut shutdown).await.unwrap(), RunOutcome::Completed);
        assert_eq!(session.skipped(), 2);
        assert!(read_lines(&path).is_empty());
    }

    #[tokio::test]
    async fn test_unparsable_duration_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.txt");
        let config = sh_config(
            path.clone(),
            1,
            "echo Using hci0; echo target bdaddr found after soon ms",
        );
        let (_trigger, mut shutdown) = shutdown_pair();

        let mut session = RunSession::open(&config).unwrap();
        assert_eq!(session.run(&mut shutdown).await.unwrap(), RunOutcome::Completed);
        assert_eq!(session.skipped(), 2);
        assert!(read_lines(&path).is_empty());
    }

    #[tokio::test]
    async fn test_missing_init_marker_aborts_with_init_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.txt");
        let config = sh_config(path.clone(), 5, "echo starting; sleep 30");
        let (_trigger, mut shutdown) = shutdown_pair();

        let mut session = RunSession::open(&config).unwrap();
        let outcome = session.run(&mut shutdown).await.unwrap();

        assert_eq!(outcome, RunOutcome::Aborted(AbortReason::InitTimeout));
        assert_eq!(session.attempts(), 1);
        assert!(read_lines(&path).is_empty());
    }

    #[tokio::test]
    async fn test_hang_after_init_aborts_with_scan_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.txt");
        let config = sh_config(path.clone(), 5, "echo Using hci0; sleep 30");
        let (_trigger, mut shutdown) = shutdown_pair();

        let mut session = RunSession::open(&config).unwrap();
        let outcome = session.run(&mut shutdown).await.unwrap();

        assert_eq!(outcome, RunOutcome::Aborted(AbortReason::ScanTimeout));
        assert!(read_lines(&path).is_empty());
    }

    #[tokio::test]
    async fn test_scanner_error_aborts_and_keeps_earlier_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.txt");
        let counter = dir.path().join("counter");
        // Two good scans, then the scanner reports an error.
        let script = format!(
            "n=$(cat {c} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {c}; \
             echo Using hci0; \
             if [ $n -le 2 ]; then echo target bdaddr found after 7 ms; \
             else echo ' ERROR: Failed to enable scan.'; fi",
            c = counter.display()
        );
        let config = sh_config(path.clone(), 10, &script);
        let (_trigger, mut shutdown) = shutdown_pair();

        let mut session = RunSession::open(&config).unwrap();
        let outcome = session.run(&mut shutdown).await.unwrap();

        let RunOutcome::Aborted(AbortReason::ScannerError { output }) = outcome else {
            panic!("expected ScannerError abort");
        };
        assert!(output.contains("ERROR: Failed to enable scan."));
        assert_eq!(session.attempts(), 3);
        assert_eq!(read_lines(&path), vec!["7", "7"]);
    }

    #[tokio::test]
    async fn test_shutdown_before_first_scan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.txt");
        let config = sh_config(path.clone(), 3, "echo Using hci0; echo a b c d 1 ms");
        let (trigger, mut shutdown) = shutdown_pair();
        trigger.trigger();

        let mut session = RunSession::open(&config).unwrap();
        assert_eq!(session.run(&mut shutdown).await.unwrap(), RunOutcome::Interrupted);
        assert_eq!(session.attempts(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_run_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.txt");
        let mut config = sh_config(path, 1, "");
        config.scanner.command = "nonexistent-scanner-xyz".to_string();
        let (_trigger, mut shutdown) = shutdown_pair();

        let mut session = RunSession::open(&config).unwrap();
        let err = session.run(&mut shutdown).await.unwrap_err();
        assert!(matches!(err, RunError::Scan(ScanError::Spawn { .. })));
    }

    #[test]
    fn test_open_bad_output_path() {
        let config = sh_config(PathBuf::from("/nonexistent-dir/impossible/output.txt"), 1, "");
        let err = RunSession::open(&config).unwrap_err();
        assert!(matches!(err, RunError::Recorder(RecorderError::Create { .. })));
    }
}
