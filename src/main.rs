mod config;
mod output;
mod recorder;
mod report;
mod runner;
mod scanner;
mod signals;

use chrono::Utc;
use clap::Parser;
use config::{ConfigError, ProbeConfig};
use recorder::SampleStats;
use report::{ReportOutcome, RunReport};
use runner::{AbortReason, RunError, RunOutcome, RunSession};
use std::path::PathBuf;
use std::process::ExitCode;

/// Runs a BLE beacon scanner in a supervised loop: wait a random moment,
/// launch the scanner, enforce init and scan deadlines, and record how long
/// it took to find the target.
#[derive(Parser, Debug)]
#[command(name = "beacon-probe", version, about)]
pub struct Cli {
    /// Override iteration budget (default: from config). N runs N + 1 scans.
    #[arg(value_name = "ITERATIONS")]
    iterations: Option<u32>,

    /// Config file path
    #[arg(short, long, default_value = "probe.toml")]
    config: PathBuf,

    /// Sample file path (overrides config)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write a JSON run report here (overrides config)
    #[arg(long)]
    report: Option<PathBuf>,

    /// Scanner command (overrides config)
    #[arg(long)]
    scanner: Option<String>,

    /// Target MAC address (overrides config)
    #[arg(long)]
    mac: Option<String>,

    /// Scan interval parameter (overrides config)
    #[arg(long)]
    interval: Option<u32>,

    /// Scan window parameter (overrides config)
    #[arg(long)]
    window: Option<u32>,

    /// Seconds to wait for the scanner's init marker (overrides config)
    #[arg(long)]
    init_timeout: Option<u64>,

    /// Seconds to wait for the scanner to finish (overrides config)
    #[arg(long)]
    scan_timeout: Option<u64>,

    /// Upper bound of the random pre-scan delay in ms (overrides config)
    #[arg(long)]
    max_delay_ms: Option<u64>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (spawns, tokenized output, delays)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

/// Exit code for config errors.
const EXIT_CONFIG: u8 = 2;
/// Conventional exit code for SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

impl Cli {
    /// Apply command-line overrides on top of the loaded config.
    fn apply_overrides(&self, config: &mut ProbeConfig) {
        if let Some(n) = self.iterations {
            config.session.iterations = n;
        }
        if let Some(path) = &self.output {
            config.session.output_file = path.clone();
        }
        if let Some(path) = &self.report {
            config.session.report_file = Some(path.clone());
        }
        if let Some(command) = &self.scanner {
            config.scanner.command = command.clone();
        }
        if let Some(mac) = &self.mac {
            config.target.mac = mac.clone();
        }
        if let Some(interval) = self.interval {
            config.target.interval = interval;
        }
        if let Some(window) = self.window {
            config.target.window = window;
        }
        if let Some(secs) = self.init_timeout {
            config.timeouts.init_secs = secs;
        }
        if let Some(secs) = self.scan_timeout {
            config.timeouts.scan_secs = secs;
        }
        if let Some(ms) = self.max_delay_ms {
            config.session.max_delay_ms = ms;
        }
    }

    fn log_filter(&self) -> &'static str {
        if self.verbose {
            "beacon_probe=debug"
        } else if self.quiet {
            "beacon_probe=warn"
        } else {
            "beacon_probe=info"
        }
    }
}

fn resolve_config(cli: &Cli) -> Result<ProbeConfig, ConfigError> {
    let mut config = ProbeConfig::load(&cli.config)?;
    cli.apply_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

fn print_settings(config: &ProbeConfig) {
    println!("beacon-probe v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "Iterations:    {} ({} scans)",
        config.session.iterations,
        u64::from(config.session.iterations) + 1
    );
    println!("Output file:   {}", config.session.output_file.display());
    match &config.session.report_file {
        Some(path) => println!("Report file:   {}", path.display()),
        None => println!("Report file:   (none)"),
    }
    println!(
        "Scanner:       {} {}",
        config.scanner.command,
        config.scanner_args().join(" ")
    );
    println!(
        "Timeouts:      init {}s, scan {}s",
        config.timeouts.init_secs, config.timeouts.scan_secs
    );
    println!("Max delay:     {}ms", config.session.max_delay_ms);
    println!(
        "Markers:       init {:?}, error {:?}, {} tokens",
        config.markers.init, config.markers.error, config.markers.expected_tokens
    );
}

/// Report for a run whose sample file could not be opened.
fn open_failure_report(
    config: &ProbeConfig,
    error: &RunError,
    started_at: chrono::DateTime<Utc>,
) -> RunReport {
    RunReport::new(
        ReportOutcome::Failed,
        Some(error.to_string()),
        config.session.iterations,
        0,
        0,
        &config.session.output_file,
        SampleStats::default(),
        started_at,
    )
}

fn write_configured_report(config: &ProbeConfig, report: &RunReport) {
    if let Some(path) = &config.session.report_file {
        if let Err(e) = report::write_report(path, report) {
            tracing::warn!(error = %e, "failed to write run report");
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_filter())),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match resolve_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if cli.dry_run {
        print_settings(&config);
        println!("Dry run mode, config validated, not running.");
        return ExitCode::SUCCESS;
    }

    let mut shutdown = match signals::install() {
        Ok(shutdown) => shutdown,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            return ExitCode::FAILURE;
        }
    };

    let started_at = Utc::now();
    let mut session = match RunSession::open(&config) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(error = %e, "failed to start run");
            write_configured_report(&config, &open_failure_report(&config, &e, started_at));
            return ExitCode::FAILURE;
        }
    };

    let result = session.run(&mut shutdown).await;

    let (outcome, detail, code) = match &result {
        Ok(RunOutcome::Completed) => (ReportOutcome::Completed, None, ExitCode::SUCCESS),
        Ok(RunOutcome::Interrupted) => (
            ReportOutcome::Interrupted,
            None,
            ExitCode::from(EXIT_INTERRUPTED),
        ),
        Ok(RunOutcome::Aborted(reason)) => {
            let outcome = match reason {
                AbortReason::InitTimeout => ReportOutcome::InitTimeout,
                AbortReason::ScanTimeout => ReportOutcome::ScanTimeout,
                AbortReason::ScannerError { .. } => ReportOutcome::ScannerError,
            };
            (outcome, Some(reason.to_string()), ExitCode::FAILURE)
        }
        Err(e) => {
            tracing::error!(error = %e, "run failed");
            (ReportOutcome::Failed, Some(e.to_string()), ExitCode::FAILURE)
        }
    };

    let stats = session.stats();
    tracing::info!(
        attempts = session.attempts(),
        recorded = stats.count,
        skipped = session.skipped(),
        min = ?stats.min,
        max = ?stats.max,
        mean = ?stats.mean(),
        "exiting"
    );

    let report = RunReport::new(
        outcome,
        detail,
        session.budget(),
        session.attempts(),
        session.skipped(),
        session.output_path(),
        stats,
        started_at,
    );
    write_configured_report(&config, &report);

    code
}
