//! Audiometer - Main entry point
//!
//! Runs the threshold test either behind the HTTP control API (default)
//! or as a single interactive console session (`--console`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use audiometer_common::config::{AppConfig, FrequencyPreset};
use audiometer_common::interpretation::interpret;
use audiometer_common::results::load_prior_records;
use audiometer_common::{db, Ear, SessionReport};
use audiometer_engine::api::{self, AppContext};
use audiometer_engine::audio::ToneOutput;
use audiometer_engine::session::{SessionRequest, SessionRunner};
use audiometer_engine::SharedState;
use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for the audiometer
#[derive(Parser, Debug)]
#[command(name = "audiometer")]
#[command(about = "Adaptive pure-tone hearing threshold test")]
#[command(version)]
struct Args {
    /// Config file (TOML)
    #[arg(short, long, env = "AUDIOMETER_CONFIG")]
    config: Option<PathBuf>,

    /// Port for the HTTP control API
    #[arg(short, long, env = "AUDIOMETER_PORT")]
    port: Option<u16>,

    /// Run one session on the console instead of serving the API
    #[arg(long)]
    console: bool,

    /// Frequency preset (standard, quick, mini)
    #[arg(long)]
    preset: Option<FrequencyPreset>,

    /// Subject name; results go to a per-subject folder
    #[arg(short, long)]
    subject: Option<String>,

    /// Audio output device name
    #[arg(short, long, env = "AUDIOMETER_DEVICE")]
    device: Option<String>,

    /// List audio output devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Resume an interrupted session from its CSV result file
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Folder receiving result files
    #[arg(long, env = "AUDIOMETER_RESULTS_DIR")]
    results_dir: Option<PathBuf>,

    /// Seed for ear order and pause jitter
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter(&config.logging.level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting audiometer v{} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH")
    );

    if args.list_devices {
        for name in ToneOutput::list_devices().context("Failed to list audio devices")? {
            println!("{}", name);
        }
        return Ok(());
    }

    // CLI overrides
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(dir) = args.results_dir.clone() {
        config.results_dir = dir;
    }
    if let Some(preset) = args.preset {
        config.test = config.test.with_preset(preset);
    }
    if args.device.is_some() {
        config.test.output.device = args.device.clone();
    }
    config
        .test
        .validate()
        .context("Invalid test configuration")?;

    info!("Results folder: {}", config.results_dir.display());

    let mut runner = SessionRunner::with_sound_card().with_results_dir(config.results_dir.clone());
    if let Some(path) = &config.database_path {
        let pool = db::init_database(path)
            .await
            .context("Failed to open history database")?;
        info!("History database: {}", path.display());
        runner = runner.with_database(pool);
    }

    let state = Arc::new(SharedState::new());

    if args.console {
        let prior_records = match &args.resume {
            Some(path) => load_prior_records(path)
                .with_context(|| format!("Failed to read {}", path.display()))?,
            None => Vec::new(),
        };
        let request = SessionRequest {
            config: config.test,
            subject: args.subject,
            prior_records,
            seed: args.seed,
        };
        return run_console(state, runner, request).await;
    }

    if args.resume.is_some() {
        warn!("--resume only applies to console sessions, ignoring");
    }

    let ctx = AppContext {
        state: Arc::clone(&state),
        runner: Arc::new(runner),
        base_config: Arc::new(config.test),
    };

    api::run(ctx, config.port, shutdown_signal())
        .await
        .context("Server error")?;

    // Stop a session still running so its results get persisted
    if state.cancel_session().await {
        state.join_session().await;
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Expand a bare level into per-crate directives
fn log_filter(level: &str) -> String {
    if level.contains('=') {
        level.to_string()
    } else {
        format!(
            "audiometer_engine={0},audiometer_common={0},tower_http={0}",
            level
        )
    }
}

/// Run one session, taking responses from stdin
async fn run_console(
    state: Arc<SharedState>,
    runner: SessionRunner,
    request: SessionRequest,
) -> Result<()> {
    let session_id = runner
        .start(&state, request)
        .await
        .context("Failed to start session")?;

    println!("Session {}", session_id);
    println!("Press Enter whenever you hear a tone. Type q and Enter to stop.");

    // stdin reads cannot be cancelled; a detached thread does not hold up exit
    let (tx, mut lines) = mpsc::channel::<String>(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    let input_state = Arc::clone(&state);
    let input = tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            if line.trim().eq_ignore_ascii_case("q") {
                input_state.cancel_session().await;
                break;
            }
            input_state.latch.notify_pressed();
            input_state.latch.notify_released();
        }
    });

    let signal_state = Arc::clone(&state);
    let signals = tokio::spawn(async move {
        shutdown_signal().await;
        signal_state.cancel_session().await;
    });

    state.join_session().await;
    input.abort();
    signals.abort();

    if let Some(report) = state.snapshot().await {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SessionReport) {
    println!();
    println!("Session {}: {}", report.session_id, report.status);
    if let Some(error) = &report.error {
        println!("Error: {}", error);
    }

    for ear in [Ear::Right, Ear::Left] {
        let records: Vec<_> = report.records.iter().filter(|r| r.ear == ear).collect();
        if records.is_empty() {
            continue;
        }
        println!("{} ear:", ear);
        for record in records {
            match record.level() {
                Some(level) => println!("  {:>5} Hz  {:>3} dBHL", record.frequency_hz, level),
                None => println!("  {:>5} Hz  no response", record.frequency_hz),
            }
        }
    }

    println!();
    println!("{}", interpret(report).summary);
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
