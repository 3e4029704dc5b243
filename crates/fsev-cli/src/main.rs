//! CLI entry point for fsev.
//!
//! Watches directory trees and prints the raw event batches the native
//! streams deliver, one stream per directory.
//!
//! # Usage
//!
//! ```bash
//! fsev [OPTIONS] <COMMAND>
//!
//! # Watch two trees with 100ms latency and per-file events
//! fsev watch --sensitivity high --file-events ./src ./docs
//!
//! # Emit one JSON object per batch
//! fsev watch --json /var/log
//!
//! # Decode a flag word
//! fsev flags 0x00011100
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

use std::io::Write;
use std::num::ParseIntError;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{WrapErr, eyre};
use fsev_core::{Config, CreateFlags, EventFlags, Sensitivity, WatchConfig};
use fsev_stream::bridge::DEFAULT_CHANNEL_CAPACITY;
use fsev_stream::{BatchStats, ChannelHandler, HandlerContext, NotifyBackend, OwnedBatch, StreamOptions, WatchThread};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// CLI ARGUMENT TYPES
// =============================================================================

/// Watch directory trees and print native filesystem event batches.
#[derive(Parser)]
#[command(name = "fsev", version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Command to execute.
    #[command(subcommand)]
    command: Commands,

    /// Path to a JSON configuration file.
    #[arg(short, long, global = true, env = "FSEV_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Enable diagnostic tracing of the callback path.
    #[arg(long, global = true)]
    trace: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Watch one or more directories until interrupted.
    Watch(WatchArgs),

    /// Decode a per-event flag word (hex with 0x prefix, or decimal).
    Flags {
        /// The flag word.
        word: String,
    },
}

/// Arguments for `fsev watch`.
#[derive(clap::Args)]
struct WatchArgs {
    /// Directories to watch.
    #[arg(required = true)]
    paths: Vec<Utf8PathBuf>,

    /// Latency preset.
    #[arg(short, long, value_enum)]
    sensitivity: Option<SensitivityArg>,

    /// Explicit latency in seconds, overriding the preset.
    #[arg(short, long)]
    latency: Option<f64>,

    /// Report individual files instead of their directories.
    #[arg(long)]
    file_events: bool,

    /// Deliver the first event after a quiet period immediately.
    #[arg(long)]
    no_defer: bool,

    /// Do not report changes to the watched roots themselves.
    #[arg(long)]
    no_watch_root: bool,

    /// Maximum number of events per batch.
    #[arg(long)]
    max_chunk: Option<usize>,

    /// Print one JSON object per batch.
    #[arg(long)]
    json: bool,
}

/// Latency presets.
#[derive(Clone, Copy, ValueEnum)]
enum SensitivityArg {
    /// 0.1 seconds.
    High,
    /// 0.5 seconds.
    Medium,
    /// 1 second.
    Low,
}

impl From<SensitivityArg> for Sensitivity {
    fn from(value: SensitivityArg) -> Self {
        match value {
            SensitivityArg::High => Self::High,
            SensitivityArg::Medium => Self::Medium,
            SensitivityArg::Low => Self::Low,
        }
    }
}

// =============================================================================
// INITIALIZATION FUNCTIONS
// =============================================================================

/// Initializes the tracing subscriber for logging.
///
/// Respects the `RUST_LOG` environment variable if set. Otherwise, uses
/// `debug` level if `--verbose` is set, or `info` level by default.
/// Diagnostic records are let through when diagnostic tracing is on.
fn init_tracing(verbose: bool, no_color: bool, diagnostics: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { "info" };
        let diag = if diagnostics { ",fsev::diag=trace" } else { "" };
        EnvFilter::new(format!("{level},notify=warn,mio=warn{diag}"))
    });

    // Check if colors should be disabled (flag or NO_COLOR env var)
    let use_ansi = !no_color && std::env::var("NO_COLOR").is_err();

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_ansi(use_ansi))
        .with(filter)
        .init();
}

/// Loads the configuration file, if any.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or validated.
fn load_config(path: Option<&Utf8PathBuf>) -> color_eyre::Result<Config> {
    match path {
        Some(path) => Config::from_json_file(path).wrap_err_with(|| format!("failed to load configuration from {path}")),
        None => Ok(Config::default()),
    }
}

/// Applies command-line overrides on top of the file configuration.
fn apply_overrides(mut config: WatchConfig, args: &WatchArgs) -> color_eyre::Result<WatchConfig> {
    if let Some(sensitivity) = args.sensitivity {
        config.sensitivity = sensitivity.into();
        config.latency_override = None;
    }
    if args.latency.is_some() {
        config.latency_override = args.latency;
    }
    if args.file_events {
        config.flags |= CreateFlags::FILE_EVENTS;
    }
    if args.no_defer {
        config.flags |= CreateFlags::NO_DEFER;
    }
    if args.no_watch_root {
        config.flags.remove(CreateFlags::WATCH_ROOT);
    }
    if let Some(max_chunk) = args.max_chunk {
        config.max_chunk_size = max_chunk;
    }

    config.validate()?;
    Ok(config)
}

// =============================================================================
// COMMAND IMPLEMENTATIONS
// =============================================================================

/// Watches every path until Ctrl-C or SIGTERM.
///
/// # Errors
///
/// Returns an error if a watch cannot be started or output fails.
async fn run_watch(args: &WatchArgs, config: WatchConfig) -> color_eyre::Result<()> {
    let options = StreamOptions::from_config(&config);
    let (tx, mut rx) = mpsc::channel::<OwnedBatch>(DEFAULT_CHANNEL_CAPACITY);

    let mut watches = Vec::with_capacity(args.paths.len());
    for path in &args.paths {
        let handler = HandlerContext::new(ChannelHandler::new(tx.clone()));
        let watch = WatchThread::spawn(&NotifyBackend, path, &options, &handler)
            .wrap_err_with(|| format!("failed to watch {path}"))?;
        info!(root = %watch.root(), stream = %watch.stream_id(), "Watching");
        watches.push(watch);
    }
    drop(tx);

    info!(
        watches = watches.len(),
        latency_secs = config.latency_secs(),
        flags = %config.flags.bits(),
        "Waiting for changes"
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            batch = rx.recv() => match batch {
                Some(batch) => print_batch(&batch, args.json)?,
                None => break,
            },
            result = &mut shutdown => {
                result?;
                info!("Shutting down");
                break;
            }
        }
    }

    // Unblocks any watch thread waiting on a full channel.
    drop(rx);

    tokio::task::spawn_blocking(move || {
        for watch in watches {
            let stream = watch.stream_id();
            if let Err(error) = watch.stop() {
                warn!(%stream, %error, "Watch did not stop cleanly");
            }
        }
    })
    .await?;

    Ok(())
}

/// Resolves when the process is asked to terminate.
async fn shutdown_signal() -> color_eyre::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}

/// Decodes and prints a flag word.
fn run_flags(word: &str) -> color_eyre::Result<()> {
    let bits = parse_word(word).map_err(|e| eyre!("invalid flag word '{word}': {e}"))?;
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    writeln!(handle, "{}", EventFlags::from_bits_retain(bits))?;
    Ok(())
}

// =============================================================================
// OUTPUT HELPERS
// =============================================================================

/// Prints one batch as text or as a JSON line.
fn print_batch(batch: &OwnedBatch, json: bool) -> color_eyre::Result<()> {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();

    if json {
        serde_json::to_writer(&mut handle, batch)?;
        writeln!(handle)?;
        return Ok(());
    }

    let stats = BatchStats::from_batch(batch);
    writeln!(
        handle,
        "{}: {} events ({} files, {} dirs, {} rescans, {} root changes)",
        batch.stream, stats.total_events, stats.files, stats.directories, stats.rescans, stats.root_changes
    )?;
    for event in batch {
        writeln!(handle, "  {event}")?;
    }
    Ok(())
}

/// Parses `0x`-prefixed hex or decimal.
fn parse_word(word: &str) -> Result<u32, ParseIntError> {
    let word = word.trim();
    match word.strip_prefix("0x").or_else(|| word.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => word.replace('_', "").parse(),
    }
}

// =============================================================================
// MAIN ENTRY POINT
// =============================================================================

/// Application entry point.
#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    // 1. Install color-eyre FIRST (before any potential panics)
    color_eyre::install()?;

    // 2. Parse CLI arguments
    let cli = Cli::parse();

    // 3. Load configuration and fix the diagnostic switch for the process
    let config = load_config(cli.config.as_ref())?;
    if cli.trace || config.trace {
        fsev_core::trace::init(true);
    }

    // 4. Initialize tracing (handles --no-color for log output)
    init_tracing(cli.verbose, cli.no_color, fsev_core::trace::enabled());

    // 5. Route to appropriate command
    match &cli.command {
        Commands::Watch(args) => {
            let watch_config = apply_overrides(config.watch, args)?;
            run_watch(args, watch_config).await
        }
        Commands::Flags { word } => run_flags(word),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> WatchArgs {
        let argv = ["fsev", "watch"]
            .into_iter()
            .chain(extra.iter().copied())
            .chain(["/tmp"]);
        let cli = Cli::parse_from(argv);
        match cli.command {
            Commands::Watch(args) => args,
            Commands::Flags { .. } => unreachable!(),
        }
    }

    #[test]
    fn test_parse_word() {
        assert_eq!(parse_word("0x00011100"), Ok(0x0001_1100));
        assert_eq!(parse_word("0X20"), Ok(0x20));
        assert_eq!(parse_word("256"), Ok(256));
        assert_eq!(parse_word("0x0001_1100"), Ok(0x0001_1100));
        assert!(parse_word("nope").is_err());
    }

    #[test]
    fn test_overrides_apply_on_top_of_config() {
        let config = apply_overrides(
            WatchConfig::default(),
            &args(&["--sensitivity", "high", "--file-events", "--no-watch-root"]),
        )
        .unwrap();
        assert_eq!(config.latency_secs(), 0.1);
        assert_eq!(config.flags, CreateFlags::FILE_EVENTS);
    }

    #[test]
    fn test_explicit_latency_wins() {
        let config = apply_overrides(WatchConfig::default(), &args(&["--latency", "0.25", "--no-defer"])).unwrap();
        assert_eq!(config.latency_secs(), 0.25);
        assert!(config.flags.contains(CreateFlags::NO_DEFER | CreateFlags::WATCH_ROOT));
    }

    #[test]
    fn test_invalid_chunk_size_is_rejected() {
        let result = apply_overrides(WatchConfig::default(), &args(&["--max-chunk", "5"]));
        assert!(result.is_err());
    }
}
