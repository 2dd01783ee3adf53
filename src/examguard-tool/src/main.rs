//! examguard - inspect and administer an examguard store.
//!
//! Works against a `FileStore` directory, the same layout a host using the
//! file backend writes.
//!
//! ## Usage
//!
//! ```bash
//! # Current state, fingerprint and violation count
//! examguard --store ~/.local/share/examguard status
//!
//! # Last 20 ledger events as JSON
//! examguard --store ./state events --limit 20 --format json
//!
//! # Verify every ledger seal (non-zero exit on failure)
//! examguard --store ./state audit
//!
//! # Run one check cycle against an HTTPS Date header
//! examguard --store ./state check --time-url https://example.com
//!
//! # Produce the digest for policy.unlock_token_sha256, then unlock
//! examguard hash-token 'proctor-override'
//! examguard --store ./state --config monitor.json unlock --token 'proctor-override'
//! ```

mod commands;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use examguard_core::{Clock, MonitorConfig, SystemClock, TrustedTimeSource};
use examguard_store::{FileStore, KeyValueStore};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable.
    Text,
    /// Pretty JSON.
    Json,
}

/// Inspect and administer an examguard store.
#[derive(Parser)]
#[command(name = "examguard")]
#[command(version = VERSION)]
#[command(about = "Inspect and administer an examguard integrity store")]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Store directory
    #[arg(short, long, global = true, default_value = "examguard-store")]
    store: PathBuf,

    /// Monitor configuration (JSON); defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the persisted security state
    Status,

    /// List recent ledger events, newest first
    Events {
        /// Maximum number of events
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Verify the seal of every ledger record
    Audit,

    /// Run one check cycle
    Check {
        /// HTTPS endpoint whose Date header is trusted time
        #[arg(long)]
        time_url: Option<String>,
    },

    /// Clear the security state with an administrative token
    Unlock {
        /// Plain-text admin token
        #[arg(short, long)]
        token: String,
    },

    /// Delete the stored device fingerprint and derive a new one
    ResetFingerprint,

    /// Print the SHA-256 digest of a token for the unlock policy
    HashToken {
        /// Token to hash
        token: String,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<MonitorConfig> {
    let Some(path) = path else {
        return Ok(MonitorConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    MonitorConfig::from_json(&json).with_context(|| format!("parsing {}", path.display()))
}

fn time_source(url: Option<&str>) -> anyhow::Result<Option<Arc<dyn TrustedTimeSource>>> {
    let Some(url) = url else {
        return Ok(None);
    };
    let source = examguard_core::HttpDateTimeSource::new(url)?;
    Ok(Some(Arc::new(source)))
}

fn run(
    command: Commands,
    store_dir: &Path,
    config_path: Option<&Path>,
    format: OutputFormat,
) -> anyhow::Result<String> {
    let config = load_config(config_path)?;
    let store: Arc<dyn KeyValueStore> = Arc::new(
        FileStore::open(store_dir)
            .with_context(|| format!("opening store {}", store_dir.display()))?,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

    match command {
        Commands::Status => commands::status(store, clock, &config, format),
        Commands::Events { limit } => commands::events(store, clock, &config, limit, format),
        Commands::Audit => commands::audit_ledger(store, format),
        Commands::Check { time_url } => {
            let source = time_source(time_url.as_deref())?;
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            rt.block_on(commands::check(store, clock, config, source, format))
        },
        Commands::Unlock { token } => commands::unlock(store, clock, config, &token),
        Commands::ResetFingerprint => commands::reset_fingerprint(store, &config),
        Commands::HashToken { token } => Ok(examguard_core::sha256_hex(token.as_bytes())),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let output = match cli.command {
        Commands::HashToken { token } => examguard_core::sha256_hex(token.as_bytes()),
        command => run(command, &cli.store, cli.config.as_deref(), cli.format)?,
    };

    println!("{output}");
    Ok(())
}
