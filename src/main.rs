use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use modqueue::cipher::IdCipher;
use modqueue::config::{Config, ConfigError};
use modqueue::logging::{self, LogLevel, LoggingError};
use modqueue::pool::{FanInPool, JsonLinesProcessor, MetricsError, PoolConfig, PoolError, PoolMetrics};
use modqueue::queue::{QueueError, ReportConsumer, ReportWriter};
use modqueue::server::{self, AppState};
use modqueue::store::{RedisStore, StoreError};

/// Distributed moderation report queue.
#[derive(Debug, Parser)]
#[command(name = "modqueue", version, about)]
struct Cli {
    /// Path to a TOML config file.
    #[arg(short, long, env = "MODQUEUE_CONFIG")]
    config: Option<PathBuf>,

    /// Node ID used for report ID allocation (0-1023).
    #[arg(long, env = "MODQUEUE_NODE_ID")]
    node_id: Option<u32>,

    /// Address of this node's store.
    #[arg(long, env = "MODQUEUE_PERSISTENT_STORE")]
    persistent_store: Option<String>,

    /// Additional stores to drain. Repeatable or comma-separated.
    #[arg(long = "remote-store", env = "MODQUEUE_REMOTE_STORES", value_delimiter = ',')]
    remote_stores: Vec<String>,

    /// Hex-encoded 8-byte key for obscuring report IDs.
    #[arg(long, env = "MODQUEUE_ID_ENCRYPTION_KEY", hide_env_values = true)]
    id_encryption_key: Option<String>,

    /// Consumer group name.
    #[arg(long, env = "MODQUEUE_CONSUMER_GROUP")]
    consumer_group: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "MODQUEUE_LOG_LEVEL", value_parser = parse_log_level)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drain every configured store, printing each report as a JSON line.
    Drain {
        /// Address to serve /metrics and /health on.
        #[arg(long, env = "MODQUEUE_METRICS_ADDR")]
        metrics_addr: Option<String>,
    },

    /// Enqueue a report read from a JSON file ("-" for stdin).
    Enqueue {
        /// Identifier of the reporting account.
        #[arg(long)]
        sender: String,

        /// Submission time; defaults to now.
        #[arg(long)]
        timestamp: Option<String>,

        file: PathBuf,
    },

    /// List quarantined reports as JSON lines.
    Quarantine,

    /// Translate between internal and external report IDs.
    Id {
        #[command(subcommand)]
        op: IdCommand,
    },
}

#[derive(Debug, Subcommand)]
enum IdCommand {
    /// Internal ID to external ID.
    Encrypt { id: u64 },

    /// External ID to internal ID.
    Decrypt {
        #[arg(allow_hyphen_values = true)]
        id: i64,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error("invalid metrics address '{0}'")]
    MetricsAddr(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode output: {0}")]
    Json(#[from] serde_json::Error),
}

fn parse_log_level(s: &str) -> Result<LogLevel, String> {
    LogLevel::parse(s).ok_or_else(|| format!("unknown log level '{s}'"))
}

impl Cli {
    /// Loads the config file, if any, and applies command-line overrides.
    fn load_config(&self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(node_id) = self.node_id {
            config.node_id = node_id;
        }
        if let Some(store) = &self.persistent_store {
            config.persistent_store = Some(store.clone());
        }
        if !self.remote_stores.is_empty() {
            config.remote_stores = self.remote_stores.clone();
        }
        if let Some(key) = &self.id_encryption_key {
            config.id_encryption_key = Some(key.clone());
        }
        if let Some(group) = &self.consumer_group {
            config.consumer_group = group.clone();
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
        if let Command::Drain {
            metrics_addr: Some(addr),
        } = &self.command
        {
            config.metrics_addr = addr.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("modqueue: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logging::init(&config.log) {
        eprintln!("modqueue: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: Config) -> Result<(), CliError> {
    match command {
        Command::Drain { .. } => drain(&config).await,
        Command::Enqueue {
            sender,
            timestamp,
            file,
        } => enqueue(&config, &sender, timestamp, &file).await,
        Command::Quarantine => list_quarantine(&config).await,
        Command::Id { op } => translate_id(&config, op),
    }
}

async fn drain(config: &Config) -> Result<(), CliError> {
    let stores = config.all_stores()?;
    let addr: SocketAddr = config
        .metrics_addr
        .parse()
        .map_err(|_| CliError::MetricsAddr(config.metrics_addr.clone()))?;

    let metrics = PoolMetrics::new()?;
    let pool = FanInPool::connect(
        &stores,
        &config.consumer_group,
        PoolConfig::from(config),
        metrics.clone(),
    )
    .await?;

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(server::serve(
        addr,
        AppState::new(metrics),
        shutdown.clone(),
    ));

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        info!("Received Ctrl-C, shutting down");
        ctrl_c.cancel();
    });

    let result = pool
        .run(JsonLinesProcessor::new(io::stdout()), shutdown.clone())
        .await;
    shutdown.cancel();

    match server.await {
        Ok(Err(e)) => warn!(error = %e, "Metrics server failed"),
        Err(e) => warn!(error = %e, "Metrics server task panicked"),
        Ok(Ok(())) => {}
    }
    Ok(result?)
}

async fn enqueue(
    config: &Config,
    sender: &str,
    timestamp: Option<String>,
    file: &Path,
) -> Result<(), CliError> {
    let cipher = config.id_encryption_key.as_deref().map(IdCipher::new).transpose()?;
    let json = read_report_body(file, tokio::io::stdin()).await?;
    let timestamp = timestamp.unwrap_or_else(|| {
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    });

    let store = RedisStore::connect(config.require_store()?).await?;
    let writer = ReportWriter::new(store, config.node_id)?;
    let id = writer.add_raw_report(sender, &timestamp, json.trim()).await?;

    let output = match cipher {
        Some(cipher) => serde_json::json!({ "id": id, "external_id": cipher.encrypt(id.get()) }),
        None => serde_json::json!({ "id": id }),
    };
    println!("{output}");
    Ok(())
}

/// Reads a report body from `file`, or from `stdin` when `file` is "-".
async fn read_report_body<R: AsyncRead + Unpin>(file: &Path, mut stdin: R) -> io::Result<String> {
    if file.as_os_str() == "-" {
        let mut json = String::new();
        stdin.read_to_string(&mut json).await?;
        Ok(json)
    } else {
        tokio::fs::read_to_string(file).await
    }
}

async fn list_quarantine(config: &Config) -> Result<(), CliError> {
    let store = RedisStore::connect(config.require_store()?).await?;
    let consumer = ReportConsumer::new(store, config.consumer_group.as_str()).await?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for report in consumer.quarantined_reports().await? {
        serde_json::to_writer(&mut out, &report)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

fn translate_id(config: &Config, op: IdCommand) -> Result<(), CliError> {
    let cipher = IdCipher::new(config.require_key()?)?;
    match op {
        IdCommand::Encrypt { id } => println!("{}", cipher.encrypt(id)),
        IdCommand::Decrypt { id } => println!("{}", cipher.decrypt(id)),
    }
    Ok(())
}
