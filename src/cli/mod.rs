//! Command-line interface for heapwatch.
//!
//! Run `heapwatch` to start the collector with sensible defaults. Every flag
//! can also be set through a `HEAPWATCH_*` environment variable.

use crate::core::config::{ConfigBuilder, StorageBackendKind};
use crate::core::{Config, HeapwatchError, Result};
use crate::server::{self, Collector};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

/// Memory profiling telemetry collector.
#[derive(Parser, Debug)]
#[command(name = "heapwatch")]
#[command(version, about, long_about = None)]
#[command(disable_version_flag = true)]
pub struct Cli {
    /// HTTP port for ingestion and queries
    #[arg(long, env = "HEAPWATCH_PORT")]
    pub port: Option<u16>,

    /// Directory for measurement data and the metadata database
    #[arg(long, env = "HEAPWATCH_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Storage backend for measurements
    #[arg(long, env = "HEAPWATCH_BACKEND", value_enum)]
    pub backend: Option<StorageBackendKind>,

    /// Sync to disk after every append
    #[arg(long, env = "HEAPWATCH_SYNC_WRITE")]
    pub sync_write: bool,

    /// Points kept per call-site for the regression
    #[arg(long, env = "HEAPWATCH_WINDOW")]
    pub window: Option<usize>,

    /// Configuration file path (default: ~/.config/heapwatch/config.yaml)
    #[arg(short, long, env = "HEAPWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, env = "HEAPWATCH_DEBUG")]
    pub debug: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub check_config: bool,

    /// Show version information
    #[arg(short = 'V', long = "show-version")]
    pub version: bool,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Load configuration with proper precedence:
    /// 1. CLI arguments and environment variables
    /// 2. Config file
    /// 3. Defaults
    pub async fn load_config(&self) -> Result<Config> {
        let builder = ConfigBuilder::new();

        let config_path = match &self.config {
            Some(path) => path.clone(),
            None => match default_config_path() {
                Some(path) if path.exists() => path,
                _ => return self.build_config_from_args(builder),
            },
        };

        let builder = match tokio::fs::read_to_string(&config_path).await {
            Ok(content) => {
                let builder = builder.from_yaml(&content)?;
                tracing::info!("Loaded configuration from: {:?}", config_path);
                builder
            }
            Err(e) if self.config.is_some() => {
                return Err(HeapwatchError::config(format!(
                    "Failed to read config file {:?}: {}",
                    config_path, e
                )));
            }
            Err(_) => {
                tracing::debug!("No config file found at {:?}, using defaults", config_path);
                builder
            }
        };

        self.build_config_from_args(builder)
    }

    fn build_config_from_args(&self, mut builder: ConfigBuilder) -> Result<Config> {
        if let Some(port) = self.port {
            builder = builder.port(port);
        }
        if let Some(dir) = &self.data_dir {
            builder = builder.data_dir(dir.clone());
        }
        if let Some(backend) = self.backend {
            builder = builder.backend(backend);
        }
        if let Some(window) = self.window {
            builder = builder.window(window);
        }
        if self.sync_write {
            builder = builder.sync_write(true);
        }

        builder.debug(self.debug).build()
    }

    /// Initialize logging. `RUST_LOG` wins over everything else.
    pub fn init_logging(&self, config: &Config) -> Result<()> {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let env_log_level = std::env::var("HEAPWATCH_LOG_LEVEL").ok();
        let log_level = if self.debug {
            "debug"
        } else {
            env_log_level.as_deref().unwrap_or(config.logging.level.as_str())
        };

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

        let fmt_layer = if config.logging.structured {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .compact()
        } else {
            tracing_subscriber::fmt::layer().with_target(false).compact()
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| HeapwatchError::config(format!("Failed to initialize logging: {}", e)))?;

        Ok(())
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("heapwatch").join("config.yaml"))
}

/// Execute the heapwatch collector.
pub async fn execute(cli: Cli) -> Result<()> {
    if cli.version {
        println!("heapwatch {}", env!("CARGO_PKG_VERSION"));
        println!("Memory profiling telemetry collector");
        return Ok(());
    }

    let config = cli.load_config().await?;

    if cli.check_config {
        println!("Configuration is valid!");
        println!("  Listen: {}:{}", config.server.listen_address, config.server.port);
        println!("  Backend: {:?}", config.storage.backend);
        println!("  Data dir: {}", config.storage.data_dir.display());
        println!("  Window: {} points", config.metrics.window);
        return Ok(());
    }

    cli.init_logging(&config)?;
    run(config).await
}

/// Runs the collector until Ctrl-C, then shuts it down in order.
async fn run(config: Config) -> Result<()> {
    tracing::info!(
        "Starting heapwatch with {:?} storage in {}",
        config.storage.backend,
        config.storage.data_dir.display()
    );

    let collector = Arc::new(Collector::start(config).await?);

    let signal_collector = Arc::clone(&collector);
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Received shutdown signal, stopping...");
        // Ends open ingestion streams and subscriptions so the server can drain.
        signal_collector.begin_shutdown();
    };

    let served = server::http::serve(Arc::clone(&collector), shutdown).await;
    collector.shutdown().await;
    served
}
