//! zexport - keeps a Z39.50 session warm and serves full catalogue exports over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! zexport --host z.example.org --port 210 --database books \
//!     --upload-url http://backend.example.com/upload
//!
//! curl http://localhost:8000/refresh
//! curl -OJ http://localhost:8000/data
//! ```

mod routes;

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use zexport_core::logging::{init_logging, log_dir, LogConfig, LogFormat};
use zexport_core::models::{QuerySyntax, ServiceConfig, SessionOptions};
use zexport_core::ZexportState;

#[derive(Parser, Debug)]
#[command(name = "zexport")]
#[command(author, version, about = "Z39.50 catalogue exporter with a warm session and durable snapshots")]
struct Cli {
    /// Record server host
    #[arg(long, env = "ZEXPORT_HOST")]
    host: String,

    /// Record server port
    #[arg(long, env = "ZEXPORT_PORT", default_value_t = 210)]
    port: u16,

    /// Database name on the record server
    #[arg(long, env = "ZEXPORT_DATABASE")]
    database: String,

    /// Query syntax for the export query (ccl, prefix, cql)
    #[arg(long, env = "ZEXPORT_QUERY_SYNTAX", default_value = "ccl")]
    query_syntax: String,

    /// Query that matches every record
    #[arg(long, env = "ZEXPORT_QUERY", default_value = "1=1")]
    query: String,

    /// yaz-client executable
    #[arg(long, env = "ZEXPORT_YAZ_CLIENT", default_value = "yaz-client")]
    yaz_client: PathBuf,

    /// Downstream upload URL (push disabled when absent)
    #[arg(long, env = "ZEXPORT_UPLOAD_URL")]
    upload_url: Option<String>,

    /// Data directory for the database, dumps and logs
    #[arg(long, env = "ZEXPORT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Name of the canonical latest file
    #[arg(long, env = "ZEXPORT_CURRENT_FILE", default_value = "current.txt")]
    current_file: String,

    /// Prefix of the timestamped dump files
    #[arg(long, env = "ZEXPORT_DUMP_PREFIX", default_value = "data")]
    dump_prefix: String,

    /// Address to listen on
    #[arg(long, env = "ZEXPORT_LISTEN", default_value = "0.0.0.0:8000")]
    listen: SocketAddr,

    /// Seconds between liveness probes
    #[arg(long, env = "ZEXPORT_PROBE_INTERVAL", default_value_t = 600)]
    probe_interval: u64,

    /// Connect timeout in seconds
    #[arg(long, env = "ZEXPORT_CONNECT_TIMEOUT", default_value_t = 300)]
    connect_timeout: u64,

    /// Probe timeout in seconds
    #[arg(long, env = "ZEXPORT_PROBE_TIMEOUT", default_value_t = 30)]
    probe_timeout: u64,

    /// Full export search timeout in seconds
    #[arg(long, env = "ZEXPORT_SEARCH_TIMEOUT", default_value_t = 1800)]
    search_timeout: u64,

    /// Downstream push timeout in seconds
    #[arg(long, env = "ZEXPORT_PUSH_TIMEOUT", default_value_t = 60)]
    push_timeout: u64,

    /// Records fetched per yaz-client `show` command
    #[arg(long, env = "ZEXPORT_BATCH_SIZE", default_value_t = 100)]
    batch_size: usize,

    /// Log filter (overrides ZEXPORT_LOG and RUST_LOG)
    #[arg(long)]
    log_filter: Option<String>,

    /// Log line format (text, json)
    #[arg(long, env = "ZEXPORT_LOG_FORMAT", default_value = "text", value_parser = LogFormat::parse)]
    log_format: LogFormat,

    /// Log to stderr only, without rotating files
    #[arg(long, env = "ZEXPORT_NO_LOG_FILE")]
    no_log_file: bool,
}

impl Cli {
    fn service_config(&self) -> Result<ServiceConfig, String> {
        let options = SessionOptions {
            connect_timeout_secs: self.connect_timeout,
            probe_timeout_secs: self.probe_timeout,
            search_timeout_secs: self.search_timeout,
            probe_interval_secs: self.probe_interval,
            ..SessionOptions::default()
        };

        let mut builder = ServiceConfig::builder()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .session_options(options)
            .query(QuerySyntax::parse(&self.query_syntax), &self.query)
            .yaz_client(&self.yaz_client)
            .fetch_batch_size(self.batch_size)
            .current_file_name(&self.current_file)
            .dump_prefix(&self.dump_prefix)
            .push_timeout_secs(self.push_timeout);

        if let Some(ref url) = self.upload_url {
            builder = builder.upload_url(url);
        }
        if let Some(ref dir) = self.data_dir {
            builder = builder.data_dir(dir);
        }

        builder.build()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.service_config().map_err(anyhow::Error::msg).context("Invalid configuration")?;

    let mut log_config = LogConfig::new(log_dir(&config.data_dir)).with_format(cli.log_format);
    if let Some(ref filter) = cli.log_filter {
        log_config = log_config.with_filter(filter);
    }
    if cli.no_log_file {
        log_config = log_config.console_only();
    }
    let _logging_guard = init_logging(log_config);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting zexport");

    let state = Arc::new(
        ZexportState::from_config(config).await.context("Failed to initialize service state")?,
    );

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("Failed to bind {}", cli.listen))?;
    tracing::info!(addr = %cli.listen, "Listening");

    axum::serve(listener, routes::router(state.clone()))
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await
        .context("HTTP server failed")?;

    tracing::info!("zexport stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, then stop the service state.
///
/// Runs before the HTTP server drains so a long export is aborted rather
/// than awaited.
async fn shutdown_signal(state: Arc<ZexportState>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown signal received");
    state.shutdown().await;
}
