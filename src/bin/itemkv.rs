//! itemkv server binary
//!
//! ```bash
//! # Volatile store on :8080
//! itemkv
//!
//! # Durable store
//! itemkv serve --db-path /var/lib/itemkv --port 9000
//!
//! # Container health check
//! itemkv healthcheck
//! ```

use clap::{Args, Parser, Subcommand};
use itemkv::config::{StorageMode, StoreConfig, DEFAULT_SEQUENCE_BANDWIDTH, MEMORY_MARKER};
use itemkv::server::{start_server, ServerConfig};
use itemkv::telemetry::{init_logging, TelemetryConfig};
use itemkv::AppContext;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// itemkv - transactional item store with an HTTP front
#[derive(Parser, Debug)]
#[command(name = "itemkv")]
#[command(version = itemkv::VERSION)]
#[command(about = "Transactional item store with an HTTP front", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Subcommand to execute (defaults to `serve`)
    #[command(subcommand)]
    command: Option<Commands>,

    /// Server flags used when no subcommand is given
    #[command(flatten)]
    serve: ServeArgs,

    /// Log filter (trace, debug, info, warn, error or EnvFilter directives)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Also write daily-rolling JSON logs to this directory
    #[arg(long, global = true, env = "LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Ship every log event to this URL
    #[arg(long, global = true, env = "LOG_WEBHOOK_URL")]
    log_webhook_url: Option<String>,

    /// Authorization header value for the log webhook
    #[arg(long, global = true, env = "LOG_WEBHOOK_TOKEN", hide_env_values = true)]
    log_webhook_token: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),

    /// Check a local server's /health endpoint; exit 0 when healthy
    Healthcheck {
        /// Port of the local server
        #[arg(short, long, default_value = "8080", env = "PORT")]
        port: u16,
    },

    /// Show version
    Version,
}

/// Server configuration arguments
#[derive(Args, Debug)]
struct ServeArgs {
    /// HTTP bind address
    #[arg(short, long, default_value = "0.0.0.0", env = "BIND_ADDR")]
    bind: String,

    /// HTTP port
    #[arg(short, long, default_value = "8080", env = "PORT")]
    port: u16,

    /// Store directory, or `:memory:` for a volatile store
    #[arg(long, default_value = MEMORY_MARKER, env = "DB_PATH")]
    db_path: String,

    /// Identifiers reserved per allocator lease
    #[arg(long, default_value_t = DEFAULT_SEQUENCE_BANDWIDTH, env = "SEQUENCE_BANDWIDTH")]
    sequence_bandwidth: u64,

    /// Disable permissive CORS
    #[arg(long)]
    no_cors: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let telemetry = telemetry_config(&cli);

    match cli.command {
        Some(Commands::Healthcheck { port }) => Ok(healthcheck_command(port).await),
        Some(Commands::Version) => {
            println!("itemkv {}", itemkv::VERSION);
            Ok(ExitCode::SUCCESS)
        }
        Some(Commands::Serve(args)) => {
            let _guard = init_logging(&telemetry)?;
            serve_command(args).await?;
            Ok(ExitCode::SUCCESS)
        }
        None => {
            let _guard = init_logging(&telemetry)?;
            serve_command(cli.serve).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn telemetry_config(cli: &Cli) -> TelemetryConfig {
    TelemetryConfig {
        log_level: cli.log_level.clone(),
        log_dir: cli.log_dir.clone(),
        webhook_url: cli.log_webhook_url.clone(),
        webhook_token: cli.log_webhook_token.clone(),
    }
}

/// Serve command - open the store and run the HTTP server until Ctrl-C
async fn serve_command(args: ServeArgs) -> anyhow::Result<()> {
    info!(version = %itemkv::VERSION, "itemkv starting");

    let store_config = StoreConfig {
        mode: StorageMode::from_path(&args.db_path),
        ..StoreConfig::default()
    }
    .with_sequence_bandwidth(args.sequence_bandwidth);

    let ctx = match AppContext::open(&store_config) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            error!(error = %e, path = %args.db_path, "Failed to open store");
            return Err(e.into());
        }
    };
    info!(path = %args.db_path, "Store initialized");

    let server_config = ServerConfig {
        http_addr: args.bind,
        http_port: args.port,
        enable_cors: !args.no_cors,
    };

    let served = start_server(server_config, Arc::clone(&ctx), shutdown_signal()).await;

    // Release the identifier lease and flush the store even if serving failed
    if let Err(e) = ctx.shutdown() {
        error!(error = %e, "Failed to close store cleanly");
    }
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Healthcheck command - exit status reflects `GET /health`
async fn healthcheck_command(port: u16) -> ExitCode {
    let url = format!("http://localhost:{}/health", port);
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(_) => return ExitCode::FAILURE,
    };

    match client.get(&url).send().await {
        Ok(resp) if resp.status() == reqwest::StatusCode::OK => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_bare_flags_serve() {
        let cli = Cli::try_parse_from(["itemkv", "--port", "9000", "--db-path", "/tmp/kv"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.serve.port, 9000);
        assert_eq!(cli.serve.db_path, "/tmp/kv");
    }

    #[test]
    fn test_serve_subcommand_flags() {
        let cli = Cli::try_parse_from(["itemkv", "serve", "--port", "9001", "--no-cors"]).unwrap();
        match cli.command {
            Some(Commands::Serve(args)) => {
                assert_eq!(args.port, 9001);
                assert!(args.no_cors);
            }
            other => panic!("expected serve, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_port_rejected_either_way() {
        assert!(Cli::try_parse_from(["itemkv", "--port", "abc"]).is_err());
        assert!(Cli::try_parse_from(["itemkv", "serve", "--port", "abc"]).is_err());
        assert!(Cli::try_parse_from(["itemkv", "--sequence-bandwidth", "-3"]).is_err());
    }

    #[test]
    fn test_serve_flags_conflict_with_subcommands() {
        assert!(Cli::try_parse_from(["itemkv", "--port", "9000", "version"]).is_err());
        assert!(Cli::try_parse_from(["itemkv", "version"]).is_ok());
    }
}
