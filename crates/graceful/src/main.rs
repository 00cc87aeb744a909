//! Graceful demo server - Entry point
//!
//! Serves a few demo routes and shuts down gracefully on SIGINT/SIGTERM.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use http::{Method, Request, StatusCode};
use hyper::body::Incoming;
use tracing::info;

use graceful::config::ConfigLoader;
use graceful::server::{respond, HttpEngine, HttpResponse, Server, ServerConfig};
use graceful::telemetry::init_telemetry;

/// Configuration file read when `--config` is not given.
const DEFAULT_CONFIG_FILE: &str = "graceful.toml";

/// Prefix for environment overrides, e.g. `GRACEFUL__SERVER__HTTP_ADDR`.
const ENV_PREFIX: &str = "GRACEFUL";

/// Upper bound for `/slow?ms=`.
const MAX_SLOW_MS: u64 = 60_000;

/// Command-line arguments.
struct Args {
    /// Path to configuration file.
    config: Option<PathBuf>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" | "-c" => {
                    config = args.next().map(PathBuf::from);
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("graceful-demo {}", env!("CARGO_PKG_VERSION"));
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {other}");
                    eprintln!("Use --help for usage information");
                    std::process::exit(1);
                }
            }
        }

        Self { config }
    }
}

fn print_help() {
    println!(
        r"Graceful demo server

USAGE:
    graceful-demo [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Path to configuration file (TOML or JSON)
    -h, --help             Print help information
    -v, --version          Print version information

ROUTES:
    GET /                  Plain greeting
    GET /slow?ms=<N>       Responds after N milliseconds
    GET /health            Liveness probe

ENVIRONMENT VARIABLES:
    GRACEFUL__SERVER__HTTP_ADDR            Bind address (default: 0.0.0.0:8080)
    GRACEFUL__SERVER__SHUTDOWN_TIMEOUT_MS  Grace period, 0 waits forever (default: 30000)
    GRACEFUL__TELEMETRY__LOGGING__LEVEL    Log filter (default: info)
    GRACEFUL__TELEMETRY__METRICS__ENABLED  Serve Prometheus metrics (default: false)
"
    );
}

async fn demo(req: Request<Incoming>) -> HttpResponse {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/") => respond(StatusCode::OK, "hello, world\n"),
        (&Method::GET, "/health") => respond(StatusCode::OK, "ok\n"),
        (&Method::GET, "/slow") => {
            let ms = slow_millis(req.uri().query());
            tokio::time::sleep(Duration::from_millis(ms)).await;
            respond(StatusCode::OK, format!("slept {ms}ms\n"))
        }
        _ => respond(StatusCode::NOT_FOUND, "not found\n"),
    }
}

fn slow_millis(query: Option<&str>) -> u64 {
    query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .find_map(|pair| pair.strip_prefix("ms="))
        .and_then(|ms| ms.parse::<u64>().ok())
        .unwrap_or(1_000)
        .min(MAX_SLOW_MS)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let loader = ConfigLoader::new()
        .with_dotenv()
        .context("failed to load .env file")?;
    let loader = match &args.config {
        Some(path) => loader
            .with_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => loader.with_optional_file(DEFAULT_CONFIG_FILE)?,
    };
    let config = loader
        .with_env_prefix(ENV_PREFIX)
        .load()
        .context("invalid configuration")?;

    init_telemetry(&config.telemetry.to_telemetry_config())
        .context("failed to initialize telemetry")?;

    let server_config = ServerConfig::from(&config.server);
    let engine = HttpEngine::new(demo);
    let server = Server::builder(engine).config(&server_config).build();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %server_config.http_addr(),
        "starting graceful demo server"
    );

    server.listen_and_serve().await?;

    info!("server exited cleanly");
    Ok(())
}
