// Copyright (c) 2026 Conclave Systems. MIT License.
// See LICENSE for details.

//! # Conclave Node
//!
//! Entry point for the `conclave-node` binary. Parses CLI arguments,
//! initializes logging and metrics, starts the consensus core, and serves
//! the JSON-RPC/WS API.
//!
//! The binary supports four subcommands:
//!
//! - `run`     — start the consensus node
//! - `init`    — initialize the data directory
//! - `status`  — query a running node's status endpoint
//! - `version` — print build version information

mod api;
mod cli;
mod executor_client;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;

use conclave_core::config::CoreConfig;
use conclave_core::executor::{MockExecutor, ValidatorExecutor};
use conclave_core::primitives::keys::Keypair;
use conclave_core::runtime::CoreRuntime;

use cli::{Commands, ConclaveNodeCli};
use executor_client::HttpExecutor;
use logging::LogFormat;
use metrics::NodeMetrics;

/// Dev mode: number of seeded validators when `--dev-validators` is
/// untouched.
const DEV_VALIDATOR_STAKE: u64 = 10_000;

/// Dev mode: finality window, short enough to watch transactions finalize
/// while you sip coffee.
const DEV_FINALITY_WINDOW_SECS: u64 = 10;

/// How often the metrics sampler mirrors core counters into gauges.
const METRICS_SAMPLE_PERIOD: std::time::Duration = std::time::Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ConclaveNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Status(args) => query_status(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// run — Full node startup sequence
// ---------------------------------------------------------------------------

/// Starts the full node: consensus core, API server, metrics endpoint.
///
/// Startup sequence:
/// 1.  Resolve paths and validate CLI config
/// 2.  Initialize logging
/// 3.  Load core configuration from the environment
/// 4.  Choose the executor (HTTP client, or mock under --dev)
/// 5.  Start the consensus core (store, scheduler, workers, timer)
/// 6.  Seed dev validators (if --dev)
/// 7.  Build metrics and the API state
/// 8.  Spawn the metrics sampler
/// 9.  Bind the RPC and metrics listeners
/// 10. Print the startup banner
/// 11. Await shutdown, then drain
async fn run_node(args: cli::RunArgs) -> Result<()> {
    // --- 1. Resolve paths and validate config ---
    let data_dir = cli::resolve_data_dir(&args.data_dir);
    if !cli::validate_log_level(&args.log_level) {
        anyhow::bail!("invalid log level: {}", args.log_level);
    }

    // --- 2. Initialize logging ---
    let log_filter = format!(
        "conclave_node={level},conclave_core={level},tower_http=warn",
        level = args.log_level
    );
    logging::init_logging(&log_filter, LogFormat::from_str_lossy(&args.log_format));

    tracing::info!(
        rpc_addr = %args.rpc_addr,
        metrics_addr = %args.metrics_addr,
        data_dir = %data_dir.display(),
        dev = args.dev,
        "starting conclave-node"
    );

    // --- 3. Load core configuration ---
    let mut config = CoreConfig::from_env().context("invalid CONCLAVE_* configuration")?;
    if args.dev {
        config.finality_window = std::time::Duration::from_secs(DEV_FINALITY_WINDOW_SECS);
    }

    // --- 4. Choose the executor ---
    let executor: Arc<dyn ValidatorExecutor> = if args.dev {
        tracing::info!("dev mode: using the in-process mock executor");
        Arc::new(MockExecutor::new())
    } else {
        let client = HttpExecutor::new(&args.executor_url)
            .map_err(|e| anyhow::anyhow!("bad executor endpoint: {e}"))?;
        tracing::info!(endpoint = %args.executor_url, "using HTTP validator executor");
        Arc::new(client)
    };

    // --- 5. Start the consensus core ---
    let runtime = if args.dev {
        CoreRuntime::start_temporary(config.clone(), executor)
            .context("failed to start consensus core (dev)")?
    } else {
        let db_path = data_dir.join("db");
        std::fs::create_dir_all(&db_path)
            .with_context(|| format!("failed to create {}", db_path.display()))?;
        CoreRuntime::start(config.clone(), &db_path, executor)
            .context("failed to start consensus core")?
    };

    // --- 6. Seed dev validators ---
    if args.dev {
        for address in seed_dev_validators(&runtime, args.dev_validators) {
            tracing::info!(address = %address, "dev validator seeded");
        }
    }

    // --- 7. Metrics and API state ---
    let node_metrics = Arc::new(NodeMetrics::new());
    let app_state = api::AppState {
        runtime: Arc::clone(&runtime),
        metrics: Arc::clone(&node_metrics),
        version: env!("CARGO_PKG_VERSION").to_string(),
        network: if args.dev { "devnet" } else { "mainnet" }.to_string(),
        admin_token: args.admin_token.clone(),
        rate_limiter: Arc::new(api::RateLimiter::new(args.rpc_rate_limit)),
    };

    // --- 8. Metrics sampler: mirror core counters into gauges ---
    let sampler_runtime = Arc::clone(&runtime);
    let sampler_metrics = Arc::clone(&node_metrics);
    let sampler = tokio::spawn(async move {
        let mut interval = tokio::time::interval(METRICS_SAMPLE_PERIOD);
        loop {
            interval.tick().await;
            if let Ok(stats) = sampler_runtime.stats() {
                sampler_metrics.transactions_pending.set(stats.pending as i64);
                sampler_metrics.transactions_queued.set(stats.queued as i64);
                sampler_metrics.workers_busy.set(stats.in_flight as i64);
                sampler_metrics
                    .validators_registered
                    .set(stats.validators as i64);
                sampler_metrics
                    .event_subscribers
                    .set(stats.subscribers as i64);
            }
        }
    });

    // --- 9. Bind listeners ---
    let api_router = api::create_router(app_state);
    let api_listener = tokio::net::TcpListener::bind(&args.rpc_addr)
        .await
        .with_context(|| format!("failed to bind RPC listener on {}", args.rpc_addr))?;
    tracing::info!("RPC/API server listening on {}", args.rpc_addr);

    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_listener = tokio::net::TcpListener::bind(&args.metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", args.metrics_addr))?;
    tracing::info!("metrics server listening on {}", args.metrics_addr);

    // --- 10. Startup banner ---
    print_startup_banner(
        &args.rpc_addr,
        &args.metrics_addr,
        &data_dir.to_string_lossy(),
        if args.dev { "Dev" } else { "Production" },
        runtime.config().worker_count,
        runtime.get_finality_window().as_secs(),
    );

    // --- 11. Await shutdown ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining");
        }
    }

    sampler.abort();
    runtime.shutdown().await;
    tracing::info!("conclave-node stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// init — Data directory initialization
// ---------------------------------------------------------------------------

/// Initializes a new node data directory:
///
/// ```text
/// {data_dir}/
///     db/       — sled store
///     config/   — node configuration
/// ```
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("conclave_node=info", LogFormat::Pretty);

    let data_dir = cli::resolve_data_dir(&args.data_dir);
    tracing::info!(data_dir = %data_dir.display(), "initializing node");

    let db_dir = data_dir.join("db");
    if db_dir.exists() && !args.force {
        anyhow::bail!(
            "data directory already initialized at {}. Use --force to overwrite.",
            data_dir.display()
        );
    }

    let config_dir = data_dir.join("config");
    std::fs::create_dir_all(&db_dir)
        .with_context(|| format!("failed to create db directory: {}", db_dir.display()))?;
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("failed to create config directory: {}", config_dir.display()))?;

    println!();
    println!("Node initialized successfully.");
    println!();
    println!("  Data directory : {}", data_dir.display());
    println!("  DB directory   : {}", db_dir.display());
    println!();
    println!(
        "Run `conclave-node run -d {}` to start the node.",
        data_dir.display()
    );

    Ok(())
}

// ---------------------------------------------------------------------------
// status — Query a running node
// ---------------------------------------------------------------------------

/// Queries a running node's status endpoint and prints the result.
async fn query_status(args: cli::StatusArgs) -> Result<()> {
    let url = format!("{}/status", args.rpc_url.trim_end_matches('/'));
    let body = http_get(&url).await?;

    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(json) => {
            println!("Node Status");
            for (label, key) in [
                ("Version", "version"),
                ("Network", "network"),
                ("Pending", "pending"),
                ("Queued", "queued"),
                ("In flight", "in_flight"),
                ("Validators", "validators"),
                ("Window (s)", "finality_window_seconds"),
                ("Timestamp", "timestamp"),
            ] {
                if let Some(value) = json.get(key) {
                    println!("  {:<11}: {}", label, value);
                }
            }
        }
        Err(_) => println!("{}", body),
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// version
// ---------------------------------------------------------------------------

/// Prints version information to stdout.
fn print_version() {
    println!("conclave-node {}", env!("CARGO_PKG_VERSION"));
    println!("core          {}", conclave_core::config::CORE_VERSION);
    if let Some(commit) = option_env!("GIT_COMMIT") {
        println!("commit        {}", commit);
    }
    if let Some(ts) = option_env!("BUILD_TIMESTAMP") {
        println!("built         {}", ts);
    }
}

// ---------------------------------------------------------------------------
// Dev mode helpers
// ---------------------------------------------------------------------------

/// Generates a deterministic 32-byte seed from an index, so dev validator
/// identities are stable across restarts.
fn generate_dev_seed(index: u64) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(b"conclave-dev-validator-");
    hasher.update(index.to_le_bytes());
    let result = hasher.finalize();
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&result);
    seed
}

/// Registers `count` deterministic validators bound to a local model.
/// Returns their addresses.
fn seed_dev_validators(
    runtime: &Arc<CoreRuntime>,
    count: u8,
) -> Vec<conclave_core::primitives::ids::Address> {
    let mut addresses = Vec::with_capacity(count as usize);
    for i in 1..=count as u64 {
        let keypair = Keypair::from_seed(&generate_dev_seed(i));
        let address = keypair.address();
        if runtime
            .registry()
            .add(
                address,
                DEV_VALIDATOR_STAKE,
                "ollama",
                "llama3",
                serde_json::json!({ "temperature": 0.0 }),
            )
            .is_ok()
        {
            addresses.push(address);
        }
    }
    addresses
}

// ---------------------------------------------------------------------------
// Startup banner
// ---------------------------------------------------------------------------

/// Prints the node startup banner with configuration summary.
fn print_startup_banner(
    rpc_addr: &str,
    metrics_addr: &str,
    data_dir: &str,
    mode: &str,
    workers: usize,
    window_secs: u64,
) {
    let lines = [
        format!("  RPC:      http://{}", rpc_addr),
        format!("  Metrics:  http://{}/metrics", metrics_addr),
        format!("  Data:     {}", data_dir),
        format!("  Mode:     {}", mode),
        format!("  Workers:  {}", workers),
        format!("  Window:   {}s", window_secs),
    ];

    let title = format!(
        "  Conclave \u{2014} Consensus Core v{}",
        env!("CARGO_PKG_VERSION")
    );

    let max_width = lines
        .iter()
        .map(|l| l.len())
        .chain(std::iter::once(title.len()))
        .max()
        .unwrap_or(50)
        + 4;

    let border = "\u{2550}".repeat(max_width);

    println!();
    println!("\u{2554}{}\u{2557}", border);
    println!("\u{2551}  {:<width$}  \u{2551}", title.trim(), width = max_width - 4);
    println!("\u{2560}{}\u{2563}", border);
    for line in &lines {
        println!("\u{2551}  {:<width$}  \u{2551}", line.trim(), width = max_width - 4);
    }
    println!("\u{255A}{}\u{255D}", border);
    println!();
}

// ---------------------------------------------------------------------------
// Shutdown signal
// ---------------------------------------------------------------------------

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// ---------------------------------------------------------------------------
// Minimal HTTP client
// ---------------------------------------------------------------------------

/// Minimal HTTP GET without pulling in a client crate for a single
/// subcommand. The status endpoint returns small JSON; nothing here needs
/// keep-alive, TLS, or redirects.
async fn http_get(url: &str) -> Result<String> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| anyhow::anyhow!("only http:// URLs are supported: {url}"))?;
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().context("bad port")?),
        None => (authority, 80),
    };

    let addr = format!("{}:{}", host, port);
    let mut stream = tokio::net::TcpStream::connect(&addr)
        .await
        .with_context(|| format!("failed to connect to {}", addr))?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host,
    );
    stream.write_all(request.as_bytes()).await?;
    stream.shutdown().await?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    let response = String::from_utf8_lossy(&buf);

    // Everything after the first blank line is the body.
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_else(|| response.to_string());
    Ok(body)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
