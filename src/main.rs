use clap::Parser;
use gemini_openai_proxy::config::config_search_paths;
use gemini_openai_proxy::{build_router, AppState, ProxyConfig, SharedLogger};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "gemini-openai-proxy",
    about = "OpenAI-compatible chat completions endpoint backed by Google Gemini",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config and PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// JSONL request log path (overrides config)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gemini_openai_proxy=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = ProxyConfig::find_and_load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(log_file) = cli.log_file {
        config.logging.file = Some(log_file);
    }

    let logger = SharedLogger::new(config.logging.file.as_deref(), config.logging.max_entries)?;

    info!("gemini-openai-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("  Upstream:  {}/{}", config.upstream.base_url, config.upstream.api_version);
    info!("  Default:   {}", config.models.default);
    info!("  Aliases:   {} mapped", config.models.aliases.len());
    info!(
        "  Images:    {}",
        if config.images.fetch_remote { "fetch remote" } else { "inline only" }
    );
    if let Some(ref path) = config.logging.file {
        info!("  Log file:  {}", path.display());
    }

    logger.info(
        "startup",
        format!(
            "Starting gemini-openai-proxy upstream={} bind={}",
            config.upstream.base_url,
            config.bind_addr()
        ),
    );

    let bind_addr = config.bind_addr();
    let state = Arc::new(AppState::from_config(config, logger)?);
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);
    info!("  OPENAI_BASE_URL=http://{}/v1", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
