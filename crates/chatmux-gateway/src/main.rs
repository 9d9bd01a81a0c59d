use std::net::SocketAddr;
use std::sync::Arc;

use chatmux_gateway::app;
use clap::Parser;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "chatmux-gateway", about = "OpenAI-compatible multi-provider proxy")]
struct Args {
    /// Path to the JSON config file. Falls back to CHATMUX_CONFIG, then ./chatmux.json.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatmux_gateway=info,chatmux_dispatch=info,tower_http=debug".into()),
        )
        .init();

    let args = Args::parse();
    let config_path = args.config.or_else(|| std::env::var("CHATMUX_CONFIG").ok());
    let config = chatmux_core::config::ChatmuxConfig::load(config_path.as_deref())
        .unwrap_or_else(|e| {
            warn!("Config load failed ({}), using defaults", e);
            chatmux_core::config::ChatmuxConfig::default()
        });

    let bind = config.bind.clone();
    let port = config.port;
    let state = Arc::new(app::AppState::from_config(config));
    if state.router.is_empty() {
        warn!("no providers configured - dispatch will refuse every request");
    }
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("chatmux gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
