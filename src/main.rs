use agent_shell_bridge::config::Config;
use agent_shell_bridge::http::{create_router, AppState};
use agent_shell_bridge::tools::browser_tool::spawn_sweeper;
use anyhow::{Context, Result};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

fn setup_logging(log_level_str: &str) {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("agent_shell_bridge={},tower_http={}", level, level))
    });

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    setup_logging(&config.log_level);

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), "Starting agent-shell-bridge");
    tracing::debug!("Loaded configuration: {:?}", config);

    if which::which(&config.default_shell).is_err() {
        tracing::warn!(
            shell = %config.default_shell,
            "Configured shell is not in PATH. Terminal connections will fail to spawn."
        );
    }

    let state = AppState::new(&config);
    let registry = Arc::clone(&state.registry);
    let browsers = Arc::clone(&state.browsers);
    let sweeper = spawn_sweeper(
        Arc::clone(&browsers),
        config.browser_sweep_interval,
        config.browser_stale_after,
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let bind_addr = format!("{}:{}", config.bind_host, config.bind_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    tracing::info!(addr = %bind_addr, "Listening for terminal connections and agent requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    sweeper.abort();
    registry.shutdown();
    browsers.close_all().await;
    tracing::info!("Server shutdown.");
    Ok(())
}
