//! Standalone demo: serves a toy upstream behind the circuit breaker
//! middleware so the crate can be driven end-to-end outside its test suite.

use std::path::Path;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use clap::Parser;
use circuitbreaker::config::BreakerConfig;
use circuitbreaker::middleware::CircuitBreakerLayer;
use tracing::info;

/// Circuit breaker middleware demo server.
#[derive(Parser, Debug)]
#[command(name = "circuitbreaker-demo", about = "Demo server for the circuit breaker middleware")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "circuitbreaker.toml")]
    config: String,

    /// Bind host.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Bind port.
    #[arg(long, default_value_t = 8080)]
    port: u16,
}

#[derive(serde::Deserialize)]
struct DemoConfig {
    circuit_breaker: BreakerConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config: DemoConfig = if Path::new(&cli.config).exists() {
        let contents = std::fs::read_to_string(&cli.config)?;
        toml::from_str(&contents)?
    } else {
        info!(path = %cli.config, "config file not found, using defaults");
        toml::from_str(
            r#"
            [circuit_breaker]
            max_error_rate = 0.5
            error_codes = [500, 502, 503]
            "#,
        )?
    };

    let settings = config.circuit_breaker.validate()?;
    let layer = CircuitBreakerLayer::new(&settings);

    let app = Router::new()
        .route("/", get(ok_handler))
        .route("/error", get(error_handler))
        .layer(layer.clone());

    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(address = %addr, "circuitbreaker-demo listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    layer.stop().await;
    info!("circuitbreaker-demo shut down");
    Ok(())
}

async fn ok_handler() -> StatusCode {
    StatusCode::OK
}

async fn error_handler() -> StatusCode {
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("received SIGINT"); }
        () = terminate => { info!("received SIGTERM"); }
    }
}
