use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use wsfed::{
    app::{AppState, build_app},
    auth::{
        data_protection::KeyedDataProtectionProvider,
        wsfed::{
            FederationData, HttpMetadataRetriever, MetadataError, MetadataParser,
            WsFederationMiddleware, WsFederationOptions,
        },
    },
    config::AppConfig,
    observability,
};

#[derive(Parser, Debug)]
#[command(version, about = "WS-Federation sign-in host", long_about = None)]
struct Args {
    /// Path to config file
    #[arg(short, long, default_value = "wsfed.toml")]
    config: PathBuf,
}

/// Placeholder until a metadata document parser is linked in. Every refresh
/// fails and is logged, so `issuer_address` must be configured.
struct UnavailableMetadataParser;

impl MetadataParser for UnavailableMetadataParser {
    fn parse(&self, _document: &[u8]) -> Result<FederationData, MetadataError> {
        Err(MetadataError::Malformed(
            "no federation metadata parser is available in this build".to_string(),
        ))
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match AppConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = observability::init_tracing(&config.observability) {
        eprintln!("{e}");
        std::process::exit(1);
    }

    tracing::info!(
        config_file = %args.config.display(),
        authentication_type = %config.wsfed.authentication_type,
        "Starting WS-Federation sign-in host"
    );

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "Sign-in host failed");
        std::process::exit(1);
    }
}

async fn run(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let options = WsFederationOptions::from_config(&config.wsfed)?;
    if options.security_token_validators.is_empty() {
        tracing::warn!("No security token validator is registered; sign-in callbacks will be rejected");
    }

    let data_protection = KeyedDataProtectionProvider::new(&config.wsfed.data_protection.secret);
    let middleware = WsFederationMiddleware::new(
        options,
        &data_protection,
        Arc::new(HttpMetadataRetriever::new(UnavailableMetadataParser)),
    )?;

    let state = AppState::new(
        Arc::new(middleware),
        config.wsfed.authentication_type.clone(),
        &data_protection,
    )?;
    let app = build_app(&config, state);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
