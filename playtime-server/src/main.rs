use std::sync::Arc;

use clap::Parser;
use playtime_core::{
    AccountActivitySource, PgStore, PlaytimeConfig, PlaytimeError, SessionStore, SourceError,
    SteamClient,
};
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use playtime_server::http::{self, HttpState};
use playtime_server::subsystems::poller::Poller;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "playtime.toml")]
    config: String,

    /// Check database and Steam API key, then exit.
    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience, production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match PlaytimeConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over service.log_level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.service.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let pool = match connect(&config).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to prepare database: {}", e);
            std::process::exit(1);
        }
    };

    let steam = match SteamClient::new(config.steam.clone()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to create Steam client: {}", e);
            std::process::exit(1);
        }
    };

    match steam.verify_api_key().await {
        Ok(()) => tracing::info!("Steam API key accepted"),
        Err(SourceError::Forbidden) => {
            eprintln!("Steam API key rejected (403)");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Failed to reach Steam Web API: {}", e);
            std::process::exit(1);
        }
    }

    if args.health {
        match playtime_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ PostgreSQL connected: {}", v),
            Err(e) => {
                println!("❌ PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }
        println!("✅ Steam API key accepted");
        println!("✅ Playtime health check passed");
        return Ok(());
    }

    let store: Arc<dyn SessionStore> = Arc::new(PgStore::new(pool));
    let source: Arc<dyn AccountActivitySource> = Arc::new(steam);

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let (control_tx, control_rx) = mpsc::channel(config.poller.control_capacity.max(1));

    let poller = Poller::new(store.clone(), source, &config.poller);
    let poller_task = tokio::spawn(poller.run(control_rx, cancel.clone()));

    let http_task = if config.http.enabled {
        let state = HttpState {
            store,
            control: control_tx,
        };
        let http_config = config.http.clone();
        let http_cancel = cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = http::start_http_server(state, &http_config, http_cancel.clone()).await
            {
                tracing::error!("HTTP server error: {}", e);
                // Stop the poller as well.
                http_cancel.cancel();
            }
        }))
    } else {
        drop(control_tx);
        None
    };

    if let Err(e) = poller_task.await {
        tracing::error!(error = %e, "Poller task failed");
    }
    if let Some(task) = http_task {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "HTTP task failed");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn connect(config: &PlaytimeConfig) -> Result<PgPool, PlaytimeError> {
    let pool = playtime_core::db::create_pool(&config.database).await?;
    playtime_core::db::apply_schema(&pool).await?;
    Ok(pool)
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutdown signal received");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
