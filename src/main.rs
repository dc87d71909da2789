//! tunercast: HTTP gateway exposing broadcast TV tuners as streamable
//! channels with an accompanying program guide.
//!
//! Clients discover channels through an M3U playlist, read schedules through
//! XMLTV, and open live streams by channel number; the gateway multiplexes
//! those requests onto a bounded pool of physical tuners.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};

mod channels;
mod config;
mod epg;
mod error;
mod logging;
mod store;
mod tuner;
mod web;

use channels::ChannelSet;
use config::{Args, GatewayConfig};
use epg::EpgOrchestrator;
use store::{ProgramStore, SqliteStore};
use tuner::{SessionRegistry, TunerArbiter};
use web::Service;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    logging::init(&logging::LogSettings::from(&args)).expect("Failed to initialize logging");

    let config = match GatewayConfig::from_args(&args) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("configuration error: {}", e);
            return Err(e.into());
        }
    };

    info!("tunercast starting...");
    info!("  Port: {}", config.port);
    info!("  Channels config: {}", config.channels_conf.display());
    info!("  Tuners: {}", config.tuner_count);
    info!("  Preemption: {}", config.enable_preemption);
    info!("  EPG: {}", config.enable_epg);
    info!(
        "  Transcode: {:?}/{:?}",
        config.transcode_mode, config.transcode_codec
    );

    let channels = match ChannelSet::load(&config.channels_conf) {
        Ok(set) => Arc::new(set),
        Err(e) => {
            error!(
                "failed to load channels config {}: {}",
                config.channels_conf.display(),
                e
            );
            return Err(e.into());
        }
    };
    if channels.is_empty() {
        warn!("channels config defines no channels; streams and scans will do nothing");
    }

    // Probe the store file before opening it: a missing file means a cold
    // start and triggers the deep startup scan.
    let store_existed = config.epg_db.exists();
    let store: Arc<dyn ProgramStore> = match SqliteStore::open(&config.epg_db) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("failed to open guide store {}: {}", config.epg_db.display(), e);
            return Err(e.into());
        }
    };
    info!(
        "  Guide store: {} ({})",
        config.epg_db.display(),
        if store_existed { "existing" } else { "new" }
    );

    let arbiter = Arc::new(TunerArbiter::new(
        config.tuner_count,
        config.enable_preemption,
    ));
    let sessions = Arc::new(SessionRegistry::new());

    let orchestrator = Arc::new(EpgOrchestrator::new(
        Arc::clone(&arbiter),
        Arc::clone(&channels),
        Arc::clone(&store),
        Arc::clone(&config),
        !store_existed,
    ));
    if config.enable_epg {
        let _handle = Arc::clone(&orchestrator).start();
    } else {
        // No scans will ever run; stream requests must not wait.
        orchestrator.mark_ready();
    }

    let service = Service {
        config: Arc::clone(&config),
        channels,
        arbiter,
        store,
        epg: orchestrator,
        sessions: Arc::clone(&sessions),
    };

    let app = web::router(service);
    let listen_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!("Listening on http://{}", listen_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(sessions))
    .await?;

    info!("tunercast stopped");
    Ok(())
}

/// Wait for SIGINT/SIGTERM, then drain every active session before letting
/// the server exit.
async fn shutdown_signal(sessions: Arc<SessionRegistry>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    let active = sessions.count();
    if active > 0 {
        info!("shutdown: cancelling {} active session(s)", active);
        sessions.cancel_all();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while sessions.count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
    info!("shutdown: complete");
}
