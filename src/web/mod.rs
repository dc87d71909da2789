//! HTTP surface: playlist, XMLTV, live streams and JSON status.

pub mod api;
pub mod playlist;
pub mod state;
pub mod xmltv;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;

pub use state::Service;

/// Build the gateway router.
pub fn router(service: Service) -> Router {
    Router::new()
        .route("/playlist.m3u", get(playlist::playlist))
        .route("/lineup.m3u", get(playlist::playlist))
        .route("/xmltv.xml", get(xmltv::xmltv))
        .route("/stream/:num", get(api::stream))
        .route("/stream/:num/:format", get(api::stream_with_format))
        .route("/stream/:num/:format/:codec", get(api::stream_full))
        .route("/api/now-playing", get(api::now_playing))
        .route("/api/guide", get(api::guide))
        .route("/api/status", get(api::status))
        .with_state(service)
        .layer(CorsLayer::permissive())
}
