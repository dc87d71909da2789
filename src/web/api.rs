//! Stream and JSON API handlers.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::GatewayError;
use crate::store::ProgramRow;
use crate::tuner::command::StreamFormat;
use crate::tuner::session;
use crate::web::state::Service;

/// Stream selector query parameters: `?f=<container>&c=<codec>&e=<engine>`.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StreamQuery {
    pub f: Option<String>,
    pub c: Option<String>,
    pub e: Option<String>,
}

pub async fn stream(
    State(service): State<Service>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(num): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Response {
    serve_stream(service, addr, num, query.f, query.c, query.e).await
}

pub async fn stream_with_format(
    State(service): State<Service>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((num, format)): Path<(String, String)>,
    Query(query): Query<StreamQuery>,
) -> Response {
    serve_stream(service, addr, num, Some(format).or(query.f), query.c, query.e).await
}

pub async fn stream_full(
    State(service): State<Service>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((num, format, codec)): Path<(String, String, String)>,
    Query(query): Query<StreamQuery>,
) -> Response {
    serve_stream(service, addr, num, Some(format), Some(codec), query.e).await
}

async fn serve_stream(
    service: Service,
    addr: SocketAddr,
    num: String,
    container: Option<String>,
    codec: Option<String>,
    engine: Option<String>,
) -> Response {
    // An unknown channel number fails fast, before any waiting or leasing.
    let Some(channel) = service.channels.get(&num) else {
        return GatewayError::ChannelNotFound(num).into_response();
    };

    // Early requests wait for the startup scan to finish or be skipped.
    service.epg.wait_ready().await;

    let format = StreamFormat::resolve(
        container.as_deref(),
        codec.as_deref(),
        engine.as_deref(),
        service.config.transcode_mode,
        service.config.transcode_codec,
    );
    info!(
        "stream: channel {} ({}) for {} as {:?}/{:?}/{:?}",
        channel.number, channel.name, addr, format.container, format.codec, format.engine
    );

    match session::open_stream(
        &service.config,
        &service.arbiter,
        &service.sessions,
        channel,
        format,
        addr.to_string(),
    )
    .await
    {
        Ok(live) => {
            // Headers only exist now that the demodulator is running; any
            // later failure tears the session down without a status change.
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, live.content_type)
                .header(header::CONNECTION, "keep-alive")
                .header(header::CACHE_CONTROL, "no-cache, no-store")
                .body(Body::from_stream(ReceiverStream::new(live.body)))
                .unwrap_or_else(|e| {
                    error!("stream: response build failed: {}", e);
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                })
        }
        Err(e) => e.into_response(),
    }
}

/// One entry of the now-playing snapshot.
#[derive(Debug, Serialize)]
pub struct NowPlayingEntry {
    pub channel: String,
    pub name: String,
    pub title: String,
    pub description: String,
    pub start_time: i64,
    pub end_time: i64,
}

pub async fn now_playing(State(service): State<Service>) -> Response {
    let now = Utc::now().timestamp_millis();
    match service.store.select_active(now) {
        Ok(rows) => {
            let entries: Vec<NowPlayingEntry> = rows
                .into_iter()
                .filter(|r| r.start_time <= now)
                .map(|r| NowPlayingEntry {
                    name: service
                        .channels
                        .get(&r.channel)
                        .map(|c| c.name.clone())
                        .unwrap_or_default(),
                    channel: r.channel,
                    title: r.title,
                    description: r.description,
                    start_time: r.start_time,
                    end_time: r.end_time,
                })
                .collect();
            Json(entries).into_response()
        }
        Err(e) => {
            error!("now-playing: guide query failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Guide window exposed by the JSON API.
const GUIDE_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

pub async fn guide(State(service): State<Service>) -> Response {
    let now = Utc::now().timestamp_millis();
    match service.store.select_window(now, now + GUIDE_WINDOW_MS) {
        Ok(rows) => Json::<Vec<ProgramRow>>(rows).into_response(),
        Err(e) => {
            error!("guide: query failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Gateway status snapshot.
#[derive(Debug, Serialize)]
struct StatusResponse {
    tuners: Vec<crate::tuner::arbiter::TunerStatus>,
    sessions: Vec<session::SessionView>,
    epg_ready: bool,
    epg_scanning: bool,
}

pub async fn status(State(service): State<Service>) -> Response {
    Json(StatusResponse {
        tuners: service.arbiter.snapshot(),
        sessions: service.sessions.snapshot(),
        epg_ready: service.epg.is_ready(),
        epg_scanning: service.epg.is_scanning(),
    })
    .into_response()
}
