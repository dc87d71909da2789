//! M3U playlist generation.

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::http::HeaderMap;

use crate::web::api::StreamQuery;
use crate::web::state::Service;

/// Render the channel lineup as an M3U playlist. Selector overrides in the
/// request query are propagated into every per-channel stream URL.
pub async fn playlist(
    State(service): State<Service>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");

    let suffix = stream_query_suffix(&query);

    let mut out = String::from("#EXTM3U\n");
    for channel in service.channels.iter() {
        let logo = channel
            .icon
            .as_deref()
            .map(|url| format!(" tvg-logo=\"{url}\""))
            .unwrap_or_default();
        out.push_str(&format!(
            "#EXTINF:-1 tvg-id=\"{id}\" tvg-name=\"{name}\" tvg-chno=\"{id}\"{logo},{name}\n",
            id = channel.number,
            name = channel.name,
        ));
        out.push_str(&format!(
            "http://{host}/stream/{num}{suffix}\n",
            num = channel.number
        ));
    }

    (
        [(header::CONTENT_TYPE, "audio/x-mpegurl")],
        out,
    )
        .into_response()
}

fn stream_query_suffix(query: &StreamQuery) -> String {
    match (&query.f, &query.c) {
        (Some(f), Some(c)) => format!("?f={f}&c={c}"),
        (Some(f), None) => format!("?f={f}"),
        (None, Some(c)) => format!("?c={c}"),
        (None, None) => String::new(),
    }
}
