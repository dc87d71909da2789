//! XMLTV document generation.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{TimeZone, Utc};
use log::error;

use crate::web::state::Service;

/// Render the guide as an XMLTV document. Programs whose end time has
/// already passed are filtered out.
pub async fn xmltv(State(service): State<Service>) -> Response {
    let now = Utc::now().timestamp_millis();
    let programs = match service.store.select_active(now) {
        Ok(rows) => rows,
        Err(e) => {
            error!("xmltv: guide query failed: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let mut doc = String::with_capacity(4096);
    doc.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    doc.push_str("<tv generator-info-name=\"tunercast\">\n");

    for channel in service.channels.iter() {
        doc.push_str(&format!(
            "  <channel id=\"{}\">\n    <display-name>{}</display-name>\n",
            xml_escape(&channel.number),
            xml_escape(&channel.name)
        ));
        if let Some(icon) = &channel.icon {
            doc.push_str(&format!("    <icon src=\"{}\"/>\n", xml_escape(icon)));
        }
        doc.push_str("  </channel>\n");
    }

    for program in &programs {
        doc.push_str(&format!(
            "  <programme start=\"{}\" stop=\"{}\" channel=\"{}\">\n    <title>{}</title>\n",
            format_xmltv_time(program.start_time),
            format_xmltv_time(program.end_time),
            xml_escape(&program.channel),
            xml_escape(&program.title)
        ));
        if !program.description.is_empty() {
            doc.push_str(&format!(
                "    <desc>{}</desc>\n",
                xml_escape(&program.description)
            ));
        }
        doc.push_str("  </programme>\n");
    }

    doc.push_str("</tv>\n");

    (
        [(header::CONTENT_TYPE, "application/xml; charset=utf-8")],
        doc,
    )
        .into_response()
}

/// XMLTV timestamp: `YYYYMMDDhhmmss +0000`.
pub fn format_xmltv_time(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(dt) => dt.format("%Y%m%d%H%M%S +0000").to_string(),
        _ => "19700101000000 +0000".to_string(),
    }
}

pub fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
