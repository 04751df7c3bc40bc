//! HTTP surface: cached audio objects and the health document.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use std::sync::Arc;

use crate::audio_cache::AudioCache;
use crate::AppState;

/// `GET /audio/{key}.{ext}`. Keys outside the content-hash key space are
/// rejected before any lookup; single-range requests are honored.
pub async fn serve_audio(
    Path(file): Path<String>,
    headers: HeaderMap,
    State(app_state): State<Arc<AppState>>,
) -> Response {
    let Some((key, ext)) = file.rsplit_once('.') else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !AudioCache::is_valid_key(key) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let Some((bytes, format)) = app_state.audio_cache.get(key).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if format != ext {
        return StatusCode::NOT_FOUND.into_response();
    }

    let mime = AudioCache::mime_for(&format);
    let total = bytes.len() as u64;

    if let Some(range) = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|v| parse_range(v, total))
    {
        return match range {
            Some((start, end)) => {
                let slice = bytes.slice(start as usize..=end as usize);
                Response::builder()
                    .status(StatusCode::PARTIAL_CONTENT)
                    .header(header::CONTENT_TYPE, mime)
                    .header(header::ACCEPT_RANGES, "bytes")
                    .header(
                        header::CONTENT_RANGE,
                        format!("bytes {}-{}/{}", start, end, total),
                    )
                    .header(header::CACHE_CONTROL, "public, max-age=86400, immutable")
                    .body(Body::from(slice))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
            None => Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{}", total))
                .body(Body::empty())
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        };
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, "public, max-age=86400, immutable")
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Single-range parser for `bytes=a-b`, `bytes=a-`, and `bytes=-n`.
/// Returns an inclusive byte range, or None when unsatisfiable.
fn parse_range(header: &str, total: u64) -> Option<(u64, u64)> {
    if total == 0 {
        return None;
    }
    let spec = header.strip_prefix("bytes=")?;
    let (start_str, end_str) = spec.split_once('-')?;

    match (start_str.is_empty(), end_str.is_empty()) {
        // bytes=-n : final n bytes
        (true, false) => {
            let suffix: u64 = end_str.parse().ok()?;
            if suffix == 0 {
                return None;
            }
            let start = total.saturating_sub(suffix);
            Some((start, total - 1))
        }
        // bytes=a- : from a to the end
        (false, true) => {
            let start: u64 = start_str.parse().ok()?;
            if start >= total {
                return None;
            }
            Some((start, total - 1))
        }
        // bytes=a-b
        (false, false) => {
            let start: u64 = start_str.parse().ok()?;
            let end: u64 = end_str.parse().ok()?;
            if start > end || start >= total {
                return None;
            }
            Some((start, end.min(total - 1)))
        }
        (true, true) => None,
    }
}

/// `GET /health`: liveness plus per-component readiness.
pub async fn health(State(app_state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptimeSecs": app_state.started_at.elapsed().as_secs(),
        "components": {
            "identityStore": {
                "ready": true,
                "admins": app_state.identity_store.list_all().len(),
            },
            "sessions": {
                "ready": true,
                "count": app_state.registry.list().len(),
            },
            "tts": {
                "enabled": app_state.config.enable_tts,
                "providerConfigured": app_state.tts.provider_configured(),
            },
            "audioCache": {
                "entries": app_state.audio_cache.entry_count(),
                "bytes": app_state.audio_cache.total_bytes(),
            },
            "connections": app_state.connections.len(),
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(parse_range("bytes=0-4", 10), Some((0, 4)));
        assert_eq!(parse_range("bytes=5-", 10), Some((5, 9)));
        assert_eq!(parse_range("bytes=-3", 10), Some((7, 9)));
        // End clamped to the payload.
        assert_eq!(parse_range("bytes=5-100", 10), Some((5, 9)));
    }

    #[test]
    fn test_parse_range_unsatisfiable() {
        assert_eq!(parse_range("bytes=10-", 10), None);
        assert_eq!(parse_range("bytes=7-3", 10), None);
        assert_eq!(parse_range("bytes=-0", 10), None);
        assert_eq!(parse_range("bytes=-", 10), None);
        assert_eq!(parse_range("items=0-4", 10), None);
        assert_eq!(parse_range("bytes=0-4", 0), None);
        assert_eq!(parse_range("bytes=abc-4", 10), None);
    }
}
