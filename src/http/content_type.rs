use axum::Json;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

pub(super) const ACTIVITY_STREAMS: &str =
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// JSON served as an ActivityStreams document.
pub(super) struct ActivityStreamsJson<T>(pub(super) T);

impl<T> IntoResponse for ActivityStreamsJson<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        let mut response = Json(self.0).into_response();
        if response.status() != StatusCode::INTERNAL_SERVER_ERROR {
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(ACTIVITY_STREAMS),
            );
        }
        response
    }
}

/// Accepts `application/activity+json` and `application/ld+json`, with any
/// parameters.
pub(super) fn is_activity_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(|mime| mime.trim().to_ascii_lowercase())
        .is_some_and(|mime| mime == "application/activity+json" || mime == "application/ld+json")
}
