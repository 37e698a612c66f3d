//! Per-Request Handling
//!
//! Adapts hyper requests to engine interactions: session cookie
//! resolution, form decoding, and mapping the engine's `View` back to
//! HTTP responses (post/redirect/get included).

use crate::ingress::FlowDef;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use http::{HeaderMap, Method, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper::body::Incoming;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::Instrument;
use trellis_core::Direction;
use trellis_runtime::{Engine, FormData, Interaction, SessionHandle, View};
use uuid::Uuid;

const SESSION_COOKIE: &str = "trellis_sid";

pub(crate) async fn handle_request(
    engine: Engine,
    flows: Arc<HashMap<String, Arc<FlowDef>>>,
    req: Request<Incoming>,
    peer: Option<SocketAddr>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let request_id = Uuid::new_v4();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let span = tracing::info_span!(
        "HTTPRequest",
        trellis.http.method = %method,
        trellis.http.path = %path,
        trellis.http.request_id = %request_id
    );

    async move {
        let (parts, body) = req.into_parts();

        // Read-only data export: /{flow}/data
        if let Some(entry) = path.strip_suffix("/data") {
            if flows.contains_key(entry) && method == Method::GET {
                return Ok(serve_data(
                    &engine,
                    &parts.headers,
                    parts.uri.query(),
                    entry,
                ));
            }
        }

        let Some(flow) = flows.get(&path) else {
            return Ok(html(StatusCode::NOT_FOUND, "Not Found".to_string()));
        };

        let (handle, new_session) = match session_from_cookie(&engine, &parts.headers) {
            Some(handle) => (handle, None),
            None => {
                let handle = engine.store().create();
                let id = {
                    let mut session = handle.lock();
                    session.client_addr = peer.map(|p| p.to_string());
                    session.id
                };
                (handle, Some(id))
            }
        };

        if engine
            .ensure_tree(&handle, &path, || (flow.root)())
            .is_err()
        {
            return Ok(html(
                StatusCode::INTERNAL_SERVER_ERROR,
                "misconfigured flow".to_string(),
            ));
        }

        let interaction = match method {
            Method::GET => Interaction::Get,
            Method::POST => {
                let bytes = match body.collect().await {
                    Ok(collected) => collected.to_bytes(),
                    Err(err) => {
                        tracing::warn!(error = ?err, "failed to read request body");
                        return Ok(html(StatusCode::BAD_REQUEST, "bad request".to_string()));
                    }
                };
                match decode_form(&bytes) {
                    Ok(form) => Interaction::Post(form),
                    Err(err) => {
                        tracing::warn!(error = %err, "undecodable form body");
                        return Ok(html(StatusCode::BAD_REQUEST, "bad request".to_string()));
                    }
                }
            }
            _ => {
                return Ok(html(
                    StatusCode::METHOD_NOT_ALLOWED,
                    "method not allowed".to_string(),
                ));
            }
        };

        let view = match engine.process(&handle, &path, interaction) {
            Ok(view) => view,
            Err(err) => {
                tracing::error!(error = %err, "engine rejected interaction");
                return Ok(html(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                ));
            }
        };

        let mut response = match view {
            View::Page(markup) | View::Working(markup) => html(StatusCode::OK, markup),
            View::Redirect => Response::builder()
                .status(StatusCode::SEE_OTHER)
                .header(LOCATION, &path)
                .body(Full::new(Bytes::new()))
                .unwrap(),
            View::Failure(markup) => html(StatusCode::INTERNAL_SERVER_ERROR, markup),
        };

        if let Some(id) = new_session {
            let cookie = format!("{SESSION_COOKIE}={id}; Path=/; HttpOnly");
            response
                .headers_mut()
                .insert(SET_COOKIE, cookie.parse().expect("valid cookie header"));
        }
        Ok(response)
    }
    .instrument(span)
    .await
}

fn serve_data(
    engine: &Engine,
    headers: &HeaderMap,
    query: Option<&str>,
    entry: &str,
) -> Response<Full<Bytes>> {
    let Some(handle) = session_from_cookie(engine, headers) else {
        return html(StatusCode::NOT_FOUND, "no session".to_string());
    };
    let Ok(table) = engine.collect(&handle, entry) else {
        return html(StatusCode::NOT_FOUND, "no data".to_string());
    };
    if query.is_some_and(|q| q.contains("format=csv")) {
        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/csv; charset=utf-8")
            .body(Full::new(Bytes::from(table.to_csv())))
            .unwrap()
    } else {
        let body = serde_json::to_string(&table).unwrap_or_else(|_| "{}".to_string());
        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .unwrap()
    }
}

fn session_from_cookie(engine: &Engine, headers: &HeaderMap) -> Option<SessionHandle> {
    let id = session_id_from_cookies(headers)?;
    engine.store().get(id)
}

fn session_id_from_cookies(headers: &HeaderMap) -> Option<Uuid> {
    for value in headers.get_all(COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some(id) = pair.trim().strip_prefix(SESSION_COOKIE) {
                if let Some(id) = id.strip_prefix('=') {
                    if let Ok(parsed) = Uuid::parse_str(id) {
                        return Some(parsed);
                    }
                }
            }
        }
    }
    None
}

/// Decode an `application/x-www-form-urlencoded` body into [`FormData`].
/// `direction` and `step` are protocol fields; everything else is an
/// element value.
pub(crate) fn decode_form(bytes: &[u8]) -> Result<FormData, serde_urlencoded::de::Error> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(bytes)?;
    let mut form = FormData::default();
    for (key, value) in pairs {
        match key.as_str() {
            "direction" => {
                form.direction = if value == "back" {
                    Direction::Back
                } else {
                    Direction::Forward
                };
            }
            "step" => form.step_token = Some(value),
            _ => {
                form.values.insert(key, value);
            }
        }
    }
    Ok(form)
}

fn html(status: StatusCode, markup: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Full::new(Bytes::from(markup)))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_form_splits_protocol_fields_from_values() {
        let body = b"direction=back&step=s3&answer=hello+world&n=42";
        let form = decode_form(body).unwrap();
        assert_eq!(form.direction, Direction::Back);
        assert_eq!(form.step_token.as_deref(), Some("s3"));
        assert_eq!(form.values["answer"], "hello world");
        assert_eq!(form.values["n"], "42");
    }

    #[test]
    fn decode_form_defaults_to_forward() {
        let form = decode_form(b"answer=x").unwrap();
        assert_eq!(form.direction, Direction::Forward);
        assert!(form.step_token.is_none());
    }

    #[test]
    fn cookie_header_yields_session_id() {
        let id = Uuid::new_v4();
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            format!("theme=dark; trellis_sid={id}").parse().unwrap(),
        );
        assert_eq!(session_id_from_cookies(&headers), Some(id));
    }

    #[test]
    fn missing_or_garbled_cookie_is_none() {
        let mut headers = HeaderMap::new();
        assert_eq!(session_id_from_cookies(&headers), None);
        headers.insert(COOKIE, "trellis_sid=not-a-uuid".parse().unwrap());
        assert_eq!(session_id_from_cookies(&headers), None);
    }
}
