//! Request middleware.
//!
//! [`StripPrefix`] is a routing-table handler placed in front of a backend.
//! [`request_timing_middleware`] is an Axum layer wrapped around the whole
//! listener.
use std::time::Instant;

use async_trait::async_trait;
use axum::{
    body::Body as AxumBody,
    extract::Request,
    http::{HeaderName, HeaderValue, Response, Uri, uri::PathAndQuery},
    middleware::Next,
};

use crate::ports::http_handler::{RequestHandler, SharedHandler};

/// Header recording the prefix removed by [`StripPrefix`].
pub static X_FORWARDED_PREFIX: HeaderName = HeaderName::from_static("x-forwarded-prefix");

/// Removes the first matching prefix from the request path before delegating.
pub struct StripPrefix {
    prefixes: Vec<String>,
    next: SharedHandler,
}

impl StripPrefix {
    pub fn new<I, S>(prefixes: I, next: SharedHandler) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
            next,
        }
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    /// Rewrite `req` in place. Returns the prefix that was applied, if any.
    pub fn rewrite(&self, req: &mut Request) -> Option<String> {
        let path = req.uri().path().to_string();
        let prefix = self
            .prefixes
            .iter()
            .find(|prefix| path.starts_with(prefix.as_str()))?;

        let remainder = &path[prefix.len()..];
        let new_path = if remainder.starts_with('/') {
            remainder.to_string()
        } else {
            format!("/{remainder}")
        };

        let new_uri = match rebuild_uri(req.uri(), &new_path) {
            Ok(uri) => uri,
            Err(e) => {
                tracing::warn!(path = %path, prefix = %prefix, "Cannot rewrite request URI: {}", e);
                return None;
            }
        };
        *req.uri_mut() = new_uri;

        match HeaderValue::from_str(prefix) {
            Ok(value) => {
                req.headers_mut().insert(X_FORWARDED_PREFIX.clone(), value);
            }
            Err(e) => tracing::warn!(prefix = %prefix, "Prefix is not a valid header value: {}", e),
        }

        tracing::debug!(prefix = %prefix, from = %path, to = %new_path, "Stripped path prefix");
        Some(prefix.clone())
    }
}

fn rebuild_uri(uri: &Uri, path: &str) -> Result<Uri, axum::http::Error> {
    let path_and_query = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };

    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(PathAndQuery::try_from(path_and_query)?);
    Ok(Uri::from_parts(parts)?)
}

#[async_trait]
impl RequestHandler for StripPrefix {
    async fn handle(&self, mut req: Request) -> Response<AxumBody> {
        self.rewrite(&mut req);
        self.next.handle(req).await
    }
}

/// Log start/end of a request including latency.
pub async fn request_timing_middleware(req: Request, next: Next) -> axum::response::Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();

    tracing::debug!(%method, %uri, "Started processing request");

    let response = next.run(req).await;

    tracing::info!(
        %method,
        %uri,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Completed request"
    );

    response
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode},
        middleware,
        routing::get,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::ports::http_handler::{handler_fn, status_response};

    type Seen = Arc<Mutex<Option<(String, Option<String>)>>>;

    fn recording_next() -> (SharedHandler, Seen) {
        let seen: Seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let next = handler_fn(move |req: Request<Body>| {
            let prefix = req
                .headers()
                .get(&X_FORWARDED_PREFIX)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let path_and_query = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_default();
            *sink.lock().unwrap() = Some((path_and_query, prefix));
            status_response(StatusCode::OK, "ok")
        });
        (next, seen)
    }

    async fn run(strip: &StripPrefix, uri: &str) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = strip.handle(req).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_exact_prefix_becomes_root() {
        let (next, seen) = recording_next();
        let strip = StripPrefix::new(["/stat/"], next);

        run(&strip, "/stat/").await;

        let (path, prefix) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(path, "/");
        assert_eq!(prefix.as_deref(), Some("/stat/"));
    }

    #[tokio::test]
    async fn test_longer_path_keeps_leading_slash() {
        let (next, seen) = recording_next();
        let strip = StripPrefix::new(["/stat/"], next);

        run(&strip, "/stat/us").await;

        let (path, prefix) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(path, "/us");
        assert_eq!(prefix.as_deref(), Some("/stat/"));
    }

    #[tokio::test]
    async fn test_query_is_preserved() {
        let (next, seen) = recording_next();
        let strip = StripPrefix::new(["/api"], next);

        run(&strip, "http://proxy.local/api/users?page=2").await;

        let (path, _) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(path, "/users?page=2");
    }

    #[tokio::test]
    async fn test_first_matching_prefix_wins() {
        let (next, seen) = recording_next();
        let strip = StripPrefix::new(["/a", "/a/b"], next);

        run(&strip, "/a/b/c").await;

        let (path, prefix) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(path, "/b/c");
        assert_eq!(prefix.as_deref(), Some("/a"));
    }

    #[tokio::test]
    async fn test_no_match_passes_through() {
        let (next, seen) = recording_next();
        let strip = StripPrefix::new(["/stat/"], next);

        run(&strip, "/other?x=1").await;

        let (path, prefix) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(path, "/other?x=1");
        assert_eq!(prefix, None);
    }

    #[tokio::test]
    async fn test_request_timing_middleware_passes_response() {
        let app = Router::new()
            .route("/", get(|| async { "hello" }))
            .layer(middleware::from_fn(request_timing_middleware));

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
