use std::{fmt, time::Duration};

use async_trait::async_trait;
use axum::{
    body::Body as AxumBody,
    extract::ConnectInfo,
    http::{
        HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Uri, header,
    },
};
use thiserror::Error;
use tracing::Instrument;
use url::Url;

use crate::{
    metrics::BackendRequestTimer,
    ports::http_handler::{RequestHandler, status_response},
    tracing_setup::create_backend_span,
};

/// Headers that only make sense for a single transport hop.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Errors related to backend construction
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackendError {
    /// Error when the destination cannot be parsed as a URL
    #[error("Invalid backend URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// Error when the destination is not an http(s) URL
    #[error("Backend URL must use http or https, got: {0}")]
    UnsupportedScheme(String),

    /// Error when the destination has no host
    #[error("Backend URL has no host: {0}")]
    MissingHost(String),

    /// Error when the upstream client cannot be built
    #[error("Failed to build upstream client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Upstream transport settings applied to every backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTransport {
    /// Budget for establishing the TCP connection
    pub dial_timeout: Duration,
    /// TCP keep-alive interval on upstream connections
    pub keep_alive: Duration,
    /// Budget for the TLS handshake once connected
    pub tls_handshake_timeout: Duration,
    /// Skip upstream certificate verification. On by default so in-cluster
    /// services with self-signed certificates work out of the box.
    pub insecure_skip_verify: bool,
}

impl Default for BackendTransport {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(30),
            tls_handshake_timeout: Duration::from_secs(10),
            insecure_skip_verify: true,
        }
    }
}

impl BackendTransport {
    /// Build the upstream client. TCP connect and TLS handshake run inside one
    /// connect future, so its budget is the sum of both phases. Proxy settings
    /// are read from `HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY`.
    fn build_client(&self) -> BackendResult<reqwest::Client> {
        let client = reqwest::Client::builder()
            .connect_timeout(self.dial_timeout + self.tls_handshake_timeout)
            .tcp_keepalive(self.keep_alive)
            .danger_accept_invalid_certs(self.insecure_skip_verify)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(client)
    }
}

/// Parse and check a backend destination.
pub fn parse_server_url(server_url: &str) -> BackendResult<Url> {
    let url = Url::parse(server_url).map_err(|source| BackendError::InvalidUrl {
        url: server_url.to_string(),
        source,
    })?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(BackendError::UnsupportedScheme(server_url.to_string()));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(BackendError::MissingHost(server_url.to_string()));
    }
    Ok(url)
}

/// A ready-to-serve reverse proxy for one route.
pub struct Backend {
    name: String,
    rule: String,
    server_url: Url,
    client: reqwest::Client,
}

impl Backend {
    /// Create a backend with the default transport.
    ///
    /// Fails (never panics) when `server_url` is not an absolute http(s) URL.
    pub fn new(name: impl Into<String>, server_url: &str) -> BackendResult<Self> {
        Self::with_transport(name, server_url, &BackendTransport::default())
    }

    pub fn with_transport(
        name: impl Into<String>,
        server_url: &str,
        transport: &BackendTransport,
    ) -> BackendResult<Self> {
        let server_url = parse_server_url(server_url)?;
        let client = transport.build_client()?;

        Ok(Self {
            name: name.into(),
            rule: String::new(),
            server_url,
            client,
        })
    }

    /// Record the rule this backend is installed under.
    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = rule.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rule(&self) -> &str {
        &self.rule
    }

    pub fn server_url(&self) -> &Url {
        &self.server_url
    }

    /// Map an incoming request URI onto the backend: the backend path and the
    /// request path are joined with a single slash, query strings are merged.
    pub fn target_url(&self, uri: &Uri) -> Url {
        let mut target = self.server_url.clone();
        target.set_path(&single_joining_slash(self.server_url.path(), uri.path()));

        let query = match (self.server_url.query(), uri.query()) {
            (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => Some(format!("{a}&{b}")),
            (Some(a), _) if !a.is_empty() => Some(a.to_string()),
            (_, Some(b)) if !b.is_empty() => Some(b.to_string()),
            _ => None,
        };
        target.set_query(query.as_deref());
        target
    }

    fn forwarded_headers(&self, req: &Request<AxumBody>) -> HeaderMap {
        let mut headers = req.headers().clone();
        remove_hop_by_hop_headers(&mut headers);
        // reqwest derives Host from the target URL
        headers.remove(header::HOST);

        if let Some(ConnectInfo(addr)) = req
            .extensions()
            .get::<ConnectInfo<std::net::SocketAddr>>()
        {
            let client_ip = addr.ip().to_string();
            let value = match req
                .headers()
                .get(X_FORWARDED_FOR)
                .and_then(|v| v.to_str().ok())
            {
                Some(prior) => format!("{prior}, {client_ip}"),
                None => client_ip,
            };
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(HeaderName::from_static(X_FORWARDED_FOR), value);
            }
        }

        let host = req
            .headers()
            .get(header::HOST)
            .cloned()
            .or_else(|| {
                req.uri()
                    .authority()
                    .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            });
        if let Some(host) = host {
            headers
                .entry(HeaderName::from_static(X_FORWARDED_HOST))
                .or_insert(host);
        }

        let proto = req.uri().scheme_str().unwrap_or("http");
        if let Ok(proto) = HeaderValue::from_str(proto) {
            headers
                .entry(HeaderName::from_static(X_FORWARDED_PROTO))
                .or_insert(proto);
        }

        headers
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("rule", &self.rule)
            .field("server_url", &self.server_url.as_str())
            .finish()
    }
}

#[async_trait]
impl RequestHandler for Backend {
    async fn handle(&self, req: Request<AxumBody>) -> Response<AxumBody> {
        let target = self.target_url(req.uri());
        let headers = self.forwarded_headers(&req);
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let mut timer = BackendRequestTimer::new(&self.name, method.as_str());
        let span = create_backend_span(&self.name, method.as_str(), &path);
        tracing::debug!(backend = %self.name, %method, %path, target = %target, "Proxying request");

        let body = reqwest::Body::wrap_stream(req.into_body().into_data_stream());
        let result = self
            .client
            .request(method.clone(), target)
            .headers(headers)
            .body(body)
            .send()
            .instrument(span.clone())
            .await;

        match result {
            Ok(upstream) => {
                let status = upstream.status();
                timer.set_status(status.as_u16());
                span.record("http.status_code", status.as_u16());

                let mut response_headers = upstream.headers().clone();
                remove_hop_by_hop_headers(&mut response_headers);
                response_headers.remove(header::TRANSFER_ENCODING);

                let mut response = Response::new(AxumBody::from_stream(upstream.bytes_stream()));
                *response.status_mut() = status;
                *response.headers_mut() = response_headers;
                response
            }
            Err(e) => {
                timer.set_status(StatusCode::BAD_GATEWAY.as_u16());
                tracing::error!(
                    backend = %self.name,
                    %method,
                    %path,
                    "Backend request failed: {}",
                    e
                );
                status_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }
}

/// Join two URL paths with exactly one slash between them.
pub fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

/// Strip hop-by-hop headers, including those listed in `Connection`.
fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}
