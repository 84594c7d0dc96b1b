use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body as AxumBody,
    http::{Request, Response, StatusCode},
};

/// RequestHandler defines the port for anything a route can dispatch to:
/// backends, middleware wrapping a backend, or a whole router.
///
/// Handlers never fail at the type level; transport problems are turned into
/// an HTTP status (e.g. `502 Bad Gateway`) by the implementation.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle an incoming HTTP request
    ///
    /// # Arguments
    /// * `req` - The HTTP request to handle
    ///
    /// # Returns
    /// The response to send back to the client
    async fn handle(&self, req: Request<AxumBody>) -> Response<AxumBody>;
}

/// Shared, type-erased handler stored in routing tables.
pub type SharedHandler = Arc<dyn RequestHandler>;

/// Build a plain-text response with the given status.
pub fn status_response(status: StatusCode, message: &'static str) -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from(message));
    *response.status_mut() = status;
    response
}

/// Fallback used when no route matches a request.
pub fn not_found() -> Response<AxumBody> {
    status_response(StatusCode::NOT_FOUND, "404 page not found")
}

/// Adapter turning a synchronous closure into a [`RequestHandler`].
pub struct HandlerFn<F>(pub F);

/// Wrap `f` so it can be registered on a router.
pub fn handler_fn<F>(f: F) -> SharedHandler
where
    F: Fn(Request<AxumBody>) -> Response<AxumBody> + Send + Sync + 'static,
{
    Arc::new(HandlerFn(f))
}

#[async_trait]
impl<F> RequestHandler for HandlerFn<F>
where
    F: Fn(Request<AxumBody>) -> Response<AxumBody> + Send + Sync + 'static,
{
    async fn handle(&self, req: Request<AxumBody>) -> Response<AxumBody> {
        (self.0)(req)
    }
}
