use crate::Body;
use futures::future;
use http::{header, Method, Request, Response, StatusCode};
use std::{
    convert::Infallible,
    task::{Context, Poll},
};
use tower::ServiceExt;
use tracing::trace;

/// The only route served by the API server.
pub const ALLOCATE_PATH: &str = "/api/v1/allocate";

/// Routes `POST /api/v1/allocate` to the allocation handler and rejects everything else.
#[derive(Clone, Debug)]
pub struct Router<H> {
    allocate: H,
}

// === impl Router ===

impl<H> Router<H> {
    pub fn new(allocate: H) -> Self {
        Self { allocate }
    }
}

impl<H, B> tower::Service<Request<B>> for Router<H>
where
    H: tower::Service<Request<B>, Response = Response<Body>, Error = Infallible>,
    H: Clone + Send + 'static,
    H::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        trace!(method = %req.method(), path = %req.uri().path(), "Routing request");
        if req.uri().path() != ALLOCATE_PATH {
            return Box::pin(future::ok(
                Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        if req.method() != Method::POST {
            return Box::pin(future::ok(
                Response::builder()
                    .status(StatusCode::METHOD_NOT_ALLOWED)
                    .header(header::ALLOW, "POST")
                    .body(Body::default())
                    .expect("method not allowed response must be valid"),
            ));
        }

        Box::pin(self.allocate.clone().oneshot(req))
    }
}
