// Axum range server: exposes the payload file as one seekable HTTP resource.

use std::future::Future;
use std::io;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info};

use super::payload::PayloadSource;
use super::range::{parse_range_header, RangePlan};

/// Path segment of the one resource the server answers for
pub const PAYLOAD_RESOURCE: &str = "0";

/// Content type used when the payload name gives no hint
const DEFAULT_CONTENT_TYPE: &str = "video/mp4";

/// Players keep one connection around while scrubbing
const KEEP_ALIVE: &str = "timeout=600, max=1000";

type SharedPayload = Arc<dyn PayloadSource>;

/// HTTP server for a single payload file with byte-range support
pub struct RangeServer {
    payload: SharedPayload,
}

impl RangeServer {
    pub fn new(payload: SharedPayload) -> Self {
        Self { payload }
    }

    /// Router with the payload mounted at `/0`; anything else is a 404.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&format!("/{}", PAYLOAD_RESOURCE), get(payload_handler))
            .fallback(|| async { (StatusCode::NOT_FOUND, "not found") })
            .with_state(self.payload.clone())
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    ///
    /// In-flight responses are not drained: once `shutdown` fires the accept
    /// loop is dropped and the caller is expected to tear the process down.
    pub async fn serve_until<F>(self, listener: TcpListener, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = listener.local_addr()?;
        info!(%addr, payload = self.payload.name(), "range server listening");

        let app = self.router();
        tokio::select! {
            res = axum::serve(listener, app) => res,
            _ = shutdown => {
                debug!(%addr, "range server stopping");
                Ok(())
            }
        }
    }
}

/// GET/HEAD /0: 200 or 206 depending on the `Range` header.
async fn payload_handler(
    State(payload): State<SharedPayload>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range_header);

    let plan = RangePlan::new(
        range,
        payload.length(),
        payload.downloaded_contiguous_length(),
        payload.is_complete(),
    );
    debug!(?range, ?plan, %method, "payload request");

    let (status, start, end) = match plan {
        RangePlan::Unsatisfiable { .. } => {
            let content_range = plan.content_range().unwrap_or_default();
            return (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [
                    (header::CONTENT_RANGE, content_range),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                ],
            )
                .into_response();
        }
        RangePlan::Full { .. } => (StatusCode::OK, 0, None),
        RangePlan::Partial { start, end, .. } => (StatusCode::PARTIAL_CONTENT, start, Some(end)),
    };

    let content_length = plan.content_length();
    let body = if method == Method::HEAD || content_length == 0 {
        Body::empty()
    } else {
        // A reader that fails mid-body aborts the connection instead of
        // producing a short body.
        match payload.open_read_stream(start, end).await {
            Ok(reader) => Body::from_stream(ReaderStream::new(reader.take(content_length))),
            Err(e) => {
                error!("failed to open payload stream at {}: {}", start, e);
                return (StatusCode::INTERNAL_SERVER_ERROR, "payload unavailable").into_response();
            }
        }
    };

    let content_type = mime_guess::from_path(payload.name())
        .first_raw()
        .unwrap_or(DEFAULT_CONTENT_TYPE);

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, content_length)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONNECTION, "keep-alive")
        .header("keep-alive", KEEP_ALIVE);
    if let Some(content_range) = plan.content_range() {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }

    match builder.body(body) {
        Ok(resp) => resp,
        Err(e) => {
            error!("failed to build payload response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
