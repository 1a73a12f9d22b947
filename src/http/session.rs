//! One HTTP/1.1 connection

use crate::metrics;
use axum::Router;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue, Version, header};
use axum::middleware::Next;
use axum::response::Response;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tower::ServiceExt;
use tracing::Instrument;

/// Value of the `server` response header
pub const SERVER_NAME: &str = "onnx-serving";

/// A single accepted connection
pub struct Session {
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    app: Router,
}

impl Session {
    pub fn new(id: u64, stream: TcpStream, peer: SocketAddr, app: Router) -> Self {
        Self {
            id,
            stream,
            peer,
            app,
        }
    }

    /// Serve requests until the connection ends
    ///
    /// Requests on one connection are handled strictly one after another. When
    /// `shutdown` flips, the in-flight request completes and the connection is
    /// closed.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Session {
            id,
            stream,
            peer,
            app,
        } = self;
        let span = tracing::debug_span!("session", id, peer = %peer);

        async move {
            metrics::connection_opened();
            tracing::debug!("Connection accepted");

            let service = hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
                app.clone().oneshot(request)
            });
            let connection = http1::Builder::new()
                .keep_alive(true)
                .serve_connection(TokioIo::new(stream), service);
            tokio::pin!(connection);

            let outcome = tokio::select! {
                result = connection.as_mut() => result,
                _ = shutdown.changed() => {
                    connection.as_mut().graceful_shutdown();
                    connection.as_mut().await
                }
            };

            match outcome {
                Ok(()) => tracing::debug!("Connection closed"),
                Err(e) if e.is_incomplete_message() => {
                    tracing::debug!("Peer closed the connection mid-request")
                }
                Err(e) => tracing::warn!(error = %e, "Connection error"),
            }
            metrics::connection_closed();
        }
        .instrument(span)
        .await
    }
}

/// Whether the connection stays open after this request
///
/// HTTP/1.1 defaults to keep-alive unless the client sent `Connection: close`;
/// HTTP/1.0 defaults to close unless it sent `Connection: keep-alive`.
pub fn wants_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let has_token = |token: &str| {
        headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };

    match version {
        Version::HTTP_10 | Version::HTTP_09 => has_token("keep-alive"),
        _ => !has_token("close"),
    }
}

/// Stamp the standard response headers
pub async fn stamp_headers(request: Request, next: Next) -> Response {
    let keep_alive = wants_keep_alive(request.version(), request.headers());
    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    headers.insert(header::SERVER, HeaderValue::from_static(SERVER_NAME));
    if !headers.contains_key(header::CONTENT_TYPE) {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }
    headers.insert(
        header::CONNECTION,
        HeaderValue::from_static(if keep_alive { "keep-alive" } else { "close" }),
    );

    response
}
