//! HTTP endpoints
//!
//! `/healthz` and `/livez` always answer `ok`; `/readyz` answers `ok` once the
//! claim cache has synced. `/metrics` serves the controller's Prometheus
//! registry.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::domain::ClaimCache;
use crate::error::{Error, Result};
use crate::metrics::ControllerMetrics;

type HttpResponse = Response<Full<Bytes>>;

fn text(status: StatusCode, body: &'static str) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

/// Route a health probe.
pub fn health_response(path: &str, cache: &dyn ClaimCache) -> HttpResponse {
    match path {
        "/healthz" | "/livez" => text(StatusCode::OK, "ok"),
        "/readyz" if cache.is_synced() => text(StatusCode::OK, "ok"),
        "/readyz" => text(StatusCode::SERVICE_UNAVAILABLE, "caches not synced"),
        _ => text(StatusCode::NOT_FOUND, "not found"),
    }
}

/// Route a metrics scrape.
pub fn metrics_response(path: &str, metrics: &ControllerMetrics) -> HttpResponse {
    if path != "/metrics" {
        return text(StatusCode::NOT_FOUND, "not found");
    }
    match metrics.encode() {
        Ok((content_type, body)) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            if let Ok(value) = content_type.parse() {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            text(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics")
        }
    }
}

async fn bind(addr: &str, what: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid {} address {:?}: {}", what, addr, e)))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {}: {}", what, e)))?;
    info!("{} listening on {}", what, addr);
    Ok(listener)
}

/// Accept connections until cancelled, answering each request with `route`.
async fn serve<F>(listener: TcpListener, what: &'static str, cancel: CancellationToken, route: F) -> Result<()>
where
    F: Fn(&str) -> HttpResponse + Clone + Send + Sync + 'static,
{
    loop {
        let (stream, _) = tokio::select! {
            _ = cancel.cancelled() => {
                info!("{} stopped", what);
                return Ok(());
            }
            accepted = listener.accept() => accepted
                .map_err(|e| Error::Internal(format!("{} accept error: {}", what, e)))?,
        };

        let io = TokioIo::new(stream);
        let route = route.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let response = route(req.uri().path());
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("{} connection error: {}", what, e);
            }
        });
    }
}

pub async fn run_health_server(
    addr: &str,
    cache: Arc<dyn ClaimCache>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = bind(addr, "Health server").await?;
    serve(listener, "Health server", cancel, move |path| {
        health_response(path, cache.as_ref())
    })
    .await
}

pub async fn run_metrics_server(
    addr: &str,
    metrics: ControllerMetrics,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = bind(addr, "Metrics server").await?;
    serve(listener, "Metrics server", cancel, move |path| {
        metrics_response(path, &metrics)
    })
    .await
}
