//! Health and metrics endpoint

use ccm_lb::PrometheusMetrics;
use http_body_util::Full;
use hyper::{body::Bytes, server::conn::http1, service::service_fn, Method, Request, Response, StatusCode};
use hyper_util::rt::tokio::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

pub const METRICS_ADDR_ENV: &str = "OSC_CCM_METRICS_ADDR";
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:10258";

fn text(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

pub fn route<B>(req: &Request<B>, metrics: &PrometheusMetrics) -> Response<Full<Bytes>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => match metrics.gather() {
            Ok(body) => text(StatusCode::OK, body),
            Err(e) => {
                warn!(error = %e, "Failed to gather metrics");
                text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to gather metrics\n".to_string())
            }
        },
        (&Method::GET, "/healthz") => text(StatusCode::OK, "OK\n".to_string()),
        _ => text(StatusCode::NOT_FOUND, "Not Found\n".to_string()),
    }
}

/// Serves `/metrics` and `/healthz` until the listener fails
pub async fn serve(addr: SocketAddr, metrics: PrometheusMetrics) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "Metrics server listening");

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let response = route(&req, &metrics);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(%peer_addr, error = %e, "Error serving metrics connection");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccm_lb::MetricsSink;
    use http_body_util::BodyExt;
    use std::time::Duration;

    fn get(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    #[tokio::test]
    async fn test_routes() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.observe("ensure", "success", Duration::from_millis(5));

        let response = route(&get("/metrics"), &metrics);
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("ccm_reconcile_total"));

        assert_eq!(route(&get("/healthz"), &metrics).status(), StatusCode::OK);
        assert_eq!(route(&get("/nope"), &metrics).status(), StatusCode::NOT_FOUND);
    }
}
