//! Prometheus instrumentation and the HTTP scrape endpoint.

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::core::Collector;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Handler latency buckets, in seconds. Handlers are mostly sub-millisecond.
const DURATION_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5];

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub connections_total: Counter,
    pub connections_active: Gauge,
    /// Labelled by command name.
    pub commands_total: CounterVec,
    /// Labelled by error kind (`payload`, `unknown_command`, ...).
    pub errors_total: CounterVec,
    pub command_duration: HistogramVec,
    /// Labelled by subscription slot.
    pub subscriptions_active: GaugeVec,
    /// Labelled by event name.
    pub events_forwarded_total: CounterVec,
}

fn register<C>(registry: &Registry, collector: C) -> Result<C, prometheus::Error>
where
    C: Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let r = &registry;

        let connections_total = register(
            r,
            Counter::with_opts(Opts::new(
                "relay_connections_total",
                "WebSocket connections admitted",
            ))?,
        )?;
        let connections_active = register(
            r,
            Gauge::with_opts(Opts::new(
                "relay_connections_active",
                "WebSocket connections currently open",
            ))?,
        )?;
        let commands_total = register(
            r,
            CounterVec::new(
                Opts::new("relay_commands_total", "Commands dispatched"),
                &["command"],
            )?,
        )?;
        let errors_total = register(
            r,
            CounterVec::new(
                Opts::new("relay_errors_total", "Error events sent to clients"),
                &["kind"],
            )?,
        )?;
        let command_duration = register(
            r,
            HistogramVec::new(
                HistogramOpts::new(
                    "relay_command_duration_seconds",
                    "Time spent in command handlers",
                )
                .buckets(DURATION_BUCKETS.to_vec()),
                &["command"],
            )?,
        )?;
        let subscriptions_active = register(
            r,
            GaugeVec::new(
                Opts::new("relay_subscriptions_active", "Live change-feed subscriptions"),
                &["slot"],
            )?,
        )?;
        let events_forwarded_total = register(
            r,
            CounterVec::new(
                Opts::new(
                    "relay_events_forwarded_total",
                    "Change events queued to connections",
                ),
                &["event"],
            )?,
        )?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            commands_total,
            errors_total,
            command_duration,
            subscriptions_active,
            events_forwarded_total,
        })
    }

    /// Renders every registered family in the Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut out = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut out)?;
        Ok(out)
    }
}

/// Serves `/metrics` and `/health` on `addr` until `shutdown` is cancelled.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Serving metrics at http://{}/metrics", listener.local_addr()?);

    while let Some(accepted) = shutdown.run_until_cancelled(listener.accept()).await {
        match accepted {
            Ok((stream, _)) => {
                tokio::spawn(serve_scrape(stream, metrics.clone()));
            }
            Err(e) => tracing::warn!("Metrics listener accept failed: {}", e),
        }
    }

    tracing::info!("Metrics endpoint stopped");
    Ok(())
}

async fn serve_scrape(stream: TcpStream, metrics: Arc<Metrics>) {
    let service = service_fn(move |req: Request<Incoming>| {
        let response = route(req.uri().path(), &metrics);
        async move { Ok::<_, Infallible>(response) }
    });
    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        tracing::debug!("Scrape connection ended: {}", e);
    }
}

fn route(path: &str, metrics: &Metrics) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => match metrics.encode() {
            Ok(body) => {
                let mut response = reply(StatusCode::OK, body);
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT));
                response
            }
            Err(e) => {
                tracing::error!("Metrics encoding failed: {}", e);
                reply(StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed")
            }
        },
        "/health" | "/healthz" => reply(StatusCode::OK, "OK"),
        _ => reply(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn reply(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}
