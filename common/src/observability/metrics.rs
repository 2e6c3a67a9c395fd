//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` is intended per process. Sessions and the discovery
//! component take an optional clone and report into the same registry.

use anyhow::{Context, Result};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::task::JoinHandle;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

/// Configuration for the built-in Prometheus scrape endpoint.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    // ---
    /// Address to bind, e.g. `127.0.0.1:9100`.
    pub bind: SocketAddr,
}

impl MetricsServerConfig {
    // ---
    pub fn new(bind: SocketAddr) -> Self {
        // ---
        Self { bind }
    }
}

/// Prometheus metrics registry + handles.
///
/// Hot-path instrumentation in the send loop is just counter increments and
/// histogram observations.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    // Audio path counters
    pub packets_sent_total: IntCounter,
    pub bytes_sent_total: IntCounter,
    pub sync_packets_sent_total: IntCounter,
    pub timing_replies_total: IntCounter,
    pub stream_interruptions_total: IntCounter,

    // Session / discovery gauges
    pub active_sessions: IntGauge,
    pub devices_discovered: IntGauge,

    // Latency histograms (seconds)
    pub negotiation_seconds: Histogram,
    pub pacing_drift_seconds: Histogram,
    pub decode_seconds: Histogram,
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the standard metrics.
    ///
    /// `process_name` is applied as a constant label (`process=<name>`).
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("raop_streamer".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let packets_sent_total = counter("rtp_packets_sent_total", "RTP audio packets sent")?;
        let bytes_sent_total = counter("rtp_bytes_sent_total", "RTP audio bytes sent")?;
        let sync_packets_sent_total =
            counter("sync_packets_sent_total", "Sync packets sent on the control channel")?;
        let timing_replies_total = counter("timing_replies_total", "Timing requests answered")?;
        let stream_interruptions_total = counter(
            "stream_interruptions_total",
            "Streams stopped by a transport error",
        )?;

        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let g = IntGauge::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };
        let active_sessions = gauge("active_sessions", "Sessions currently streaming audio")?;
        let devices_discovered =
            gauge("devices_discovered", "Distinct receiver addresses discovered")?;

        let histogram = |opts: HistogramOpts| -> Result<Histogram> {
            let h = Histogram::with_opts(opts)?;
            registry.register(Box::new(h.clone()))?;
            Ok(h)
        };
        let negotiation_seconds = histogram(HistogramOpts::new(
            "rtsp_negotiation_seconds",
            "Time from connect to RECORD acknowledged (seconds)",
        ))?;
        let pacing_drift_seconds = histogram(
            HistogramOpts::new(
                "pacing_drift_seconds",
                "How late the send loop woke up relative to its packet deadline (seconds)",
            )
            .buckets(vec![0.0005, 0.001, 0.002, 0.004, 0.008, 0.016, 0.032, 0.064]),
        )?;
        let decode_seconds = histogram(HistogramOpts::new(
            "opus_decode_seconds",
            "Whole-file Opus decode duration (seconds)",
        ))?;

        Ok(Self {
            registry,
            packets_sent_total,
            bytes_sent_total,
            sync_packets_sent_total,
            timing_replies_total,
            stream_interruptions_total,
            active_sessions,
            devices_discovered,
            negotiation_seconds,
            pacing_drift_seconds,
            decode_seconds,
        })
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<Vec<u8>> {
        // ---
        render(&self.registry)
    }

    /// Spawns the scrape endpoint (`GET /metrics`) on `cfg.bind`.
    ///
    /// Only started when a bind address is configured.
    pub fn spawn_metrics_server(&self, cfg: MetricsServerConfig) -> JoinHandle<Result<()>> {
        // ---
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let make_svc = make_service_fn(move |_conn| {
                let registry = registry.clone();
                async move {
                    Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                        let response = scrape(&req, &registry);
                        async move { Ok::<_, Infallible>(response) }
                    }))
                }
            });

            Server::try_bind(&cfg.bind)
                .with_context(|| format!("cannot bind metrics endpoint {}", cfg.bind))?
                .serve(make_svc)
                .await
                .context("metrics endpoint failed")
        })
    }
}

fn render(registry: &Registry) -> Result<Vec<u8>> {
    // ---
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("cannot encode metrics")?;
    Ok(buffer)
}

fn scrape(req: &Request<Body>, registry: &Registry) -> Response<Body> {
    // ---
    let (status, content_type, body) = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => match render(registry) {
            Ok(text) => (StatusCode::OK, TEXT_FORMAT, Body::from(text)),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                Body::from(format!("{e:#}")),
            ),
        },
        _ => (StatusCode::NOT_FOUND, "text/plain", Body::from("not found")),
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
