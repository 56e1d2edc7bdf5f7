use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use prometheus::{Encoder, IntGauge, Opts, Registry, TextEncoder};

/// Render a registry in the Prometheus text exposition format.
pub fn render_registry(registry: &Registry) -> Result<Response> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )
        .body(Body::from(buffer))?;
    Ok(response)
}

/// Register a constant build-info gauge labelled with the crate version.
pub fn register_build_info(registry: &Registry, service: &str, version: &str) -> Result<()> {
    let opts = Opts::new("build_info", "Build metadata for traceability")
        .const_label("service", service)
        .const_label("version", version);
    let gauge = IntGauge::with_opts(opts)?;
    gauge.set(1);
    registry.register(Box::new(gauge))?;
    Ok(())
}
