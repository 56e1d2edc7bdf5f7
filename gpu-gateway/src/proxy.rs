use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::guardrails::GuardRails;
use crate::load_balancer::LoadBalancer;
use crate::metrics::GatewayMetrics;
use crate::providers::GpuInstance;
use crate::resilience::{retry, BreakerRegistry, RetryError, RetryPolicy, Retryable};
use crate::usage::UsageRecorder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Https,
    Ws,
    Mcp,
    OpenInference,
}

impl ProxyProtocol {
    /// ws and mcp ride a bidirectional socket; the rest are unary.
    pub fn is_websocket(&self) -> bool {
        matches!(self, ProxyProtocol::Ws | ProxyProtocol::Mcp)
    }
}

impl FromStr for ProxyProtocol {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "http" => Ok(ProxyProtocol::Http),
            "https" => Ok(ProxyProtocol::Https),
            "ws" => Ok(ProxyProtocol::Ws),
            "mcp" => Ok(ProxyProtocol::Mcp),
            "openinference" => Ok(ProxyProtocol::OpenInference),
            _ => Err(()),
        }
    }
}

/// Wire payload of POST /api/v1/gpu/proxy.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyPayload {
    pub protocol: String,
    pub target_url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub instance_id: Option<String>,
}

/// Normalized descriptor the proxy executes.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub protocol: ProxyProtocol,
    pub target_url: reqwest::Url,
    pub method: reqwest::Method,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
    pub instance_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0}")]
    BadRequest(String),
    #[error("no backend capacity for the request")]
    NoCapacity,
    #[error("circuit open for backend")]
    CircuitOpen { retry_after: Duration },
    #[error("backend failed after retries: {0}")]
    Upstream(String),
    #[error("deadline expired")]
    Timeout,
}

impl ForwardRequest {
    pub fn from_payload(payload: ProxyPayload) -> Result<Self, ProxyError> {
        let protocol = payload
            .protocol
            .parse::<ProxyProtocol>()
            .map_err(|_| ProxyError::BadRequest(format!("unknown protocol '{}'", payload.protocol)))?;
        let target_url = reqwest::Url::parse(&payload.target_url)
            .map_err(|err| ProxyError::BadRequest(format!("invalid target_url: {err}")))?;
        let method = match payload.method.as_deref() {
            None => reqwest::Method::GET,
            Some(raw) => reqwest::Method::from_bytes(raw.as_bytes())
                .map_err(|_| ProxyError::BadRequest(format!("invalid method '{raw}'")))?,
        };
        let body = payload.body.map(|value| match value {
            serde_json::Value::String(text) => Bytes::from(text),
            other => Bytes::from(other.to_string()),
        });
        Ok(Self {
            protocol,
            target_url,
            method,
            headers: payload.headers,
            body,
            instance_id: payload.instance_id,
        })
    }
}

/// Hop-by-hop headers never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|hop| name.eq_ignore_ascii_case(hop))
}

/// Upstream response handed back to the handler. The body is streamed, not
/// buffered.
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    upstream: reqwest::Response,
}

impl ProxyResponse {
    pub fn into_axum_response(self) -> axum::response::Response {
        let mut builder = axum::response::Response::builder().status(self.status);
        if let Some(headers) = builder.headers_mut() {
            *headers = self.headers;
        }
        builder
            .body(Body::from_stream(self.upstream.bytes_stream()))
            .unwrap_or_else(|_| {
                axum::response::Response::new(Body::from("failed to assemble proxy response"))
            })
    }

    pub async fn bytes(self) -> Result<Bytes, ProxyError> {
        self.upstream.bytes().await.map_err(|err| ProxyError::Upstream(err.to_string()))
    }
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error("backend returned {0}")]
    RetryableStatus(StatusCode),
    #[error("network error: {0}")]
    Network(String),
    #[error("circuit open")]
    Breaker { retry_after: Duration },
}

impl Retryable for AttemptError {
    fn is_retryable(&self) -> bool {
        // CircuitOpen is retryable so backoff can bridge into half-open.
        true
    }
}

struct ReleaseGuard {
    lb: Arc<LoadBalancer>,
    metrics: Arc<GatewayMetrics>,
    instance_id: String,
}

impl ReleaseGuard {
    fn new(lb: Arc<LoadBalancer>, metrics: Arc<GatewayMetrics>, instance: &GpuInstance) -> Self {
        lb.on_dispatch(instance);
        metrics.connection_dispatched();
        Self { lb, metrics, instance_id: instance.id.clone() }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        // Runs on every exit path: success, error, panic, cancellation.
        self.lb.on_release(&self.instance_id);
        self.metrics.connection_released();
    }
}

/// Streams inference traffic to a chosen backend with retries, circuit
/// breaking and post-call cost accounting.
#[derive(Clone)]
pub struct InferenceProxy {
    client: reqwest::Client,
    lb: Arc<LoadBalancer>,
    breakers: BreakerRegistry,
    guardrails: GuardRails,
    usage: UsageRecorder,
    metrics: Arc<GatewayMetrics>,
    retry_policy: RetryPolicy,
    deadline: Duration,
}

impl InferenceProxy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: reqwest::Client,
        lb: Arc<LoadBalancer>,
        breakers: BreakerRegistry,
        guardrails: GuardRails,
        usage: UsageRecorder,
        metrics: Arc<GatewayMetrics>,
        retry_policy: RetryPolicy,
        deadline: Duration,
    ) -> Self {
        Self { client, lb, breakers, guardrails, usage, metrics, retry_policy, deadline }
    }

    /// Resolve the target instance: descriptor pin first, else LB pick.
    pub fn select_instance(
        &self,
        request: &ForwardRequest,
        candidates: &[GpuInstance],
    ) -> Result<GpuInstance, ProxyError> {
        if let Some(wanted) = &request.instance_id {
            return candidates
                .iter()
                .find(|candidate| &candidate.id == wanted)
                .cloned()
                .ok_or_else(|| ProxyError::BadRequest(format!("unknown instance '{wanted}'")));
        }
        let picked = self.lb.pick(candidates).map_err(|_| ProxyError::NoCapacity)?;
        self.metrics.record_lb_pick(self.lb.strategy().as_str());
        Ok(picked)
    }

    /// Unary forward. The whole call is wrapped breaker(retry(attempt)) keyed
    /// by the instance's provider.
    pub async fn forward(
        &self,
        tenant_id: Uuid,
        request: ForwardRequest,
        instance: GpuInstance,
    ) -> Result<ProxyResponse, ProxyError> {
        let guard = ReleaseGuard::new(self.lb.clone(), self.metrics.clone(), &instance);
        let started = Instant::now();
        let deadline = started + self.deadline;
        let breaker = self.breakers.get(&instance.provider);

        let outcome = retry(self.retry_policy, deadline, |attempt| {
            if attempt > 0 {
                self.metrics.record_proxy_retry();
            }
            let request = request.clone();
            let breaker = breaker.clone();
            async move {
                let permit = match breaker.acquire() {
                    Ok(permit) => permit,
                    Err(open) => {
                        return Err(AttemptError::Breaker { retry_after: open.retry_after })
                    }
                };
                let remaining = deadline.saturating_duration_since(Instant::now());
                let mut builder = self
                    .client
                    .request(request.method.clone(), request.target_url.clone())
                    .timeout(remaining);
                for (name, value) in &request.headers {
                    if !is_hop_by_hop(name) {
                        builder = builder.header(name.as_str(), value.as_str());
                    }
                }
                if let Some(body) = &request.body {
                    builder = builder.body(body.clone());
                }
                match builder.send().await {
                    Ok(response) => {
                        let status = response.status();
                        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                            permit.failure();
                            Err(AttemptError::RetryableStatus(status))
                        } else {
                            permit.success();
                            Ok(response)
                        }
                    }
                    Err(err) => {
                        permit.failure();
                        Err(AttemptError::Network(err.to_string()))
                    }
                }
            }
        })
        .await;

        let elapsed = started.elapsed();
        match outcome {
            Ok(response) => {
                self.lb.on_response_time(&instance, elapsed);
                self.metrics.observe_proxy_latency(elapsed.as_secs_f64());
                self.settle(tenant_id, &instance, elapsed).await;
                drop(guard);
                let status = response.status();
                let mut headers = HeaderMap::new();
                for (name, value) in response.headers() {
                    if !is_hop_by_hop(name.as_str()) {
                        if let (Ok(name), Ok(value)) = (
                            HeaderName::from_bytes(name.as_str().as_bytes()),
                            HeaderValue::from_bytes(value.as_bytes()),
                        ) {
                            headers.insert(name, value);
                        }
                    }
                }
                debug!(instance = %instance.id, %status, "proxied backend call");
                Ok(ProxyResponse { status, headers, upstream: response })
            }
            Err(RetryError::DeadlineExpired) => {
                self.settle(tenant_id, &instance, elapsed).await;
                Err(ProxyError::Timeout)
            }
            Err(RetryError::Inner(AttemptError::Breaker { retry_after })) => {
                Err(ProxyError::CircuitOpen { retry_after })
            }
            Err(RetryError::Inner(err)) => {
                self.settle(tenant_id, &instance, elapsed).await;
                Err(ProxyError::Upstream(err.to_string()))
            }
        }
    }

    /// Bridge an upgraded client socket to the backend until either side
    /// closes or the deadline fires. Cost accrues for the bridge lifetime.
    pub async fn bridge_websocket(
        &self,
        tenant_id: Uuid,
        client_socket: WebSocket,
        request: ForwardRequest,
        instance: GpuInstance,
    ) {
        let _guard = ReleaseGuard::new(self.lb.clone(), self.metrics.clone(), &instance);
        let started = Instant::now();
        let breaker = self.breakers.get(&instance.provider);

        let permit = match breaker.acquire() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(instance = %instance.id, "breaker open, dropping websocket bridge");
                return;
            }
        };
        let backend = match connect_async(request.target_url.as_str()).await {
            Ok((stream, _)) => {
                permit.success();
                stream
            }
            Err(err) => {
                permit.failure();
                warn!(instance = %instance.id, ?err, "websocket dial failed");
                return;
            }
        };

        let (mut backend_tx, mut backend_rx) = backend.split();
        let (mut client_tx, mut client_rx) = client_socket.split();
        let deadline = tokio::time::sleep(self.deadline);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                from_client = client_rx.next() => {
                    match from_client {
                        Some(Ok(message)) => {
                            let Some(outbound) = client_to_backend(message) else { break };
                            if backend_tx.send(outbound).await.is_err() {
                                break;
                            }
                        }
                        _ => break,
                    }
                }
                from_backend = backend_rx.next() => {
                    match from_backend {
                        Some(Ok(message)) => {
                            let Some(outbound) = backend_to_client(message) else { break };
                            if client_tx.send(outbound).await.is_err() {
                                break;
                            }
                        }
                        _ => break,
                    }
                }
            }
        }

        let elapsed = started.elapsed();
        self.lb.on_response_time(&instance, elapsed);
        self.metrics.observe_proxy_latency(elapsed.as_secs_f64());
        self.settle(tenant_id, &instance, elapsed).await;
    }

    /// Post-call accounting: cost = elapsed hours x price-per-hour.
    async fn settle(&self, tenant_id: Uuid, instance: &GpuInstance, elapsed: Duration) {
        let cost = elapsed.as_secs_f64() / 3600.0 * instance.price_per_hour;
        self.guardrails.record(tenant_id, cost).await;
        self.usage
            .record(tenant_id, &instance.provider, &instance.id, elapsed.as_secs_f64(), cost)
            .await;
    }
}

fn client_to_backend(message: AxumMessage) -> Option<WsMessage> {
    match message {
        AxumMessage::Text(text) => Some(WsMessage::Text(text)),
        AxumMessage::Binary(data) => Some(WsMessage::Binary(data)),
        AxumMessage::Ping(data) => Some(WsMessage::Ping(data)),
        AxumMessage::Pong(data) => Some(WsMessage::Pong(data)),
        AxumMessage::Close(_) => None,
    }
}

fn backend_to_client(message: WsMessage) -> Option<AxumMessage> {
    match message {
        WsMessage::Text(text) => Some(AxumMessage::Text(text)),
        WsMessage::Binary(data) => Some(AxumMessage::Binary(data)),
        WsMessage::Ping(data) => Some(AxumMessage::Ping(data)),
        WsMessage::Pong(data) => Some(AxumMessage::Pong(data)),
        WsMessage::Close(_) => None,
        WsMessage::Frame(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_parses_into_descriptor() {
        let payload = ProxyPayload {
            protocol: "http".into(),
            target_url: "http://backend:9000/v1/completions".into(),
            method: Some("POST".into()),
            headers: HashMap::from([("Content-Type".into(), "application/json".into())]),
            body: Some(serde_json::json!({"prompt": "hi"})),
            instance_id: None,
        };
        let request = ForwardRequest::from_payload(payload).unwrap();
        assert_eq!(request.protocol, ProxyProtocol::Http);
        assert_eq!(request.method, reqwest::Method::POST);
        assert!(request.body.is_some());
    }

    #[test]
    fn bad_protocol_and_url_are_rejected() {
        let payload = ProxyPayload {
            protocol: "gopher".into(),
            target_url: "http://backend".into(),
            method: None,
            headers: HashMap::new(),
            body: None,
            instance_id: None,
        };
        assert!(matches!(
            ForwardRequest::from_payload(payload),
            Err(ProxyError::BadRequest(_))
        ));

        let payload = ProxyPayload {
            protocol: "http".into(),
            target_url: "not a url".into(),
            method: None,
            headers: HashMap::new(),
            body: None,
            instance_id: None,
        };
        assert!(matches!(
            ForwardRequest::from_payload(payload),
            Err(ProxyError::BadRequest(_))
        ));
    }

    #[test]
    fn websocket_protocols_are_flagged() {
        assert!(ProxyProtocol::Ws.is_websocket());
        assert!(ProxyProtocol::Mcp.is_websocket());
        assert!(!ProxyProtocol::Http.is_websocket());
        assert!(!ProxyProtocol::OpenInference.is_websocket());
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-type"));
    }

    #[test]
    fn string_body_forwards_raw() {
        let payload = ProxyPayload {
            protocol: "http".into(),
            target_url: "http://backend".into(),
            method: None,
            headers: HashMap::new(),
            body: Some(serde_json::Value::String("raw text".into())),
            instance_id: None,
        };
        let request = ForwardRequest::from_payload(payload).unwrap();
        assert_eq!(request.body.unwrap(), Bytes::from("raw text"));
    }
}
