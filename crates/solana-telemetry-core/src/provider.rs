// Numan Thabit 2025
//! Dual-endpoint JSON-RPC client.
//!
//! Every call goes to the primary endpoint first. A transport error, timeout,
//! non-success status or undecodable body sends the same request once to the
//! fallback endpoint. A well-formed JSON-RPC error object is an answer, not a
//! failure, and is returned as-is.

use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::Instant;
use url::Url;

use crate::metrics::TelemetryMetrics;

/// Default per-attempt deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON-RPC error codes answered the same by every node: skipped or missing
/// slots and invalid params. Other error answers are retried on the fallback.
pub const AUTHORITATIVE_RPC_CODES: [i64; 4] = [-32004, -32007, -32009, -32602];

/// Role an upstream plays for the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    /// Tried first on every call.
    Primary,
    /// Tried once when the primary fails.
    Fallback,
}

impl EndpointRole {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
        }
    }
}

/// Immutable description of one upstream.
#[derive(Clone)]
pub struct ProviderEndpoint {
    role: EndpointRole,
    url: Url,
    auth_token: Option<String>,
}

impl ProviderEndpoint {
    /// Describe an upstream reachable at `url`.
    pub fn new(role: EndpointRole, url: Url, auth_token: Option<String>) -> Self {
        Self {
            role,
            url,
            auth_token,
        }
    }

    /// Role of this endpoint.
    pub fn role(&self) -> EndpointRole {
        self.role
    }

    /// Base address requests are posted to.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl fmt::Debug for ProviderEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderEndpoint")
            .field("role", &self.role)
            .field("url", &self.url.as_str())
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Operations the client is allowed to forward upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    /// `getSlot`
    GetSlot,
    /// `getEpochInfo`
    GetEpochInfo,
    /// `getRecentPerformanceSamples`
    GetRecentPerformanceSamples,
    /// `getBlock`
    GetBlock,
    /// `getVoteAccounts`
    GetVoteAccounts,
    /// `getSupply`
    GetSupply,
    /// `getInflationRate`
    GetInflationRate,
    /// `getClusterNodes`
    GetClusterNodes,
    /// `getBlockProduction`
    GetBlockProduction,
    /// `getLeaderSchedule`
    GetLeaderSchedule,
    /// `getRecentPrioritizationFees`
    GetRecentPrioritizationFees,
    /// `getPriorityFeeEstimate`
    GetPriorityFeeEstimate,
}

impl RpcMethod {
    /// Every allow-listed method.
    pub const ALL: [RpcMethod; 12] = [
        Self::GetSlot,
        Self::GetEpochInfo,
        Self::GetRecentPerformanceSamples,
        Self::GetBlock,
        Self::GetVoteAccounts,
        Self::GetSupply,
        Self::GetInflationRate,
        Self::GetClusterNodes,
        Self::GetBlockProduction,
        Self::GetLeaderSchedule,
        Self::GetRecentPrioritizationFees,
        Self::GetPriorityFeeEstimate,
    ];

    /// Wire name of the method.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetSlot => "getSlot",
            Self::GetEpochInfo => "getEpochInfo",
            Self::GetRecentPerformanceSamples => "getRecentPerformanceSamples",
            Self::GetBlock => "getBlock",
            Self::GetVoteAccounts => "getVoteAccounts",
            Self::GetSupply => "getSupply",
            Self::GetInflationRate => "getInflationRate",
            Self::GetClusterNodes => "getClusterNodes",
            Self::GetBlockProduction => "getBlockProduction",
            Self::GetLeaderSchedule => "getLeaderSchedule",
            Self::GetRecentPrioritizationFees => "getRecentPrioritizationFees",
            Self::GetPriorityFeeEstimate => "getPriorityFeeEstimate",
        }
    }
}

impl FromStr for RpcMethod {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|method| method.as_str() == s)
            .ok_or_else(|| ProviderError::MethodNotAllowed(s.to_string()))
    }
}

/// Why a single attempt against one endpoint failed.
#[derive(Debug, Error)]
pub enum AttemptError {
    /// Connection or protocol level failure.
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
    /// The endpoint did not answer within the deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The endpoint answered with a non-success HTTP status.
    #[error("endpoint returned status {0}")]
    Status(StatusCode),
    /// The body was not a JSON-RPC response.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// The endpoint answered with an error another endpoint may not share.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Upstream error message.
        message: String,
    },
}

impl AttemptError {
    fn outcome(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::Status(_) => "status",
            Self::Malformed(_) => "malformed",
            Self::Rpc { .. } => "rpc_error",
        }
    }
}

/// Failure of a whole provider call.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The method is not on the allow-list; nothing was sent.
    #[error("method `{0}` is not on the allow-list")]
    MethodNotAllowed(String),
    /// An upstream answered with a JSON-RPC error object.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Upstream error message.
        message: String,
    },
    /// Every configured endpoint failed.
    #[error(
        "upstream unavailable (primary: {primary}; fallback: {})",
        fallback_summary(.fallback)
    )]
    Unavailable {
        /// Failure of the primary attempt.
        primary: AttemptError,
        /// Failure of the fallback attempt, when one is configured.
        fallback: Option<AttemptError>,
    },
    /// The HTTP client could not be constructed.
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
}

fn fallback_summary(fallback: &Option<AttemptError>) -> String {
    match fallback {
        Some(err) => err.to_string(),
        None => "not configured".to_string(),
    }
}

impl ProviderError {
    /// Turn an endpoint-specific RPC error into a failed attempt so the next
    /// endpoint is tried. Anything else is handed back unchanged.
    fn into_retryable(self) -> Result<AttemptError, ProviderError> {
        match self {
            Self::Rpc { code, message } if !AUTHORITATIVE_RPC_CODES.contains(&code) => {
                Ok(AttemptError::Rpc { code, message })
            }
            other => Err(other),
        }
    }

    /// JSON-RPC error code, when the failure was an upstream answer.
    pub fn rpc_code(&self) -> Option<i64> {
        match self {
            Self::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorObject {
    code: i64,
    #[serde(default)]
    message: String,
}

/// Client shared by every polling loop; built once at startup.
pub struct ProviderClient {
    http: Client,
    primary: ProviderEndpoint,
    fallback: Option<ProviderEndpoint>,
    timeout: Duration,
    metrics: TelemetryMetrics,
    next_id: AtomicU64,
}

impl fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderClient")
            .field("primary", &self.primary)
            .field("fallback", &self.fallback)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ProviderClient {
    /// Build the client with a bounded per-attempt deadline.
    pub fn new(
        primary: ProviderEndpoint,
        fallback: Option<ProviderEndpoint>,
        timeout: Duration,
        metrics: TelemetryMetrics,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(3)))
            .tcp_nodelay(true)
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .pool_max_idle_per_host(8)
            .build()
            .map_err(ProviderError::Client)?;
        Ok(Self {
            http,
            primary,
            fallback,
            timeout,
            metrics,
            next_id: AtomicU64::new(1),
        })
    }

    /// The primary endpoint.
    pub fn primary(&self) -> &ProviderEndpoint {
        &self.primary
    }

    /// The fallback endpoint, when configured.
    pub fn fallback(&self) -> Option<&ProviderEndpoint> {
        self.fallback.as_ref()
    }

    /// Forward `method` after checking it against the allow-list.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, ProviderError> {
        let method = method.parse::<RpcMethod>()?;
        self.call_method(method, params).await
    }

    /// Forward an allow-listed method, failing over once on transport, status,
    /// decode or endpoint-specific RPC errors.
    pub async fn call_method(&self, method: RpcMethod, params: Value) -> Result<Value, ProviderError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method.as_str(),
            "params": params,
        });

        let primary = match self.attempt(&self.primary, &body).await {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(err)) if self.fallback.is_none() => return Err(err),
            Ok(Err(err)) => err.into_retryable()?,
            Err(err) => err,
        };

        let Some(fallback) = self.fallback.as_ref() else {
            return Err(ProviderError::Unavailable {
                primary,
                fallback: None,
            });
        };

        tracing::debug!(
            method = method.as_str(),
            error = %primary,
            "primary upstream failed; retrying against fallback"
        );
        self.metrics.inc_fallback(method.as_str());

        match self.attempt(fallback, &body).await {
            Ok(reply) => reply,
            Err(err) => Err(ProviderError::Unavailable {
                primary,
                fallback: Some(err),
            }),
        }
    }

    /// Outer `Err` means the endpoint failed; inner result is the JSON-RPC answer.
    async fn attempt(
        &self,
        endpoint: &ProviderEndpoint,
        body: &Value,
    ) -> Result<Result<Value, ProviderError>, AttemptError> {
        let start = Instant::now();
        let outcome = self.send(endpoint, body).await;
        let label = match &outcome {
            Ok(Ok(_)) => "ok",
            Ok(Err(_)) => "rpc_error",
            Err(err) => err.outcome(),
        };
        self.metrics.record_provider_attempt(
            endpoint.role.as_str(),
            label,
            start.elapsed().as_secs_f64(),
        );
        outcome
    }

    async fn send(
        &self,
        endpoint: &ProviderEndpoint,
        body: &Value,
    ) -> Result<Result<Value, ProviderError>, AttemptError> {
        let mut request = self
            .http
            .post(endpoint.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .json(body);
        if let Some(token) = endpoint.auth_token.as_deref() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|err| self.classify(err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AttemptError::Status(status));
        }

        let reply = response.json::<Value>().await.map_err(|err| {
            if err.is_timeout() {
                AttemptError::Timeout(self.timeout)
            } else {
                AttemptError::Malformed(err.to_string())
            }
        })?;
        decode_reply(reply)
    }

    fn classify(&self, err: reqwest::Error) -> AttemptError {
        if err.is_timeout() {
            AttemptError::Timeout(self.timeout)
        } else {
            AttemptError::Transport(err)
        }
    }
}

fn decode_reply(reply: Value) -> Result<Result<Value, ProviderError>, AttemptError> {
    let Value::Object(mut object) = reply else {
        return Err(AttemptError::Malformed("response is not a JSON object".into()));
    };
    if let Some(error) = object.remove("error").filter(|e| !e.is_null()) {
        let error = serde_json::from_value::<JsonRpcErrorObject>(error)
            .map_err(|err| AttemptError::Malformed(format!("invalid error object: {err}")))?;
        return Ok(Err(ProviderError::Rpc {
            code: error.code,
            message: error.message,
        }));
    }
    match object.remove("result") {
        Some(result) => Ok(Ok(result)),
        None => Err(AttemptError::Malformed(
            "response carries neither result nor error".into(),
        )),
    }
}
