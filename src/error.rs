//! Error taxonomy and JSON error responses for the control API

use crate::instance::RegionClass;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Port allocation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    /// Every port in the region's partition is in use
    #[error("no free port in {region} range {start}-{end}")]
    ExhaustedRange { region: RegionClass, start: u16, end: u16 },
    /// No partition is configured for the region
    #[error("no port partition configured for region {0}")]
    UnknownRegion(RegionClass),
}

/// Process launcher failures
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// The proxy helper could not be located
    #[error("proxy helper not found at {}", path.display())]
    HelperMissing { path: PathBuf },
    /// The helper ran and exited non-zero
    #[error("proxy helper failed for {instance} (exit status {status:?}): {output}")]
    ExecutionFailed {
        instance: String,
        status: Option<i32>,
        output: String,
    },
    /// The helper did not finish in time
    #[error("proxy helper for {instance} did not finish within {}s", after.as_secs())]
    Timeout { instance: String, after: Duration },
    /// A stale process bound to the port could not be killed
    #[error("failed to free port {port}: {reason}")]
    KillFailed { port: u16, reason: String },
}

/// Journal read/write failures
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal I/O failure on {}: {source}", path.display())]
    IoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("journal {} is corrupt: {source}", path.display())]
    CorruptData {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize journal entries for {}: {source}", path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Upstream reseller failures, passed through to callers unmodified
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("invalid plan parameters: {0}")]
    InvalidParameters(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),
}

/// Errors surfaced by provision and restore
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// A later region failed after earlier siblings were launched and journaled
    #[error("plan {plan_id}: region {region} failed after launching {launched:?}: {source}")]
    PartialProvision {
        plan_id: String,
        launched: Vec<String>,
        region: RegionClass,
        #[source]
        source: Box<OrchestratorError>,
    },
}

/// Error codes reported by the control API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    /// Missing or wrong bearer token
    Unauthorized,
    /// Unknown route
    NotFound,
    /// Request body could not be parsed
    BadRequest,
    /// Reseller rejected the request parameters
    InvalidParameters,
    /// Reseller could not be reached
    UpstreamUnavailable,
    /// Reseller answered with an unexpected shape
    MalformedUpstreamResponse,
    /// Provider integration is not configured
    ProviderNotConfigured,
    /// Region port partition is full
    PortsExhausted,
    /// Proxy helper is missing
    HelperMissing,
    /// Proxy helper failed
    LaunchFailed,
    /// Journal could not be read or written
    JournalFailure,
    /// Some regions of a plan were launched before a failure
    PartialProvision,
    /// Anything else
    InternalError,
}

impl ApiErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ApiErrorCode::InvalidParameters => StatusCode::BAD_REQUEST,
            ApiErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ApiErrorCode::MalformedUpstreamResponse => StatusCode::BAD_GATEWAY,
            ApiErrorCode::ProviderNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorCode::PortsExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorCode::HelperMissing => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorCode::LaunchFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorCode::JournalFailure => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorCode::PartialProvision => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value of the `X-Api-Error` header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ApiErrorCode::Unauthorized => "UNAUTHORIZED",
            ApiErrorCode::NotFound => "NOT_FOUND",
            ApiErrorCode::BadRequest => "BAD_REQUEST",
            ApiErrorCode::InvalidParameters => "INVALID_PARAMETERS",
            ApiErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ApiErrorCode::MalformedUpstreamResponse => "MALFORMED_UPSTREAM_RESPONSE",
            ApiErrorCode::ProviderNotConfigured => "PROVIDER_NOT_CONFIGURED",
            ApiErrorCode::PortsExhausted => "PORTS_EXHAUSTED",
            ApiErrorCode::HelperMissing => "HELPER_MISSING",
            ApiErrorCode::LaunchFailed => "LAUNCH_FAILED",
            ApiErrorCode::JournalFailure => "JOURNAL_FAILURE",
            ApiErrorCode::PartialProvision => "PARTIAL_PROVISION",
            ApiErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl From<&OrchestratorError> for ApiErrorCode {
    fn from(err: &OrchestratorError) -> Self {
        match err {
            OrchestratorError::Allocation(AllocationError::ExhaustedRange { .. }) => {
                ApiErrorCode::PortsExhausted
            }
            OrchestratorError::Allocation(AllocationError::UnknownRegion(_)) => {
                ApiErrorCode::InternalError
            }
            OrchestratorError::Launch(LaunchError::HelperMissing { .. }) => ApiErrorCode::HelperMissing,
            OrchestratorError::Launch(_) => ApiErrorCode::LaunchFailed,
            OrchestratorError::Journal(_) => ApiErrorCode::JournalFailure,
            OrchestratorError::Provider(ProviderError::InvalidParameters(_)) => {
                ApiErrorCode::InvalidParameters
            }
            OrchestratorError::Provider(ProviderError::UpstreamUnavailable(_)) => {
                ApiErrorCode::UpstreamUnavailable
            }
            OrchestratorError::Provider(ProviderError::MalformedResponse(_)) => {
                ApiErrorCode::MalformedUpstreamResponse
            }
            OrchestratorError::PartialProvision { .. } => ApiErrorCode::PartialProvision,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ApiErrorCode,
    pub message: String,
    pub status: u16,
    /// Instance ids that were launched before the failure
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub launched: Vec<String>,
}

impl ErrorResponse {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
            launched: Vec::new(),
        }
    }

    pub fn from_orchestrator(err: &OrchestratorError) -> Self {
        let mut response = Self::new(ApiErrorCode::from(err), err.to_string());
        if let OrchestratorError::PartialProvision { launched, .. } = err {
            response.launched = launched.clone();
        }
        response
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }

    pub fn into_response(self) -> Response<Full<Bytes>> {
        let status = self.code.status_code();
        let header = self.code.as_header_value();
        Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .header("X-Api-Error", header)
            .body(Full::new(Bytes::from(self.to_json())))
            .expect("valid response with StatusCode enum and static headers")
    }
}

/// Create a JSON error response with an X-Api-Error header
pub fn json_error_response(code: ApiErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    ErrorResponse::new(code, message).into_response()
}
