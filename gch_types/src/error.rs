use http::StatusCode;
use thiserror::Error;

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

/// Classification of a transport-level failure talking to the back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    /// The back-end did not answer within the configured timeout.
    Timeout,
    /// DNS lookup failed or no route to the back-end host.
    Route,
    /// Connection refused or reset by peer.
    Connect,
    /// Any other transport failure.
    Other,
}

/// Every failure the gateway core can surface to the HTTP layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("invalid or empty time range")]
    InvalidTimeRange,

    #[error("maximum concurrent queries reached")]
    LimiterOverflow,

    #[error("timeout while waiting in the query queue")]
    LimiterTimeout,

    #[error("storage read context canceled")]
    Canceled,

    #[error("malformed response from storage: {0}")]
    BackendProtocol(String),

    #[error("storage response status {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("storage network error: {detail}")]
    Network { kind: NetworkKind, detail: String },
}

impl GatewayError {
    /// Build the error for a non-200 back-end response.
    pub fn backend(status: u16, body: impl Into<String>) -> Self {
        Self::Backend {
            status,
            body: body.into(),
        }
    }

    /// True when the request failed in the admission queue rather than in
    /// the back-end; access logs account these separately.
    pub fn is_queue_fail(&self) -> bool {
        matches!(self, Self::LimiterOverflow | Self::LimiterTimeout)
    }

    /// The HTTP status and body the gateway answers with for this error.
    pub fn response(&self) -> (StatusCode, String) {
        match self {
            Self::InvalidTimeRange => (StatusCode::BAD_REQUEST, self.to_string()),
            Self::LimiterOverflow | Self::LimiterTimeout => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            Self::Canceled => (StatusCode::GATEWAY_TIMEOUT, self.to_string()),
            Self::BackendProtocol(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            Self::Backend { status, body } => backend_response(*status, body),
            Self::Network { kind, detail: _ } => match kind {
                NetworkKind::Timeout => {
                    (StatusCode::GATEWAY_TIMEOUT, "Storage read timeout".into())
                }
                NetworkKind::Route => (StatusCode::SERVICE_UNAVAILABLE, "Storage route error".into()),
                NetworkKind::Connect => {
                    (StatusCode::SERVICE_UNAVAILABLE, "Storage connect error".into())
                }
                NetworkKind::Other => {
                    (StatusCode::SERVICE_UNAVAILABLE, "Storage network error".into())
                }
            },
        }
    }

    pub fn status(&self) -> StatusCode {
        self.response().0
    }
}

/// Map a non-200 back-end response to a client-facing status and message.
///
/// The response is matched against the known ClickHouse exception shapes;
/// any unmatched status/body combination reports the storage as
/// unavailable.
fn backend_response(status: u16, body: &str) -> (StatusCode, String) {
    if status == 500 {
        if let Some(at) = body.find(": Limit for ") {
            let mut detail = &body[at + 8..];
            if let Some(end) = detail.find(" (version ") {
                detail = &detail[..end];
            }
            return (StatusCode::FORBIDDEN, format!("Storage read limit {detail}"));
        }
        if body.contains(": Memory limit ") {
            return (
                StatusCode::FORBIDDEN,
                "Storage read limit for memory".into(),
            );
        }
        // distributed table configuration error, e.g.
        // Code: 170, e.displayText() = DB::Exception: Requested cluster 'x' not found
        if body.starts_with("Code: 170") {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                "Storage configuration error".into(),
            );
        }
    }

    if status == 404 && body.starts_with("Code: 60. DB::Exception: Table default.") {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "Storage default tables damaged".into(),
        );
    }

    if (status == 500 && body.starts_with("Code: 427"))
        || (status == 400 && body.starts_with("Code: 427."))
    {
        return (StatusCode::BAD_REQUEST, "Incorrect regex syntax".into());
    }

    (StatusCode::SERVICE_UNAVAILABLE, "Storage unavailable".into())
}
