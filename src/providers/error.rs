use thiserror::Error;

/// Errors surfaced by transformers and upstream dispatch.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// The client request cannot be expressed in the target wire format.
    #[error("request translation failed: {0}")]
    Translation(String),

    /// The upstream answered 2xx but the body could not be parsed.
    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),
}

/// Terminal classification of one failed attempt, kept in the failover
/// ledger and reported in the `all_upstreams_failed` body. An unparseable
/// 2xx body counts as transient once its same-upstream retry is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transport,
    UpstreamTransient,
    UpstreamPermanent,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transport => write!(f, "transport"),
            ErrorClass::UpstreamTransient => write!(f, "upstream_transient"),
            ErrorClass::UpstreamPermanent => write!(f, "upstream_permanent"),
        }
    }
}

/// Statuses that mean "try the next upstream": request timeout, rate
/// limiting, server errors, and Anthropic's overloaded 529.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 529) || (500..600).contains(&status)
}

impl ProviderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::Http(_) => ErrorClass::Transport,
            ProviderError::Api { status, .. } if is_retryable_status(*status) => {
                ErrorClass::UpstreamTransient
            }
            ProviderError::Api { .. } => ErrorClass::UpstreamPermanent,
            ProviderError::Translation(_) => ErrorClass::UpstreamPermanent,
            ProviderError::MalformedResponse(_) => ErrorClass::UpstreamTransient,
        }
    }

    /// True when the failover engine should move on to the next upstream.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Transport | ErrorClass::UpstreamTransient
        )
    }
}

/// Claude error-kind string for an upstream HTTP status, used when shaping
/// error bodies returned to the client.
pub fn error_kind_for_status(status: u16) -> &'static str {
    match status {
        400 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        529 => "overloaded_error",
        _ => "api_error",
    }
}
