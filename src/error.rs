use http::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed range header")]
    MalformedRange,

    #[error("requested range not satisfiable")]
    RangeUnsatisfiable,

    #[error("upstream returned status {0}")]
    UpstreamStatus(StatusCode),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("upstream timed out")]
    UpstreamTimeout,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MalformedRange => StatusCode::BAD_REQUEST,
            ProxyError::RangeUnsatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            ProxyError::UpstreamStatus(_) | ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
