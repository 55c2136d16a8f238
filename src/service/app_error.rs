use crate::protocol::status;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// codec errors
    #[error("malformed protocol: {0}")]
    MalformedProtocol(String),

    #[error("encode with unknown frame type: {0}")]
    UnknownFrameType(&'static str),

    /// marker error, the read buffer does not hold a complete frame yet
    #[error("incomplete frame")]
    Incomplete,

    /// routing and upstream errors
    #[error("no route matched")]
    RouteNotFound,

    #[error("unknown cluster: {0}")]
    UnknownCluster(String),

    #[error("no healthy upstream in cluster: {0}")]
    NoHealthyUpstream(String),

    #[error("connect failed: {0}")]
    ConnectFailure(String),

    #[error("connect timeout: {0}")]
    ConnectTimeout(String),

    #[error("upstream request overflow")]
    Overflow,

    #[error("upstream request timeout")]
    RequestTimeout,

    #[error("connection pool destroyed")]
    PoolDestroyed,

    #[error("stream reset: {0}")]
    StreamReset(String),

    #[error("connection not ready: {0}")]
    ConnectionNotReady(String),

    /// general errors
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("channel recv error: {0}")]
    ChannelRecvError(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("format error: {0}")]
    FormatError(#[from] serde_json::Error),

    #[error("tracing setup error: {0}")]
    TracingError(#[from] tracing::dispatcher::SetGlobalDefaultError),
}

impl AppError {
    /// Project the error into the proxy status space, which hijacked
    /// responses translate into protocol status codes via `map_status`.
    pub fn proxy_status(&self) -> u32 {
        match self {
            AppError::RouteNotFound | AppError::UnknownCluster(_) => status::ROUTER_UNAVAILABLE,
            AppError::NoHealthyUpstream(_)
            | AppError::ConnectFailure(_)
            | AppError::ConnectTimeout(_)
            | AppError::PoolDestroyed
            | AppError::StreamReset(_)
            | AppError::ConnectionNotReady(_) => status::NO_HEALTH_UPSTREAM,
            AppError::Overflow => status::UPSTREAM_OVERFLOW,
            AppError::RequestTimeout => status::TIMEOUT,
            AppError::MalformedProtocol(_)
            | AppError::UnknownFrameType(_)
            | AppError::Incomplete => status::CODEC_EXCEPTION,
            _ => status::UNKNOWN,
        }
    }
}
