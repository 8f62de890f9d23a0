pub type HosterResult<T> = Result<T, HosterError>;

/// Error taxonomy shared by every layer. Transport-specific errors are
/// mapped into these kinds at the boundary that sees them, so callers
/// program against kinds, not messages.
#[derive(Debug, thiserror::Error)]
pub enum HosterError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not running: {0}")]
    NotRunning(String),

    #[error("already running: {0}")]
    AlreadyRunning(String),

    #[error("in use: {0}")]
    InUse(String),

    #[error("port conflict: {0}")]
    PortConflict(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("image pull failed: {0}")]
    ImagePullFailed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl HosterError {
    /// Stable wire code for this kind, used in API error bodies and
    /// the agent protocol envelope.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not-found",
            Self::AlreadyExists(_) => "already-exists",
            Self::NotRunning(_) => "not-running",
            Self::AlreadyRunning(_) => "already-running",
            Self::InUse(_) => "in-use",
            Self::PortConflict(_) => "port-conflict",
            Self::ConnectionFailed(_) => "connection-failed",
            Self::ImageNotFound(_) => "image-not-found",
            Self::ImagePullFailed(_) => "image-pull-failed",
            Self::Timeout(_) => "timeout",
            Self::LimitExceeded(_) => "limit-exceeded",
            Self::InvalidTransition { .. } => "invalid-transition",
            Self::BadRequest(_) => "bad-request",
            Self::Conflict(_) => "conflict",
            Self::Configuration(_) => "configuration-error",
            Self::Unauthorized => "unauthorized",
            Self::Internal(_) | Self::Io(_) | Self::Json(_) => "internal",
        }
    }

    /// Rebuild an error from a wire code and message, used when
    /// decoding agent envelopes. Unknown codes collapse to internal.
    #[must_use]
    pub fn from_kind(kind: &str, message: &str) -> Self {
        let msg = message.to_string();
        match kind {
            "not-found" => Self::NotFound(msg),
            "already-exists" => Self::AlreadyExists(msg),
            "not-running" => Self::NotRunning(msg),
            "already-running" => Self::AlreadyRunning(msg),
            "in-use" => Self::InUse(msg),
            "port-conflict" => Self::PortConflict(msg),
            "connection-failed" => Self::ConnectionFailed(msg),
            "image-not-found" => Self::ImageNotFound(msg),
            "image-pull-failed" => Self::ImagePullFailed(msg),
            "timeout" => Self::Timeout(msg),
            "limit-exceeded" => Self::LimitExceeded(msg),
            "bad-request" => Self::BadRequest(msg),
            "conflict" => Self::Conflict(msg),
            "configuration-error" => Self::Configuration(msg),
            "unauthorized" => Self::Unauthorized,
            _ => Self::Internal(msg),
        }
    }

    /// HTTP status for API responses.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::AlreadyExists(_)
            | Self::NotRunning(_)
            | Self::AlreadyRunning(_)
            | Self::InUse(_)
            | Self::PortConflict(_)
            | Self::Conflict(_) => 409,
            Self::LimitExceeded(_)
            | Self::InvalidTransition { .. }
            | Self::BadRequest(_)
            | Self::Configuration(_) => 400,
            Self::Unauthorized => 401,
            Self::Timeout(_) => 504,
            Self::ConnectionFailed(_) => 502,
            Self::ImageNotFound(_) | Self::ImagePullFailed(_) => 422,
            Self::Internal(_) | Self::Io(_) | Self::Json(_) => 500,
        }
    }
}

impl From<sqlx::Error> for HosterError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".into()),
            other => Self::Internal(format!("database error: {other}")),
        }
    }
}

impl From<reqwest::Error> for HosterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() {
            Self::ConnectionFailed(err.to_string())
        } else {
            Self::Internal(err.to_string())
        }
    }
}

impl From<russh::Error> for HosterError {
    fn from(err: russh::Error) -> Self {
        Self::ConnectionFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trip() {
        let errors = [
            HosterError::NotFound("x".into()),
            HosterError::AlreadyExists("x".into()),
            HosterError::InUse("x".into()),
            HosterError::PortConflict("x".into()),
            HosterError::ConnectionFailed("x".into()),
            HosterError::ImageNotFound("x".into()),
            HosterError::Timeout("x".into()),
            HosterError::LimitExceeded("x".into()),
            HosterError::Conflict("x".into()),
        ];

        for err in errors {
            let rebuilt = HosterError::from_kind(err.kind(), "x");
            assert_eq!(rebuilt.kind(), err.kind());
        }
    }

    #[test]
    fn unknown_kind_is_internal() {
        let err = HosterError::from_kind("no-such-kind", "boom");
        assert_eq!(err.kind(), "internal");
    }

    #[test]
    fn transition_errors_are_bad_request() {
        let err = HosterError::InvalidTransition {
            from: "running".into(),
            to: "pending".into(),
        };
        assert_eq!(err.http_status(), 400);
        assert_eq!(err.kind(), "invalid-transition");
    }

    #[test]
    fn terminal_failure_is_conflict_status() {
        assert_eq!(
            HosterError::Conflict("destroy failed".into()).http_status(),
            409
        );
    }
}
