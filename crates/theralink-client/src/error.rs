use reqwest::StatusCode;

use theralink_types::models::DraftError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("session token rejected")]
    Unauthorized,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("server error: {0}")]
    Upstream(String),

    #[error("could not decode response: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    /// Map a non-success HTTP status and its error message back onto the
    /// store taxonomy.
    pub fn from_status(status: StatusCode, message: String) -> Self {
        match status {
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => Self::Validation(message),
            StatusCode::UNAUTHORIZED => Self::Unauthorized,
            StatusCode::FORBIDDEN => Self::Forbidden(message),
            StatusCode::NOT_FOUND => Self::NotFound(message),
            StatusCode::CONFLICT => Self::Conflict(message),
            _ => Self::Upstream(format!("{}: {}", status, message)),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<DraftError> for ClientError {
    fn from(e: DraftError) -> Self {
        Self::Validation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_onto_taxonomy() {
        assert!(matches!(
            ClientError::from_status(StatusCode::BAD_REQUEST, "empty".into()),
            ClientError::Validation(m) if m == "empty"
        ));
        assert!(matches!(
            ClientError::from_status(StatusCode::NOT_FOUND, String::new()),
            ClientError::NotFound(_)
        ));
        assert!(matches!(
            ClientError::from_status(StatusCode::CONFLICT, String::new()),
            ClientError::Conflict(_)
        ));
        assert!(matches!(
            ClientError::from_status(StatusCode::BAD_GATEWAY, "db down".into()),
            ClientError::Upstream(m) if m.contains("db down")
        ));
    }
}
