use thiserror::Error;

/// Reasons a connection is dropped before it joins a session.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("no hello received within {0:?}")]
    HelloTimeout(std::time::Duration),

    #[error("connection closed before hello")]
    ClosedBeforeHello,

    #[error("first frame was not a well-formed hello")]
    InvalidHello,

    #[error("socket error: {0}")]
    Socket(#[from] axum::Error),
}
