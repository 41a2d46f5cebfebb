use std::time::Duration;

pub type MapforgeResult<T> = Result<T, MapforgeError>;

#[derive(thiserror::Error, Debug)]
pub enum MapforgeError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("launch error: {0}")]
    Launch(String),

    #[error("log protocol error: {0}")]
    Protocol(String),

    #[error("document error: {0}")]
    Document(String),

    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MapforgeError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn launch(msg: impl Into<String>) -> Self {
        Self::Launch(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn document(msg: impl Into<String>) -> Self {
        Self::Document(msg.into())
    }

    pub fn timeout(what: impl Into<String>, waited: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            waited,
        }
    }
}
