use thiserror::Error;

/// Errors raised while turning a `RawJob` into a `ValidatedJob`, and while
/// canonicalizing the identifiers derived from one.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    ValidationFailure(String),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(#[from] chrono::ParseError),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
