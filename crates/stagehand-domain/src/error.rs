use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("resource is missing a provider id")]
    MissingProviderId,

    #[error("invalid environment request: {0}")]
    InvalidRequest(String),

    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}
