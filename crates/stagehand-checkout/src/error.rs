use stagehand_domain::DomainError;
use stagehand_provider::ProviderError;
use stagehand_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("invalid request: {0}")]
    Domain(#[from] DomainError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("could not check out an environment before timeout ({0})")]
    Timeout(String),

    #[error("publishing the environment failed: {0}")]
    Publish(String),

    #[error("sub-suite has no environment id in its executor instructions")]
    MissingEnvironmentId,

    #[error("malformed test recipe collection: {0}")]
    Tercc(String),
}

impl CheckoutError {
    /// Terminal errors trigger cleanup and fail the request; `NotAvailable`
    /// from the IUT provider is the one thing the checkout loop retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CheckoutError::Provider(e) if e.is_retryable())
    }
}
