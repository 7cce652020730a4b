use stagehand_store::StoreError;
use thiserror::Error;

/// The provider error taxonomy. Only `NotAvailable` is retried; everything
/// else is terminal for the request that hit it.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The backing pool is provably empty for the requested identity.
    #[error("no resource exists for {0}")]
    NoneExist(String),

    /// The pool is non-empty but nothing freed up in time.
    #[error("resource not available: {0}")]
    NotAvailable(String),

    /// The provider reported a terminal checkout error.
    #[error("checkout failed: {0}")]
    CheckoutFailed(String),

    #[error("checkin failed: {0}")]
    CheckinFailed(String),

    /// The driver's configuration was rejected by the backend.
    #[error("provider configuration error: {0}")]
    Config(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// No provider bindings exist for the testrun.
    #[error("environment provider is not configured for testrun {0}")]
    NotConfigured(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ProviderError {
    /// Whether the orchestrator may try again on its next iteration.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::NotAvailable(_))
    }
}
