use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use stagehand_config::Config;
use stagehand_domain::ResourceKind;
use stagehand_store::{Keys, Store};

use crate::driver::{ProviderDriver, SharedDataset};
use crate::error::ProviderError;
use crate::external::{ExternalDriver, ExternalRuleset};
use crate::local::{Ruleset, RulesDriver};
use crate::rules::Evaluator;

const BACKOFF_START: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(8);

/// The stored configuration of one testrun, as returned by `GET /configure`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Configuration {
    pub iut_provider: Option<Value>,
    pub execution_space_provider: Option<Value>,
    pub log_area_provider: Option<Value>,
    pub dataset: Option<Value>,
}

/// Provider bookkeeping for one testrun: the global provider catalog, the
/// per-testrun bindings, and the drivers instantiated for the current
/// request. The driver list is what failure cleanup fans out over, so every
/// driver handed out by this registry is tracked here.
pub struct ProviderRegistry {
    store: Arc<dyn Store>,
    testrun_id: Option<String>,
    drivers: Mutex<Vec<Arc<dyn ProviderDriver>>>,
}

impl ProviderRegistry {
    /// A registry bound to one testrun. Pass `None` for catalog-only use
    /// (registering providers); testrun operations then fail instead of
    /// writing under a bogus key.
    pub fn new(store: Arc<dyn Store>, testrun_id: Option<String>) -> Self {
        ProviderRegistry { store, testrun_id, drivers: Mutex::new(Vec::new()) }
    }

    fn testrun_id(&self) -> Result<&str, ProviderError> {
        self.testrun_id
            .as_deref()
            .ok_or_else(|| ProviderError::NotConfigured("<no testrun bound>".to_string()))
    }

    // ── Provider catalog ──────────────────────────────────────────────────────

    /// Register a provider document in the global catalog. Returns its id.
    pub async fn register_provider(
        &self,
        kind: ResourceKind,
        document: &Value,
    ) -> Result<String, ProviderError> {
        // Parsing doubles as validation; rulesets are schema-checked upstream.
        let id = if Ruleset::is_external(kind, document) {
            ExternalRuleset::parse(kind, document)?.id
        } else {
            Ruleset::parse(kind, document)?.id
        };
        info!(%kind, provider = %id, "registering provider");
        self.store
            .put(
                &Keys::provider_catalog(kind.key_segment(), &id),
                serde_json::to_vec(document).map_err(|e| ProviderError::Config(e.to_string()))?,
                None,
            )
            .await?;
        Ok(id)
    }

    pub async fn provider_by_id(
        &self,
        kind: ResourceKind,
        id: &str,
    ) -> Result<Option<Value>, ProviderError> {
        debug!(%kind, provider = %id, "getting provider from catalog");
        let raw = self.store.get(&Keys::provider_catalog(kind.key_segment(), id)).await?;
        Ok(raw.and_then(|bytes| serde_json::from_slice(&bytes).ok()))
    }

    // ── Per-testrun bindings ──────────────────────────────────────────────────

    /// Bind the three named providers and the dataset to this testrun. All
    /// three must already be registered.
    pub async fn configure(
        &self,
        iut_provider_id: &str,
        execution_space_provider_id: &str,
        log_area_provider_id: &str,
        dataset: &Value,
    ) -> Result<(), ProviderError> {
        let testrun_id = self.testrun_id()?.to_string();
        let iut = self.provider_by_id(ResourceKind::Iut, iut_provider_id).await?;
        let execution_space = self
            .provider_by_id(ResourceKind::ExecutionSpace, execution_space_provider_id)
            .await?;
        let log_area = self.provider_by_id(ResourceKind::LogArea, log_area_provider_id).await?;

        let (Some(iut), Some(execution_space), Some(log_area)) = (iut, execution_space, log_area)
        else {
            return Err(ProviderError::Config(format!(
                "could not find providers {iut_provider_id:?}, \
                 {execution_space_provider_id:?} or {log_area_provider_id:?} \
                 registered in database"
            )));
        };

        info!(testrun = %testrun_id, "configuring environment provider for testrun");
        for (slot, document) in [
            ("iut", &iut),
            ("execution-space", &execution_space),
            ("log-area", &log_area),
            ("dataset", dataset),
        ] {
            self.store
                .put(
                    &Keys::binding(&testrun_id, slot),
                    serde_json::to_vec(document)
                        .map_err(|e| ProviderError::Config(e.to_string()))?,
                    None,
                )
                .await?;
        }
        Ok(())
    }

    /// The stored configuration, for callers verifying a configure call.
    pub async fn configuration(&self) -> Result<Configuration, ProviderError> {
        let testrun_id = self.testrun_id()?;
        let read = |slot: &'static str| {
            let key = Keys::binding(testrun_id, slot);
            let store = self.store.clone();
            async move {
                Ok::<Option<Value>, ProviderError>(
                    store.get(&key).await?.and_then(|bytes| serde_json::from_slice(&bytes).ok()),
                )
            }
        };
        Ok(Configuration {
            iut_provider: read("iut").await?,
            execution_space_provider: read("execution-space").await?,
            log_area_provider: read("log-area").await?,
            dataset: read("dataset").await?,
        })
    }

    pub async fn is_configured(&self) -> Result<bool, ProviderError> {
        let testrun_id = self.testrun_id()?;
        let bindings = self.store.get_prefix(&Keys::binding_prefix(testrun_id)).await?;
        Ok(!bindings.is_empty())
    }

    /// Poll for the testrun's bindings with exponential backoff until they
    /// appear or `deadline` elapses.
    pub async fn wait_for_configuration(&self, deadline: Duration) -> Result<(), ProviderError> {
        let end = Instant::now() + deadline;
        let mut backoff = BACKOFF_START;
        loop {
            if self.is_configured().await? {
                return Ok(());
            }
            if Instant::now() >= end {
                return Err(ProviderError::NotConfigured(self.testrun_id()?.to_string()));
            }
            tokio::time::sleep(backoff.min(end.saturating_duration_since(Instant::now()))).await;
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    pub async fn dataset(&self) -> Result<Option<Value>, ProviderError> {
        let testrun_id = self.testrun_id()?;
        let raw = self.store.get(&Keys::binding(testrun_id, "dataset")).await?;
        Ok(raw.and_then(|bytes| serde_json::from_slice(&bytes).ok()))
    }

    // ── Driver instantiation ──────────────────────────────────────────────────

    /// Instantiate the driver bound to this testrun for `kind`. The driver is
    /// recorded so a later [`checkin_all`](Self::checkin_all) reaches it.
    pub async fn driver(
        &self,
        kind: ResourceKind,
        dataset: SharedDataset,
        config: &Config,
    ) -> Result<Arc<dyn ProviderDriver>, ProviderError> {
        let testrun_id = self.testrun_id()?.to_string();
        let raw = self
            .store
            .get(&Keys::binding(&testrun_id, kind.key_segment()))
            .await?
            .ok_or_else(|| ProviderError::NotConfigured(testrun_id.clone()))?;
        let document: Value = serde_json::from_slice(&raw)
            .map_err(|e| ProviderError::Config(e.to_string()))?;
        self.driver_for_document(kind, &document, dataset, config).await
    }

    /// Instantiate a driver directly from a provider document, bypassing the
    /// bindings. The release paths use this with documents resolved from the
    /// catalog by a stored descriptor's provider id.
    pub async fn driver_for_document(
        &self,
        kind: ResourceKind,
        document: &Value,
        dataset: SharedDataset,
        config: &Config,
    ) -> Result<Arc<dyn ProviderDriver>, ProviderError> {
        let testrun_id = self.testrun_id()?.to_string();
        let timeout = match kind {
            ResourceKind::Iut => config.timeouts.iut,
            ResourceKind::ExecutionSpace => config.timeouts.execution_space,
            ResourceKind::LogArea => config.timeouts.log_area,
        };

        let driver: Arc<dyn ProviderDriver> = if Ruleset::is_external(kind, document) {
            Arc::new(ExternalDriver::new(
                kind,
                ExternalRuleset::parse(kind, document)?,
                dataset,
                testrun_id,
                timeout,
                config,
            ))
        } else {
            Arc::new(RulesDriver::new(
                kind,
                Ruleset::parse(kind, document)?,
                dataset,
                Evaluator::new(config.encryption_key.clone()),
                timeout,
            ))
        };
        self.drivers.lock().await.push(driver.clone());
        Ok(driver)
    }

    /// Every driver instantiated through this registry, for cleanup fan-out.
    pub async fn drivers(&self) -> Vec<Arc<dyn ProviderDriver>> {
        self.drivers.lock().await.clone()
    }

    /// Best-effort release of everything any instantiated driver still holds.
    /// Individual failures are logged by the drivers, never raised.
    pub async fn checkin_all(&self) -> usize {
        info!("cleanup: checking in all checked out resources");
        let drivers = self.drivers().await;
        let mut released = 0;
        for driver in drivers {
            released += driver.checkin_all().await;
        }
        released
    }
}
