use std::time::{Duration, Instant};

use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use stagehand_config::Config;
use stagehand_domain::{Resource, ResourceKind};

use crate::driver::{
    ensure_instructions, record_checked_out, tracked, untrack, untrack_all, ProviderDriver,
    SharedDataset,
};
use crate::encrypt;
use crate::error::ProviderError;

/// Identifier header carried on every call to a provider backend.
pub const ID_HEADER: &str = "X-ETOS-ID";

const STATUS_POLL: Duration = Duration::from_secs(2);
const RETRY_ATTEMPTS: u32 = 10;
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// The three endpoints of a remote provider.
#[derive(Debug, Clone)]
pub struct ExternalRuleset {
    pub id: String,
    pub start: String,
    pub status: String,
    pub stop: String,
}

impl ExternalRuleset {
    /// Parse a registered provider document describing a remote provider.
    pub fn parse(kind: ResourceKind, document: &Value) -> Result<Self, ProviderError> {
        let root = document.get(kind.ruleset_key()).unwrap_or(document);
        let id = root
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProviderError::Config(format!("{kind} provider has no id")))?
            .to_string();
        let host = |endpoint: &str| -> Result<String, ProviderError> {
            root.get(endpoint)
                .and_then(|e| e.get("host"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    ProviderError::Config(format!("provider {id:?} has no {endpoint} host"))
                })
        };
        Ok(ExternalRuleset { start: host("start")?, status: host("status")?, stop: host("stop")?, id })
    }
}

/// Remote provider driver: resources come from an external service reached
/// over HTTP with a start → poll status → stop state machine.
pub struct ExternalDriver {
    kind: ResourceKind,
    ruleset: ExternalRuleset,
    dataset: SharedDataset,
    /// Testrun id, sent as the identifier header on every request.
    identifier: String,
    timeout: Duration,
    poll: Duration,
    backoff: Duration,
    client: reqwest::Client,
    environment: Map<String, Value>,
}

impl ExternalDriver {
    pub fn new(
        kind: ResourceKind,
        ruleset: ExternalRuleset,
        dataset: SharedDataset,
        identifier: String,
        timeout: Duration,
        config: &Config,
    ) -> Self {
        info!(provider = %ruleset.id, %kind, "initialized external provider driver");
        ExternalDriver {
            kind,
            ruleset,
            dataset,
            identifier,
            timeout,
            poll: STATUS_POLL,
            backoff: RETRY_BACKOFF,
            client: reqwest::Client::new(),
            environment: discovery_environment(config),
        }
    }

    /// Shrink the poll and retry periods; tests use sub-second timeouts.
    pub fn with_timing(mut self, poll: Duration, backoff: Duration) -> Self {
        self.poll = poll;
        self.backoff = backoff;
        self
    }

    fn dataset_value(&self, key: &str) -> Value {
        let guard = self.dataset.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(key).cloned().unwrap_or(Value::Null)
    }

    // ── start ─────────────────────────────────────────────────────────────────

    /// Ask the provider to start reserving resources; returns the provider's
    /// request id to poll on.
    async fn start(&self, min: usize, max: usize) -> Result<String, ProviderError> {
        debug!(provider = %self.ruleset.id, "starting external provider");
        let body = json!({
            "minimum_amount": min,
            "maximum_amount": max,
            "identity": self.dataset_value("identity"),
            "artifact_id": self.dataset_value("artifact_id"),
            "artifact_created": self.dataset_value("artifact_created"),
            "artifact_published": self.dataset_value("artifact_published"),
            "tercc": self.dataset_value("tercc"),
            "dataset": self.dataset_value("dataset"),
            "context": self.dataset_value("context"),
            "test_runner": self.dataset_value("test_runner"),
            "environment": self.environment.clone(),
        });

        let response = self
            .post_with_retries(&self.ruleset.start, &body)
            .await
            .map_err(|e| {
                ProviderError::CheckoutFailed(format!(
                    "could not start external provider {:?}: {e}",
                    self.ruleset.id
                ))
            })?;
        if !response.status().is_success() {
            return Err(ProviderError::CheckoutFailed(format!(
                "could not start external provider {:?}: HTTP {}",
                self.ruleset.id,
                response.status()
            )));
        }
        let payload: Value = response.json().await.map_err(|e| {
            ProviderError::CheckoutFailed(format!(
                "could not start external provider {:?}: {e}",
                self.ruleset.id
            ))
        })?;
        payload
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ProviderError::CheckoutFailed(format!(
                    "external provider {:?} returned no request id",
                    self.ruleset.id
                ))
            })
    }

    /// POST with the backend retry policy: up to 10 attempts with a growing
    /// backoff on 413/429/503 and connection errors.
    async fn post_with_retries(
        &self,
        url: &str,
        body: &Value,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .client
                .post(url)
                .header(ID_HEADER, &self.identifier)
                .json(body)
                .send()
                .await;
            let retryable = match &result {
                Ok(response) => matches!(
                    response.status(),
                    StatusCode::PAYLOAD_TOO_LARGE
                        | StatusCode::TOO_MANY_REQUESTS
                        | StatusCode::SERVICE_UNAVAILABLE
                ),
                Err(e) => e.is_connect() || e.is_timeout(),
            };
            if !retryable || attempt >= RETRY_ATTEMPTS {
                return result;
            }
            let backoff = self.backoff * 2u32.saturating_pow(attempt - 1);
            warn!(url, attempt, "retrying request to external provider");
            tokio::time::sleep(backoff).await;
        }
    }

    // ── status ────────────────────────────────────────────────────────────────

    /// Poll the status endpoint until the provider is DONE, FAILED, or the
    /// kind timeout fires.
    async fn wait(&self, request_id: &str) -> Result<Value, ProviderError> {
        debug!(
            provider = %self.ruleset.id,
            timeout = self.timeout.as_secs(),
            "waiting for external provider"
        );
        let deadline = Instant::now() + self.timeout;
        while Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.poll.min(remaining)).await;

            let response = match self
                .client
                .get(&self.ruleset.status)
                .query(&[("id", request_id)])
                .header(ID_HEADER, &self.identifier)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    error!(host = %self.ruleset.status, error = %e,
                        "error connecting to external provider");
                    continue;
                }
            };

            match response.status() {
                StatusCode::NOT_FOUND => {
                    return Err(ProviderError::NotAvailable(format!(
                        "external provider {:?} did not respond properly",
                        self.ruleset.id
                    )))
                }
                StatusCode::BAD_REQUEST => {
                    return Err(ProviderError::Config(format!(
                        "{} provider {:?} is not properly configured",
                        self.kind, self.ruleset.id
                    )))
                }
                _ => {}
            }

            let payload: Value = match response.json().await {
                Ok(payload) => payload,
                Err(e) => {
                    error!(error = %e, "could not parse provider status as JSON");
                    continue;
                }
            };
            match payload.get("status").and_then(Value::as_str) {
                Some("FAILED") => {
                    let description = payload
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or("external provider reported FAILED");
                    return Err(ProviderError::CheckoutFailed(description.to_string()));
                }
                Some("DONE") => return Ok(payload),
                _ => debug!(status = ?payload.get("status"), "external provider still pending"),
            }
        }
        Err(ProviderError::Timeout(format!(
            "status request timed out after {}s",
            self.timeout.as_secs()
        )))
    }

    // ── build ─────────────────────────────────────────────────────────────────

    fn build_resources(&self, payload: &Value) -> Result<Vec<Resource>, ProviderError> {
        let items = payload
            .get(self.kind.response_key())
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let identity = self.dataset_value("identity");
        let snapshot = self.dataset.lock().unwrap_or_else(|e| e.into_inner()).clone();

        let mut resources = Vec::with_capacity(items.len());
        for item in items {
            let mut attributes = item.as_object().cloned().unwrap_or_default();
            if self.kind == ResourceKind::Iut && !attributes.contains_key("identity") {
                attributes.insert("identity".into(), identity.clone());
            }
            let mut resource = Resource::new(&self.ruleset.id, attributes)
                .map_err(|e| ProviderError::Config(e.to_string()))?;
            if self.kind == ResourceKind::ExecutionSpace {
                ensure_instructions(&mut resource, &snapshot);
            }
            resources.push(resource);
        }
        Ok(resources)
    }

    async fn request_and_wait(
        &self,
        min: usize,
        max: usize,
    ) -> Result<Vec<Resource>, ProviderError> {
        let request_id = self.start(min, max).await?;
        let payload = self.wait(&request_id).await?;
        let mut resources = self.build_resources(&payload)?;

        if resources.len() < min {
            return Err(ProviderError::NotAvailable(format!(
                "external provider {:?} returned {} resources, minimum is {min}",
                self.ruleset.id,
                resources.len()
            )));
        }
        if resources.len() > max {
            warn!(
                provider = %self.ruleset.id,
                expected = max,
                got = resources.len(),
                "too many resources from external provider"
            );
            let excess = resources.split_off(max);
            self.stop(&excess).await?;
        }
        record_checked_out(&self.dataset, self.kind, &resources);
        Ok(resources)
    }

    // ── stop ──────────────────────────────────────────────────────────────────

    /// POST descriptors to the stop endpoint, retrying connection refusals
    /// until the kind timeout.
    async fn stop(&self, resources: &[Resource]) -> Result<(), ProviderError> {
        if resources.is_empty() {
            return Ok(());
        }
        let body: Vec<Value> =
            resources.iter().map(|r| Value::Object(r.as_map())).collect();
        debug!(provider = %self.ruleset.id, count = body.len(), "checking in resources");

        let deadline = Instant::now() + self.timeout;
        let mut first = true;
        while Instant::now() < deadline {
            if !first {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::time::sleep(self.poll.min(remaining)).await;
            }
            first = false;

            let response = match self
                .client
                .post(&self.ruleset.stop)
                .header(ID_HEADER, &self.identifier)
                .json(&body)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) if e.is_connect() => {
                    error!(host = %self.ruleset.stop, error = %e,
                        "error connecting to external provider");
                    continue;
                }
                Err(e) => return Err(ProviderError::CheckinFailed(e.to_string())),
            };

            if response.status() == StatusCode::NO_CONTENT {
                return Ok(());
            }
            let payload: Value = response.json().await.unwrap_or(Value::Null);
            if let Some(error) = payload.get("error").filter(|e| !e.is_null()) {
                return Err(ProviderError::CheckinFailed(format!(
                    "unable to check in resources ({error})"
                )));
            }
        }
        Err(ProviderError::Timeout(format!(
            "unable to stop external provider {:?}",
            self.ruleset.id
        )))
    }
}

/// The environment block forwarded on `start`, telling the provider how the
/// test runner it spins up reaches the event bus and the ETOS services. The
/// bus password is sealed when an encryption key is configured.
fn discovery_environment(config: &Config) -> Map<String, Value> {
    let rabbitmq = &config.rabbitmq;
    let password = match &config.encryption_key {
        Some(key) => match encrypt::seal(&rabbitmq.password, key) {
            Ok(sealed) => encrypt::envelope(sealed),
            Err(e) => {
                error!(error = %e, "could not seal bus credentials; omitting them");
                Value::Null
            }
        },
        None => Value::String(rabbitmq.password.clone()),
    };
    let mut environment = Map::new();
    environment.insert("RABBITMQ_HOST".into(), Value::String(rabbitmq.host.clone()));
    environment.insert("RABBITMQ_USERNAME".into(), Value::String(rabbitmq.username.clone()));
    environment.insert("RABBITMQ_PASSWORD".into(), password);
    environment.insert("RABBITMQ_EXCHANGE".into(), Value::String(rabbitmq.exchange.clone()));
    environment.insert("RABBITMQ_PORT".into(), Value::String(rabbitmq.port.to_string()));
    environment.insert("RABBITMQ_VHOST".into(), Value::String(rabbitmq.vhost.clone()));
    environment.insert("RABBITMQ_SSL".into(), Value::String(rabbitmq.ssl.to_string()));
    environment.insert("SOURCE_HOST".into(), Value::String(config.source_host.clone()));
    environment.insert(
        "ETOS_GRAPHQL_SERVER".into(),
        Value::String(config.graphql_server.clone()),
    );
    environment.insert("ETOS_API".into(), Value::String(config.etos_api.clone()));
    environment.insert(
        "ETR_VERSION".into(),
        Value::String(config.test_runner_version.clone()),
    );
    environment
}

#[async_trait::async_trait]
impl ProviderDriver for ExternalDriver {
    fn id(&self) -> &str {
        &self.ruleset.id
    }

    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn wait_and_checkout(
        &self,
        min: usize,
        max: usize,
    ) -> Result<Vec<Resource>, ProviderError> {
        match self.request_and_wait(min, max).await {
            Ok(resources) => {
                info!(count = resources.len(), kind = %self.kind, "checked out resources");
                Ok(resources)
            }
            Err(e) => {
                // Anything reserved before the failure goes straight back.
                self.checkin_all().await;
                Err(e)
            }
        }
    }

    async fn checkin(&self, resource: &Resource) -> Result<(), ProviderError> {
        self.stop(std::slice::from_ref(resource)).await?;
        untrack(&self.dataset, self.kind, resource);
        Ok(())
    }

    async fn checkin_all(&self) -> usize {
        debug!(kind = %self.kind, "checking in all checked out resources");
        let resources = tracked(&self.dataset, self.kind);
        if resources.is_empty() {
            return 0;
        }
        match self.stop(&resources).await {
            Ok(()) => {
                untrack_all(&self.dataset, self.kind);
                resources.len()
            }
            Err(e) => {
                error!(error = %e, "checkin failed during cleanup");
                0
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
