//! Publishing a built sub-suite: persist it, surface it externally (upload
//! or cluster resource) and announce it on the event bus. The orchestrator
//! only sees the [`Publisher`] trait and never knows which mode is active.

use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info};
use uuid::Uuid;

use stagehand_domain::{Resource, SubSuite};
use stagehand_provider::encrypt;
use stagehand_store::{Keys, Store, StoreError};

use crate::error::CheckoutError;
use crate::events::{EnvironmentDefined, EventClient};
use crate::kubernetes::{self, RequestOwner};

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Make one sub-suite durable and announced. Returns the URI under which
    /// the environment is reachable.
    async fn publish(&self, sub_suite: &SubSuite) -> Result<String, CheckoutError>;
}

/// Persist the sub-suite payload and emit the EnvironmentDefined event.
/// Shared by both publisher modes. The payload key embeds the environment
/// id and is written create-only, which is what makes the announcement
/// at-most-once.
async fn persist_and_announce(
    store: &Arc<dyn Store>,
    events: &Arc<dyn EventClient>,
    sub_suite: &SubSuite,
    uri: &str,
) -> Result<(), CheckoutError> {
    let environment_id = sub_suite.environment_id().ok_or(CheckoutError::MissingEnvironmentId)?;
    let payload = serde_json::to_vec(&sub_suite.wire())
        .map_err(|e| CheckoutError::Publish(e.to_string()))?;

    let key = Keys::sub_suite(
        &sub_suite.suite_id,
        &sub_suite.test_suite_started_id,
        &environment_id.to_string(),
    );
    match store.put_new(&key, payload).await {
        Ok(()) => {}
        Err(StoreError::AlreadyExists(key)) => {
            return Err(CheckoutError::Publish(format!(
                "environment {environment_id} already announced ({key})"
            )))
        }
        Err(e) => return Err(e.into()),
    }

    // Pointers used by the single-release path.
    store
        .put(
            &Keys::environment_testrun_id(&environment_id.to_string()),
            sub_suite.suite_id.clone().into_bytes(),
            None,
        )
        .await?;
    store
        .put(
            &Keys::suite_id_pointer(&environment_id.to_string()),
            sub_suite.test_suite_started_id.clone().into_bytes(),
            None,
        )
        .await?;

    let context = Uuid::parse_str(&sub_suite.context).unwrap_or_default();
    events
        .environment_defined(EnvironmentDefined {
            event_id: environment_id,
            name: sub_suite.name.clone(),
            uri: uri.to_string(),
            context,
        })
        .await;
    Ok(())
}

// ── Upload mode ───────────────────────────────────────────────────────────────

/// Uploads the serialised sub-suite through the log area's own upload
/// instructions, then persists and announces it.
pub struct UploadPublisher {
    store: Arc<dyn Store>,
    events: Arc<dyn EventClient>,
    uploader: LogAreaUploader,
}

impl UploadPublisher {
    pub fn new(
        store: Arc<dyn Store>,
        events: Arc<dyn EventClient>,
        encryption_key: Option<String>,
    ) -> Self {
        UploadPublisher { store, events, uploader: LogAreaUploader::new(encryption_key) }
    }

    /// Shrink the uploader's retry delay; tests use mock servers.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.uploader.retry_delay = delay;
        self
    }
}

#[async_trait]
impl Publisher for UploadPublisher {
    async fn publish(&self, sub_suite: &SubSuite) -> Result<String, CheckoutError> {
        let payload = sub_suite.wire();

        // The scratch file disappears on every path out of this scope.
        let mut scratch = tempfile::NamedTempFile::new()
            .map_err(|e| CheckoutError::Publish(format!("could not create scratch file: {e}")))?;
        scratch
            .write_all(payload.to_string().as_bytes())
            .map_err(|e| CheckoutError::Publish(format!("could not write scratch file: {e}")))?;

        let folder = format!("{}/{}", sub_suite.test_suite_started_id, sub_suite.sub_suite_id);
        let uri = self
            .uploader
            .upload(
                scratch.path(),
                &format!("{}.json", sub_suite.name),
                &folder,
                &sub_suite.log_area,
            )
            .await?;

        persist_and_announce(&self.store, &self.events, sub_suite, &uri).await?;
        info!(name = %sub_suite.name, %uri, "environment is checked out and ready for use");
        Ok(uri)
    }
}

/// Uploads files according to a log area descriptor's `upload` instructions:
/// `{url, method, auth?}` with `{folder}` and `{name}` templated into the
/// URL. Three attempts per upload, with connection failures retried for a
/// short period inside each attempt.
pub struct LogAreaUploader {
    client: reqwest::Client,
    encryption_key: Option<String>,
    retry_delay: Duration,
}

impl LogAreaUploader {
    pub fn new(encryption_key: Option<String>) -> Self {
        LogAreaUploader {
            client: reqwest::Client::new(),
            encryption_key,
            retry_delay: Duration::from_secs(2),
        }
    }

    pub async fn upload(
        &self,
        path: &Path,
        name: &str,
        folder: &str,
        log_area: &Resource,
    ) -> Result<String, CheckoutError> {
        let upload = log_area
            .get("upload")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                CheckoutError::Publish("log area descriptor has no upload instructions".into())
            })?;
        let url = upload
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| CheckoutError::Publish("upload instructions have no url".into()))?
            .replace("{folder}", folder)
            .replace("{name}", name);
        let method = upload.get("method").and_then(Value::as_str).unwrap_or("PUT");

        let body = tokio::fs::read(path)
            .await
            .map_err(|e| CheckoutError::Publish(format!("could not read scratch file: {e}")))?;

        let mut last_error = String::new();
        for attempt in 1..=3 {
            debug!(%url, attempt, "uploading sub suite");
            match self.try_upload(method, &url, upload.get("auth"), body.clone()).await {
                Ok(()) => {
                    info!(%url, "uploaded sub suite");
                    return Ok(url);
                }
                Err(e) => {
                    error!(%url, attempt, error = %e, "failed to upload sub suite");
                    last_error = e;
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
        Err(CheckoutError::Publish(format!("unable to upload sub suite to {url}: {last_error}")))
    }

    async fn try_upload(
        &self,
        method: &str,
        url: &str,
        auth: Option<&Value>,
        body: Vec<u8>,
    ) -> Result<(), String> {
        let method: reqwest::Method = method.parse().map_err(|_| "invalid method".to_string())?;
        let mut request = self.client.request(method, url).body(body);
        if let Some(auth) = auth {
            let username = auth.get("username").and_then(Value::as_str).unwrap_or_default();
            let password = auth
                .get("password")
                .map(|p| encrypt::open_envelope(p, self.encryption_key.as_deref()))
                .transpose()
                .map_err(|e| format!("could not open log area credentials: {e}"))?;
            request = request.basic_auth(username, password);
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }
        Ok(())
    }
}

// ── Orchestrated mode ─────────────────────────────────────────────────────────

/// Creation of `Environment` cluster resources, separated from the publisher
/// so tests can run without a cluster.
#[async_trait]
pub trait EnvironmentCreator: Send + Sync {
    async fn create(&self, environment: &kubernetes::Environment) -> Result<(), CheckoutError>;
}

pub struct ClusterEnvironmentCreator {
    pub client: kube::Client,
}

#[async_trait]
impl EnvironmentCreator for ClusterEnvironmentCreator {
    async fn create(&self, environment: &kubernetes::Environment) -> Result<(), CheckoutError> {
        kubernetes::create_environment(self.client.clone(), environment).await
    }
}

/// Surfaces every sub-suite as an `Environment` cluster resource owned by
/// the originating request; the announced URI points at the testrun API.
pub struct OrchestratedPublisher {
    store: Arc<dyn Store>,
    events: Arc<dyn EventClient>,
    creator: Arc<dyn EnvironmentCreator>,
    owner: RequestOwner,
    etos_api: String,
}

impl OrchestratedPublisher {
    pub fn new(
        store: Arc<dyn Store>,
        events: Arc<dyn EventClient>,
        creator: Arc<dyn EnvironmentCreator>,
        owner: RequestOwner,
        etos_api: String,
    ) -> Self {
        OrchestratedPublisher { store, events, creator, owner, etos_api }
    }
}

#[async_trait]
impl Publisher for OrchestratedPublisher {
    async fn publish(&self, sub_suite: &SubSuite) -> Result<String, CheckoutError> {
        let environment_id =
            sub_suite.environment_id().ok_or(CheckoutError::MissingEnvironmentId)?;
        let manifest = kubernetes::environment_manifest(sub_suite, &self.owner)?;
        // Fatal on error: without the resource the test runner has nothing
        // to fetch.
        self.creator.create(&manifest).await?;

        let uri = format!("{}/v1alpha/testrun/{environment_id}", self.etos_api);
        persist_and_announce(&self.store, &self.events, sub_suite, &uri).await?;
        info!(name = %sub_suite.name, %uri, "environment resource created");
        Ok(uri)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
