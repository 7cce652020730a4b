//! Custom resources used when the provider runs inside an orchestrated
//! cluster: the `Environment` resource the publisher creates per sub-suite
//! and the `EnvironmentRequest` resource a checkout job is started from.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, PostParams};
use kube::{Client, CustomResource, Resource as _, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use stagehand_domain::{EnvironmentRequest as DomainRequest, SubSuite};

use crate::error::CheckoutError;

pub const GROUP: &str = "etos.eiffel-community.github.io";
pub const VERSION: &str = "v1alpha1";
pub const SUITE_ID_LABEL: &str = "etos.eiffel-community.github.io/suite-id";
pub const SUB_SUITE_ID_LABEL: &str = "etos.eiffel-community.github.io/sub-suite-id";

/// The sub-suite payload as an `Environment` cluster resource. The resource
/// descriptors stay opaque JSON; the test runner reads them, not the cluster.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "Environment",
    group = "etos.eiffel-community.github.io",
    version = "v1alpha1",
    namespaced
)]
pub struct EnvironmentSpec {
    pub name: String,
    pub suite_id: String,
    pub sub_suite_id: String,
    pub test_suite_started_id: String,
    pub priority: u32,
    pub recipes: Vec<Value>,
    pub test_runner: String,
    pub iut: Value,
    pub executor: Value,
    pub log_area: Value,
    pub artifact: String,
    pub context: String,
}

impl EnvironmentSpec {
    pub fn from_sub_suite(sub_suite: &SubSuite) -> Result<Self, CheckoutError> {
        serde_json::from_value(sub_suite.wire())
            .map_err(|e| CheckoutError::Publish(format!("sub-suite does not form a spec: {e}")))
    }
}

/// The request resource a checkout job is pointed at through the `REQUEST`
/// environment variable. The spec mirrors the wire request, with the tests
/// nested under `splitter` the way the request controller writes them.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "EnvironmentRequest",
    group = "etos.eiffel-community.github.io",
    version = "v1alpha1",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentRequestSpec {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub identifier: String,
    pub identity: String,
    pub artifact: String,
    #[serde(default)]
    pub dataset: Option<Value>,
    pub minimum_amount: usize,
    pub maximum_amount: usize,
    #[serde(default)]
    pub providers: Value,
    #[serde(default)]
    pub splitter: Value,
}

/// Identity of the originating request resource, used to label and own the
/// environments created for it.
#[derive(Debug, Clone, Default)]
pub struct RequestOwner {
    pub name: String,
    pub uid: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
}

impl RequestOwner {
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: format!("{GROUP}/{VERSION}"),
            kind: "EnvironmentRequest".to_string(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(false),
            block_owner_deletion: Some(true),
        }
    }
}

/// Build the `Environment` manifest for one sub-suite: labelled with the
/// suite and sub-suite ids, named after the environment id, owned by the
/// originating request.
pub fn environment_manifest(
    sub_suite: &SubSuite,
    owner: &RequestOwner,
) -> Result<Environment, CheckoutError> {
    let environment_id =
        sub_suite.environment_id().ok_or(CheckoutError::MissingEnvironmentId)?;

    let mut labels = owner.labels.clone();
    labels.insert(SUITE_ID_LABEL.to_string(), sub_suite.test_suite_started_id.clone());
    labels.insert(SUB_SUITE_ID_LABEL.to_string(), sub_suite.sub_suite_id.to_string());

    let mut environment =
        Environment::new(&environment_id.to_string(), EnvironmentSpec::from_sub_suite(sub_suite)?);
    environment.meta_mut().namespace = Some(owner.namespace.clone());
    environment.meta_mut().labels = Some(labels);
    environment.meta_mut().owner_references = Some(vec![owner.owner_reference()]);
    Ok(environment)
}

/// Fetch the request resource named by `REQUEST` and convert it to the
/// domain request the orchestrator runs on.
pub async fn fetch_request(
    client: Client,
    namespace: &str,
    name: &str,
) -> Result<(DomainRequest, RequestOwner), CheckoutError> {
    let api: Api<EnvironmentRequest> = Api::namespaced(client, namespace);
    let resource = api.get(name).await.map_err(|e| {
        CheckoutError::Publish(format!("could not fetch environment request {name:?}: {e}"))
    })?;

    let owner = RequestOwner {
        name: resource.name_any(),
        uid: resource.uid().unwrap_or_default(),
        namespace: namespace.to_string(),
        labels: resource.labels().clone(),
    };

    let spec = &resource.spec;
    let tests = spec
        .splitter
        .get("tests")
        .cloned()
        .unwrap_or(Value::Array(vec![]));
    let request = DomainRequest {
        identifier: spec.identifier.clone(),
        id: spec.id.clone(),
        name: spec.name.clone(),
        identity: spec.identity.clone(),
        artifact: spec.artifact.clone(),
        dataset: spec
            .dataset
            .as_ref()
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
        minimum_amount: spec.minimum_amount,
        maximum_amount: spec.maximum_amount,
        providers: serde_json::from_value(spec.providers.clone()).unwrap_or_default(),
        tests: serde_json::from_value(tests)
            .map_err(|e| CheckoutError::Tercc(format!("malformed tests in request: {e}")))?,
    };
    Ok((request, owner))
}

/// Create the environment resource through the cluster API. A failure here
/// is fatal for the sub-suite.
pub async fn create_environment(
    client: Client,
    environment: &Environment,
) -> Result<(), CheckoutError> {
    let namespace = environment.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Environment> = Api::namespaced(client, &namespace);
    api.create(&PostParams::default(), environment).await.map_err(|e| {
        CheckoutError::Publish(format!("failed to create the environment resource: {e}"))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use stagehand_domain::Resource;
    use uuid::Uuid;

    fn sub_suite() -> SubSuite {
        let executor = Resource::new(
            "exec-provider",
            json!({"instructions": {"environment": {"ENVIRONMENT_ID": Uuid::new_v4().to_string()}}})
                .as_object()
                .cloned()
                .unwrap(),
        )
        .unwrap();
        SubSuite {
            name: "Suite_SubSuite_0".into(),
            suite_id: "testrun-1".into(),
            sub_suite_id: Uuid::new_v4(),
            test_suite_started_id: "started-1".into(),
            priority: 1,
            recipes: vec![],
            test_runner: "runner:latest".into(),
            iut: Resource::new("iut-provider", Map::new()).unwrap(),
            executor,
            log_area: Resource::new("log-provider", Map::new()).unwrap(),
            artifact: "artifact-1".into(),
            context: Uuid::new_v4().to_string(),
        }
    }

    fn owner() -> RequestOwner {
        RequestOwner {
            name: "request-1".into(),
            uid: "uid-1".into(),
            namespace: "etos".into(),
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn manifest_is_named_after_the_environment_id() {
        let sub_suite = sub_suite();
        let manifest = environment_manifest(&sub_suite, &owner()).unwrap();
        assert_eq!(
            manifest.metadata.name.as_deref(),
            Some(sub_suite.environment_id().unwrap().to_string().as_str())
        );
    }

    #[test]
    fn manifest_carries_suite_labels_and_owner() {
        let sub_suite = sub_suite();
        let manifest = environment_manifest(&sub_suite, &owner()).unwrap();
        let labels = manifest.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[SUITE_ID_LABEL], "started-1");
        assert_eq!(labels[SUB_SUITE_ID_LABEL], sub_suite.sub_suite_id.to_string());

        let owners = manifest.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners[0].kind, "EnvironmentRequest");
        assert_eq!(owners[0].block_owner_deletion, Some(true));
    }

    #[test]
    fn manifest_creation_without_environment_id_fails() {
        let mut sub_suite = sub_suite();
        sub_suite.executor = Resource::new("exec-provider", Map::new()).unwrap();
        assert!(matches!(
            environment_manifest(&sub_suite, &owner()),
            Err(CheckoutError::MissingEnvironmentId)
        ));
    }
}
