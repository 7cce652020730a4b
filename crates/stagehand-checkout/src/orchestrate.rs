//! The checkout state machine: iterate until every requested sub-suite is
//! published or the overall deadline fires, coordinating the splitter, the
//! three provider drivers, the publisher and cleanup.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use stagehand_config::Config;
use stagehand_domain::{Dataset, EnvironmentRequest, ResourceKind};
use stagehand_provider::{ProviderDriver, ProviderRegistry, SharedDataset};
use stagehand_store::Store;

use crate::error::CheckoutError;
use crate::events::{Conclusion, EventClient};
use crate::publish::Publisher;
use crate::split::{self, TestRunnerGroup};
use crate::suite::{attach, SuiteBuilder};

const ITERATION_SLEEP: Duration = Duration::from_secs(5);

/// The three drivers serving one request.
pub struct Drivers {
    pub iut: Arc<dyn ProviderDriver>,
    pub execution_space: Arc<dyn ProviderDriver>,
    pub log_area: Arc<dyn ProviderDriver>,
}

pub struct Orchestrator {
    registry: Arc<ProviderRegistry>,
    config: Config,
    events: Arc<dyn EventClient>,
    publisher: Arc<dyn Publisher>,
    iteration_sleep: Duration,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        config: Config,
        events: Arc<dyn EventClient>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Orchestrator { registry, config, events, publisher, iteration_sleep: ITERATION_SLEEP }
    }

    /// Shrink the inter-iteration sleep; tests use second-level deadlines.
    pub fn with_iteration_sleep(mut self, sleep: Duration) -> Self {
        self.iteration_sleep = sleep;
        self
    }

    /// Check out every environment the request asks for. On any terminal
    /// failure every driver that handed out a resource during this request
    /// is asked to take everything back before the error surfaces.
    pub async fn run(&self, request: &EnvironmentRequest) -> Result<(), CheckoutError> {
        request.validate()?;
        info!(suite = %request.name, testrun = %request.identifier, "checkout environment");

        self.registry.wait_for_configuration(self.config.timeouts.event_data).await?;
        let dataset = self.new_dataset(request).await?;
        let drivers = Drivers {
            iut: self.registry.driver(ResourceKind::Iut, dataset.clone(), &self.config).await?,
            execution_space: self
                .registry
                .driver(ResourceKind::ExecutionSpace, dataset.clone(), &self.config)
                .await?,
            log_area: self
                .registry
                .driver(ResourceKind::LogArea, dataset.clone(), &self.config)
                .await?,
        };
        info!(
            iut = drivers.iut.id(),
            execution_space = drivers.execution_space.id(),
            log_area = drivers.log_area.id(),
            "checking out from providers"
        );

        let context = self
            .events
            .activity_triggered(
                &format!("Checkout environment for {}", request.name),
                Some(&request.id),
            )
            .await;
        add(&dataset, "context", json!(context.to_string()));
        self.events.activity_started(context).await;

        match self.checkout(request, context, &dataset, &drivers).await {
            Ok(()) => {
                self.events.activity_finished(context, Conclusion::Successful, None).await;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "failed creating environment for test");
                let released = self.registry.checkin_all().await;
                info!(released, "cleanup returned checked out resources");
                self.events
                    .activity_finished(context, Conclusion::Unsuccessful, Some(&e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Seed the request dataset: identity, artifact and the configured
    /// key/values, which are also merged to the top level for the rules.
    async fn new_dataset(&self, request: &EnvironmentRequest) -> Result<SharedDataset, CheckoutError> {
        let configured = if request.dataset.is_empty() {
            self.registry
                .dataset()
                .await?
                .and_then(|value| value.as_object().cloned())
                .unwrap_or_default()
        } else {
            request.dataset.clone()
        };

        let mut dataset = Dataset::new();
        dataset.add("identity", Value::String(request.identity.clone()));
        dataset.add("artifact_id", Value::String(request.artifact.clone()));
        dataset.add("dataset", Value::Object(configured.clone()));
        dataset.merge(&configured);
        Ok(Arc::new(Mutex::new(dataset)))
    }

    async fn checkout(
        &self,
        request: &EnvironmentRequest,
        context: Uuid,
        dataset: &SharedDataset,
        drivers: &Drivers,
    ) -> Result<(), CheckoutError> {
        let mut groups = TestRunnerGroup::from_tests(&request.tests);
        info!(
            total_tests = split::total_test_count(&groups),
            test_runners = groups.len(),
            "seeded test runner groups"
        );

        let timeout = self.config.timeouts.checkout();
        let deadline = Instant::now() + timeout;
        let endtime = chrono::Local::now()
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
        info!(at = %endtime.format("%Y-%m-%d %H:%M:%S"), "timeout for checkout");

        let mut builder = SuiteBuilder::new(request, context);
        let mut first = true;
        while !groups.is_empty() {
            if Instant::now() > deadline {
                return Err(CheckoutError::Timeout(format!("{}s", timeout.as_secs())));
            }
            if !first {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::time::sleep(self.iteration_sleep.min(remaining)).await;
                check_deadline(deadline, timeout)?;
            }
            first = false;

            // Totals shrink as groups finish; recompute every iteration.
            let total = split::total_test_count(&groups);
            let maximum = {
                let guard = dataset.lock().unwrap_or_else(|e| e.into_inner());
                split::maximum_amount(
                    guard.get("maximum_amount"),
                    self.config.max_parallel_iuts,
                    total,
                )
            };

            let iuts = match drivers.iut.wait_and_checkout(request.minimum_amount, maximum).await {
                Ok(iuts) => iuts,
                Err(e) if e.is_retryable() => {
                    warn!(reason = %e, "IUTs not available; retrying");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let leftover = split::assign_iuts(&mut groups, iuts, total);
            for iut in &leftover {
                if let Err(e) = drivers.iut.checkin(iut).await {
                    warn!(error = %e, "failed to return unassigned IUT");
                }
            }

            for group in groups.iter_mut() {
                // Starved groups wait for the next iteration.
                if group.slots.is_empty() {
                    continue;
                }
                add(dataset, "test_runner", Value::String(group.test_runner.clone()));

                for slot in group.slots.iter_mut() {
                    check_deadline(deadline, timeout)?;
                    add(dataset, "iut", Value::Object(slot.iut.as_map()));

                    let executor = one(drivers.execution_space.wait_and_checkout(1, 1).await?)?;
                    add(dataset, "executor", Value::Object(executor.as_map()));

                    check_deadline(deadline, timeout)?;
                    let log_area = one(drivers.log_area.wait_and_checkout(1, 1).await?)?;
                    add(dataset, "log_area", Value::Object(log_area.as_map()));

                    attach(slot, executor, log_area);
                }

                split::split(group);

                for slot in group.slots.iter() {
                    let sub_suite = builder.build(request, group, slot)?;
                    self.publisher.publish(&sub_suite).await?;
                    info!(name = %sub_suite.name, "environment checked out and ready for use");
                }
            }

            // Served groups are done; everything they carried is published.
            groups.retain(|group| group.slots.is_empty());
        }
        info!(suite = %request.name, "all environments have been checked out");
        Ok(())
    }
}

fn add(dataset: &SharedDataset, key: &str, value: Value) {
    let mut guard = dataset.lock().unwrap_or_else(|e| e.into_inner());
    guard.add(key, value);
}

fn check_deadline(deadline: Instant, timeout: Duration) -> Result<(), CheckoutError> {
    if Instant::now() > deadline {
        return Err(CheckoutError::Timeout(format!("{}s", timeout.as_secs())));
    }
    Ok(())
}

fn one(mut resources: Vec<stagehand_domain::Resource>) -> Result<stagehand_domain::Resource, CheckoutError> {
    if resources.is_empty() {
        return Err(CheckoutError::Publish(
            "driver returned success without any resource".into(),
        ));
    }
    Ok(resources.remove(0))
}

/// Convenience used by the API and the one-shot binary: build the registry
/// and orchestrator for one request and run it against the given store.
pub async fn run_for_request(
    store: Arc<dyn Store>,
    config: Config,
    events: Arc<dyn EventClient>,
    publisher: Arc<dyn Publisher>,
    request: &EnvironmentRequest,
) -> Result<(), CheckoutError> {
    let registry = Arc::new(ProviderRegistry::new(store, Some(request.identifier.clone())));
    Orchestrator::new(registry, config, events, publisher).run(request).await
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEventClient;
    use crate::publish::UploadPublisher;
    use serde_json::json;
    use stagehand_domain::{Execution, ProviderIds, Test, TestCase};
    use stagehand_provider::ProviderError;
    use stagehand_store::{InMemoryStore, Keys};
    use std::collections::HashMap;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> Config {
        Config::from_map(&HashMap::from([
            ("WAIT_FOR_IUT_TIMEOUT".to_string(), "1".to_string()),
            ("WAIT_FOR_EXECUTION_SPACE_TIMEOUT".to_string(), "1".to_string()),
            ("WAIT_FOR_LOG_AREA_TIMEOUT".to_string(), "1".to_string()),
            ("EVENT_DATA_TIMEOUT".to_string(), "1".to_string()),
        ]))
        .unwrap()
    }

    fn test(id: &str, runner: &str) -> Test {
        Test {
            id: id.to_string(),
            test_case: TestCase { id: id.to_string(), tracker: String::new(), url: String::new() },
            execution: Execution {
                checkout: vec![],
                command: "pytest".into(),
                execute: vec![],
                test_runner: runner.to_string(),
                environment: Default::default(),
                parameters: Default::default(),
            },
        }
    }

    fn request(tests: Vec<Test>) -> EnvironmentRequest {
        EnvironmentRequest {
            identifier: "testrun-1".into(),
            id: "started-1".into(),
            name: "Suite".into(),
            identity: "pkg:generic/product@1.0.0".into(),
            artifact: "artifact-1".into(),
            dataset: Default::default(),
            minimum_amount: 1,
            maximum_amount: 10,
            providers: ProviderIds::default(),
            tests,
        }
    }

    fn descriptors(prefix: &str, count: usize, upload_url: Option<&str>) -> Vec<Value> {
        (0..count)
            .map(|i| match upload_url {
                Some(url) => json!({
                    "name": format!("{prefix}-{i}"),
                    "upload": {"url": url, "method": "PUT"},
                }),
                None => json!({"name": format!("{prefix}-{i}")}),
            })
            .collect()
    }

    /// Register and configure three local providers whose pools live in the
    /// configured dataset under `pools.<kind>`.
    async fn configure_providers(
        store: &Arc<InMemoryStore>,
        iut_pool: Value,
        executor_pool: Value,
        log_area_pool: Value,
    ) {
        let registry =
            ProviderRegistry::new(store.clone() as Arc<dyn Store>, Some("testrun-1".into()));
        for (kind, id, pool_key) in [
            (ResourceKind::Iut, "local-iuts", "iut"),
            (ResourceKind::ExecutionSpace, "local-execs", "executor"),
            (ResourceKind::LogArea, "local-logs", "log_area"),
        ] {
            let document = json!({
                kind.ruleset_key(): {
                    "id": id,
                    "list": {
                        "possible": format!("$pools.{pool_key}.possible"),
                        "available": format!("$pools.{pool_key}.available"),
                    },
                    "checkin": true,
                }
            });
            registry.register_provider(kind, &document).await.unwrap();
        }
        let dataset = json!({
            "pools": {
                "iut": iut_pool,
                "executor": executor_pool,
                "log_area": log_area_pool,
            }
        });
        registry.configure("local-iuts", "local-execs", "local-logs", &dataset).await.unwrap();
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        events: Arc<RecordingEventClient>,
        orchestrator: Orchestrator,
        _server: MockServer,
    }

    async fn harness(
        iuts: usize,
        executors: usize,
        log_areas: usize,
    ) -> Harness {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        let upload = format!("{}/logs/{{folder}}/{{name}}", server.uri());

        let store = Arc::new(InMemoryStore::new());
        let pool = |prefix: &str, count: usize, upload: Option<&str>| {
            json!({
                "possible": descriptors(prefix, count.max(1), upload),
                "available": descriptors(prefix, count, upload),
            })
        };
        configure_providers(
            &store,
            pool("iut", iuts, None),
            pool("exec", executors, None),
            pool("log", log_areas, Some(&upload)),
        )
        .await;

        let events = Arc::new(RecordingEventClient::default());
        let publisher = Arc::new(
            UploadPublisher::new(
                store.clone() as Arc<dyn Store>,
                events.clone(),
                None,
            )
            .with_retry_delay(Duration::from_millis(5)),
        );
        let registry =
            Arc::new(ProviderRegistry::new(store.clone() as Arc<dyn Store>, Some("testrun-1".into())));
        let orchestrator = Orchestrator::new(registry, config(), events.clone(), publisher)
            .with_iteration_sleep(Duration::from_millis(20));
        Harness { store, events, orchestrator, _server: server }
    }

    async fn stored_sub_suites(store: &Arc<InMemoryStore>) -> Vec<Value> {
        store
            .get_prefix(&Keys::suite_prefix("testrun-1"))
            .await
            .unwrap()
            .into_iter()
            .map(|(_, payload)| serde_json::from_slice(&payload).unwrap())
            .collect()
    }

    fn recipe_ids(sub_suites: &[Value]) -> Vec<String> {
        let mut ids: Vec<String> = sub_suites
            .iter()
            .flat_map(|s| s["recipes"].as_array().unwrap().iter())
            .map(|r| r["id"].as_str().unwrap().to_string())
            .collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn two_runners_with_two_iuts_publish_two_sub_suites() {
        let harness = harness(2, 2, 2).await;
        let request = request(vec![test("t1", "runner-a"), test("t2", "runner-b")]);
        harness.orchestrator.run(&request).await.unwrap();

        let announced = harness.events.environments.lock().unwrap();
        assert_eq!(announced.len(), 2);
        assert_ne!(announced[0].event_id, announced[1].event_id);
        drop(announced);

        let sub_suites = stored_sub_suites(&harness.store).await;
        assert_eq!(sub_suites.len(), 2);
        // Every requested test lands in exactly one sub-suite.
        assert_eq!(recipe_ids(&sub_suites), vec!["t1".to_string(), "t2".to_string()]);
    }

    #[tokio::test]
    async fn single_iut_converges_over_multiple_iterations() {
        let harness = harness(1, 2, 2).await;
        let request = request(vec![test("t1", "runner-a"), test("t2", "runner-b")]);
        harness.orchestrator.run(&request).await.unwrap();

        let sub_suites = stored_sub_suites(&harness.store).await;
        assert_eq!(sub_suites.len(), 2);
        let mut sub_suite_ids: Vec<&str> =
            sub_suites.iter().map(|s| s["sub_suite_id"].as_str().unwrap()).collect();
        sub_suite_ids.sort_unstable();
        sub_suite_ids.dedup();
        assert_eq!(sub_suite_ids.len(), 2);
        assert_eq!(recipe_ids(&sub_suites), vec!["t1".to_string(), "t2".to_string()]);
    }

    #[tokio::test]
    async fn many_tests_split_round_robin_across_iuts() {
        let harness = harness(2, 2, 2).await;
        let request = request(vec![
            test("t1", "runner-a"),
            test("t2", "runner-a"),
            test("t3", "runner-a"),
        ]);
        harness.orchestrator.run(&request).await.unwrap();

        let sub_suites = stored_sub_suites(&harness.store).await;
        assert_eq!(sub_suites.len(), 2);
        assert_eq!(
            recipe_ids(&sub_suites),
            vec!["t1".to_string(), "t2".to_string(), "t3".to_string()]
        );
    }

    #[tokio::test]
    async fn iut_never_available_times_out_with_nothing_announced() {
        let harness = harness(0, 1, 1).await;
        let request = request(vec![test("t1", "runner-a")]);

        let result = harness.orchestrator.run(&request).await;
        assert!(matches!(result, Err(CheckoutError::Timeout(_))), "got {result:?}");
        assert!(harness.events.environments.lock().unwrap().is_empty());
        assert!(stored_sub_suites(&harness.store).await.is_empty());

        let finished = harness.events.finished.lock().unwrap();
        assert_eq!(finished.last().unwrap().1, Conclusion::Unsuccessful);
    }

    #[tokio::test]
    async fn execution_space_pool_missing_is_terminal() {
        let server = MockServer::start().await;
        let store = Arc::new(InMemoryStore::new());
        configure_providers(
            &store,
            json!({"possible": descriptors("iut", 1, None), "available": descriptors("iut", 1, None)}),
            json!({"possible": [], "available": []}),
            json!({"possible": descriptors("log", 1, None), "available": descriptors("log", 1, None)}),
        )
        .await;

        let events = Arc::new(RecordingEventClient::default());
        let publisher = Arc::new(UploadPublisher::new(
            store.clone() as Arc<dyn Store>,
            events.clone(),
            None,
        ));
        let registry = Arc::new(ProviderRegistry::new(
            store.clone() as Arc<dyn Store>,
            Some("testrun-1".into()),
        ));
        let orchestrator = Orchestrator::new(registry, config(), events.clone(), publisher)
            .with_iteration_sleep(Duration::from_millis(20));

        let result = orchestrator.run(&request(vec![test("t1", "runner-a")])).await;
        assert!(
            matches!(result, Err(CheckoutError::Provider(ProviderError::NoneExist(_)))),
            "got {result:?}"
        );
        assert!(events.environments.lock().unwrap().is_empty());
        drop(server);
    }

    #[tokio::test]
    async fn unconfigured_testrun_is_rejected_before_any_checkout() {
        let store = Arc::new(InMemoryStore::new());
        let events = Arc::new(RecordingEventClient::default());
        let publisher = Arc::new(UploadPublisher::new(
            store.clone() as Arc<dyn Store>,
            events.clone(),
            None,
        ));
        let registry = Arc::new(ProviderRegistry::new(
            store.clone() as Arc<dyn Store>,
            Some("testrun-1".into()),
        ));
        let orchestrator = Orchestrator::new(registry, config(), events, publisher);

        let result = orchestrator.run(&request(vec![test("t1", "runner-a")])).await;
        assert!(matches!(
            result,
            Err(CheckoutError::Provider(ProviderError::NotConfigured(_)))
        ));
    }
}
