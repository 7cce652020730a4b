use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use stagehand_domain::{Dataset, Resource, ResourceKind};

use crate::driver::{
    ensure_instructions, record_checked_out, tracked, untrack, ProviderDriver, SharedDataset,
};
use crate::error::ProviderError;
use crate::rules::{is_falsy, Evaluator, RuleError};

const POLL_INTERVAL: Duration = Duration::from_secs(5);

// ── Ruleset ───────────────────────────────────────────────────────────────────

/// The four rule slots of a local provider. `prepare` is only meaningful for
/// IUT providers; the other kinds ignore it.
#[derive(Debug, Clone)]
pub struct Ruleset {
    pub id: String,
    pub list: Value,
    pub checkout: Option<Value>,
    pub checkin: Option<Value>,
    pub prepare: Option<Value>,
}

impl Ruleset {
    /// Parse a registered provider document. The document nests the ruleset
    /// under the kind's root key (`iut`, `execution_space` or `log`).
    pub fn parse(kind: ResourceKind, document: &Value) -> Result<Self, ProviderError> {
        let root = document.get(kind.ruleset_key()).unwrap_or(document);
        let id = root
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProviderError::Config(format!("{kind} provider has no id")))?
            .to_string();
        let list = root
            .get("list")
            .cloned()
            .ok_or_else(|| ProviderError::Config(format!("provider {id:?} has no list rule")))?;
        Ok(Ruleset {
            id,
            list,
            checkout: root.get("checkout").cloned(),
            checkin: root.get("checkin").cloned(),
            prepare: root.get("prepare").cloned(),
        })
    }

    /// Whether a provider document describes a remote provider instead of a
    /// local ruleset.
    pub fn is_external(kind: ResourceKind, document: &Value) -> bool {
        let root = document.get(kind.ruleset_key()).unwrap_or(document);
        root.get("start").is_some()
    }
}

// ── Driver ────────────────────────────────────────────────────────────────────

/// Local provider driver: resources come from evaluating the provider's
/// declarative ruleset against the request dataset.
pub struct RulesDriver {
    kind: ResourceKind,
    ruleset: Ruleset,
    dataset: SharedDataset,
    evaluator: Evaluator,
    timeout: Duration,
    poll: Duration,
}

impl RulesDriver {
    pub fn new(
        kind: ResourceKind,
        ruleset: Ruleset,
        dataset: SharedDataset,
        evaluator: Evaluator,
        timeout: Duration,
    ) -> Self {
        info!(provider = %ruleset.id, %kind, "initialized local provider driver");
        RulesDriver { kind, ruleset, dataset, evaluator, timeout, poll: POLL_INTERVAL }
    }

    /// Shrink the retry period; tests use sub-second timeouts.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    fn identity(&self) -> String {
        let guard = self.dataset.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .get("identity")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string()
    }

    /// Evaluate a rule against the current dataset extended with `extra`.
    fn eval_with(
        &self,
        rule: &Value,
        extra: &[(&str, Value)],
    ) -> Result<Value, RuleError> {
        let snapshot = {
            let mut guard = self.dataset.lock().unwrap_or_else(|e| e.into_inner());
            for (key, value) in extra {
                guard.add(*key, value.clone());
            }
            guard.clone()
        };
        self.evaluator.eval(rule, &snapshot)
    }

    // ── list ──────────────────────────────────────────────────────────────────

    fn list(&self, max: usize) -> Result<Vec<Resource>, ProviderError> {
        let listed = self
            .eval_with(&self.ruleset.list, &[("amount", Value::from(max as u64))])
            .map_err(|e| ProviderError::Config(e.to_string()))?;

        let possible = listed.get("possible").and_then(Value::as_array).cloned().unwrap_or_default();
        debug!(count = possible.len(), "possible resources in the pool");
        if possible.is_empty() {
            return Err(ProviderError::NoneExist(self.identity()));
        }

        let available = listed.get("available").and_then(Value::as_array).cloned().unwrap_or_default();
        debug!(count = available.len(), "available resources in the pool");
        if available.is_empty() {
            return Err(ProviderError::NotAvailable(self.identity()));
        }

        let identity = self.identity();
        let mut resources = Vec::new();
        for descriptor in available.into_iter().take(max) {
            let mut attributes = descriptor.as_object().cloned().unwrap_or_default();
            if self.kind == ResourceKind::Iut {
                attributes
                    .entry("identity".to_string())
                    .or_insert_with(|| Value::String(identity.clone()));
            }
            resources.push(
                Resource::new(&self.ruleset.id, attributes)
                    .map_err(|e| ProviderError::Config(e.to_string()))?,
            );
        }
        Ok(resources)
    }

    // ── checkout ──────────────────────────────────────────────────────────────

    /// Evaluate the checkout rule once per descriptor, in reverse order. A
    /// dict result merges into the descriptor; anything else is a failure
    /// message and drops it.
    fn checkout(&self, mut resources: Vec<Resource>) -> Result<Vec<Resource>, ProviderError> {
        let Some(rule) = &self.ruleset.checkout else {
            debug!("no defined checkout rule");
            return Ok(resources);
        };

        let mut fail_message = String::new();
        let mut survivors = Vec::new();
        while let Some(mut resource) = resources.pop() {
            let response = self
                .eval_with(
                    rule,
                    &[(self.kind.singular_key(), Value::Object(resource.as_map()))],
                )
                .map_err(|e| ProviderError::Config(e.to_string()))?;
            match response {
                Value::Object(patch) => {
                    resource.update(&patch);
                    survivors.push(resource);
                }
                other => {
                    fail_message = match other {
                        Value::String(message) => message,
                        other => other.to_string(),
                    };
                    error!(provider = %self.ruleset.id, reason = %fail_message,
                        "unable to checkout resource");
                }
            }
        }
        if survivors.is_empty() {
            return Err(ProviderError::CheckoutFailed(format!(
                "all resources failed checkout. {fail_message}"
            )));
        }
        // Popping walked the list back to front; restore pool order.
        survivors.reverse();
        Ok(survivors)
    }

    // ── prepare (IUT only) ────────────────────────────────────────────────────

    /// Run the preparation steps for every IUT on blocking workers. Each
    /// worker gets a deep copy of the dataset, taken under the dataset mutex.
    /// Returns the prepared IUTs and the ones that failed a step.
    async fn prepare(&self, iuts: Vec<Resource>) -> (Vec<Resource>, Vec<Resource>) {
        let Some(rule) = &self.ruleset.prepare else {
            debug!("no defined preparation rule");
            return (iuts, Vec::new());
        };
        let stages = rule.get("stages").cloned().unwrap_or(Value::Object(Map::new()));
        let steps = stages
            .get("environment_provider")
            .and_then(|s| s.get("steps"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let mut workers = JoinSet::new();
        for (index, iut) in iuts.into_iter().enumerate().rev() {
            let dataset = {
                let guard = self.dataset.lock().unwrap_or_else(|e| e.into_inner());
                guard.clone()
            };
            let steps = steps.clone();
            let evaluator = self.evaluator.clone();
            workers.spawn_blocking(move || {
                let (success, iut) = run_preparation_steps(&evaluator, dataset, iut, &steps);
                (index, success, iut)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "preparation worker panicked"),
            }
        }
        outcomes.sort_by_key(|(index, _, _)| *index);

        let mut prepared = Vec::new();
        let mut failed = Vec::new();
        for (_, success, iut) in outcomes {
            if success {
                prepared.push(iut);
            } else {
                error!(provider = %self.ruleset.id, "unable to prepare IUT");
                failed.push(iut);
            }
        }
        for iut in &mut prepared {
            if let Some(stages) = stages.as_object() {
                iut.update(stages);
            }
        }
        (prepared, failed)
    }

    // ── one checkout attempt ──────────────────────────────────────────────────

    async fn attempt(&self, min: usize, max: usize) -> Result<Vec<Resource>, ProviderError> {
        let available = self.list(max)?;
        if available.len() < min {
            warn!(
                available = available.len(),
                minimum = min,
                "not enough available resources in the pool"
            );
            return Err(ProviderError::NotAvailable(self.identity()));
        }

        let mut checked_out = self.checkout(available)?;
        if checked_out.len() < min {
            return Err(ProviderError::NotAvailable(self.identity()));
        }

        if self.kind == ResourceKind::ExecutionSpace {
            let snapshot = self.dataset.lock().unwrap_or_else(|e| e.into_inner()).clone();
            for executor in &mut checked_out {
                ensure_instructions(executor, &snapshot);
            }
        }

        if self.kind == ResourceKind::Iut {
            let (prepared, failed) = self.prepare(checked_out).await;
            for iut in &failed {
                if let Err(e) = self.run_checkin(iut).await {
                    warn!(error = %e, "failed to return unprepared IUT");
                }
            }
            if prepared.len() < min {
                return Err(ProviderError::NotAvailable(format!(
                    "preparation of {} failed",
                    self.identity()
                )));
            }
            checked_out = prepared;
        }

        record_checked_out(&self.dataset, self.kind, &checked_out);
        Ok(checked_out)
    }

    async fn run_checkin(&self, resource: &Resource) -> Result<(), ProviderError> {
        if let Some(rule) = &self.ruleset.checkin {
            info!(provider = %self.ruleset.id, kind = %self.kind, "checking in resource");
            let verdict = self
                .eval_with(
                    rule,
                    &[(self.kind.singular_key(), Value::Object(resource.as_map()))],
                )
                .map_err(|e| ProviderError::CheckinFailed(e.to_string()))?;
            if is_falsy(&verdict) {
                return Err(ProviderError::CheckinFailed(format!(
                    "unable to checkin {} from provider {:?}",
                    self.kind, self.ruleset.id
                )));
            }
        } else {
            debug!("no defined checkin rule");
        }
        untrack(&self.dataset, self.kind, resource);
        Ok(())
    }
}

/// Execute all preparation steps against one IUT. Step results become IUT
/// attributes and accumulate under `steps` in the worker's dataset copy so
/// later steps can reference earlier ones.
fn run_preparation_steps(
    evaluator: &Evaluator,
    mut dataset: Dataset,
    mut iut: Resource,
    steps: &Map<String, Value>,
) -> (bool, Resource) {
    dataset.add("iut", Value::Object(iut.as_map()));
    dataset.add("steps", Value::Object(Map::new()));
    for (step, definition) in steps {
        info!(step = %step, "executing preparation step");
        let result = match evaluator.eval(definition, &dataset) {
            Ok(result) => result,
            Err(e) => {
                error!(step = %step, error = %e, "failure when preparing IUT");
                return (false, iut);
            }
        };
        iut.set(step.clone(), result.clone());
        if is_falsy(&result) {
            error!(step = %step, "failed to execute preparation step");
            return (false, iut);
        }
        if let Some(steps_so_far) = dataset.get_mut("steps").and_then(Value::as_object_mut) {
            steps_so_far.insert(step.clone(), result);
        }
        dataset.add("iut", Value::Object(iut.as_map()));
    }
    (true, iut)
}

#[async_trait::async_trait]
impl ProviderDriver for RulesDriver {
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
        let deadline = Instant::now() + self.timeout;
        let mut first = true;
        while Instant::now() < deadline {
            if !first {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::time::sleep(self.poll.min(remaining)).await;
            }
            first = false;
            match self.attempt(min, max).await {
                Ok(resources) => {
                    info!(count = resources.len(), kind = %self.kind, "checked out resources");
                    return Ok(resources);
                }
                Err(ProviderError::NotAvailable(reason)) => {
                    warn!(kind = %self.kind, %reason, "resources not available yet");
                    continue;
                }
                Err(ProviderError::CheckoutFailed(reason)) => {
                    error!(kind = %self.kind, %reason, "checkout failed");
                    self.checkin_all().await;
                    return Err(ProviderError::CheckoutFailed(reason));
                }
                Err(terminal) => return Err(terminal),
            }
        }
        Err(ProviderError::NotAvailable(format!(
            "no {} became available within {}s",
            self.kind,
            self.timeout.as_secs()
        )))
    }

    async fn checkin(&self, resource: &Resource) -> Result<(), ProviderError> {
        self.run_checkin(resource).await
    }

    async fn checkin_all(&self) -> usize {
        info!(kind = %self.kind, "checking in all checked out resources");
        let mut released = 0;
        for resource in tracked(&self.dataset, self.kind).into_iter().rev() {
            match self.run_checkin(&resource).await {
                Ok(()) => released += 1,
                Err(e) => error!(error = %e, "checkin failed during cleanup"),
            }
        }
        released
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
