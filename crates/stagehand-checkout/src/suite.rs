use uuid::Uuid;

use stagehand_domain::{EnvironmentRequest, Resource, SubSuite};

use crate::error::CheckoutError;
use crate::split::{IutSlot, TestRunnerGroup};

/// Materialises sub-suite records for one request. Pure bookkeeping: the
/// builder touches no I/O and only counts how many sub-suites it has named.
pub struct SuiteBuilder {
    suite_name: String,
    test_suite_started_id: String,
    context: Uuid,
    built: usize,
}

impl SuiteBuilder {
    pub fn new(request: &EnvironmentRequest, context: Uuid) -> Self {
        let suite_name = if request.name.is_empty() {
            "NoSuite".to_string()
        } else {
            request.name.clone()
        };
        SuiteBuilder { suite_name, test_suite_started_id: request.id.clone(), context, built: 0 }
    }

    /// Build the sub-suite for one IUT slot. The slot must have its executor
    /// and log area attached.
    pub fn build(
        &mut self,
        request: &EnvironmentRequest,
        group: &TestRunnerGroup,
        slot: &IutSlot,
    ) -> Result<SubSuite, CheckoutError> {
        let executor = slot.executor.clone().ok_or_else(|| {
            CheckoutError::Publish("IUT slot has no execution space attached".into())
        })?;
        let log_area = slot.log_area.clone().ok_or_else(|| {
            CheckoutError::Publish("IUT slot has no log area attached".into())
        })?;

        let sub_suite = SubSuite {
            name: format!("{}_SubSuite_{}", self.suite_name, self.built),
            suite_id: request.identifier.clone(),
            sub_suite_id: slot.sub_suite_id,
            test_suite_started_id: self.test_suite_started_id.clone(),
            priority: group.priority,
            recipes: slot.recipes.clone(),
            test_runner: group.test_runner.clone(),
            iut: slot.iut.clone(),
            executor,
            log_area,
            artifact: request.artifact.clone(),
            context: self.context.to_string(),
        };
        self.built += 1;
        Ok(sub_suite)
    }
}

pub fn attach(slot: &mut IutSlot, executor: Resource, log_area: Resource) {
    slot.executor = Some(executor);
    slot.log_area = Some(log_area);
}
