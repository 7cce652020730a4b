use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::DomainError;

// ── Environment request ───────────────────────────────────────────────────────

/// One checkout request: which tests to run, against which artifact, using
/// which providers. Immutable for the life of a checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentRequest {
    /// Testrun id shared by every sub-request of the same testrun.
    pub identifier: String,
    /// Sub-request id, used as the `test_suite_started_id` of the sub-suites.
    pub id: String,
    pub name: String,
    /// Package URL identifying what is being tested.
    pub identity: String,
    pub artifact: String,
    #[serde(default)]
    pub dataset: Map<String, Value>,
    #[serde(rename = "minimumAmount")]
    pub minimum_amount: usize,
    #[serde(rename = "maximumAmount")]
    pub maximum_amount: usize,
    pub providers: ProviderIds,
    #[serde(default)]
    pub tests: Vec<Test>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderIds {
    pub iut: String,
    #[serde(rename = "executionSpace")]
    pub execution_space: String,
    #[serde(rename = "logArea")]
    pub log_area: String,
}

impl EnvironmentRequest {
    /// Check the request invariants before any resource is reserved.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.minimum_amount < 1 {
            return Err(DomainError::InvalidRequest("minimumAmount must be at least 1".into()));
        }
        if self.maximum_amount < self.minimum_amount {
            return Err(DomainError::InvalidRequest(
                "maximumAmount must not be lower than minimumAmount".into(),
            ));
        }
        let mut seen = HashSet::new();
        for test in &self.tests {
            if !seen.insert(test.id.as_str()) {
                return Err(DomainError::InvalidRequest(format!(
                    "duplicate test id {:?}",
                    test.id
                )));
            }
            if test.execution.test_runner.is_empty() {
                return Err(DomainError::InvalidRequest(format!(
                    "test {:?} has no test runner",
                    test.id
                )));
            }
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Test {
    pub id: String,
    #[serde(rename = "testCase")]
    pub test_case: TestCase,
    pub execution: Execution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    #[serde(default)]
    pub tracker: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    #[serde(default)]
    pub checkout: Vec<String>,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub execute: Vec<String>,
    #[serde(rename = "testRunner")]
    pub test_runner: String,
    #[serde(default)]
    pub environment: Map<String, Value>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl Test {
    /// Parse a test back out of its recipe form. The inverse of
    /// [`Test::recipe`], used when a test recipe collection arrives from the
    /// suite runner instead of a request resource.
    pub fn from_recipe(recipe: &Value) -> Result<Self, DomainError> {
        let id = recipe
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| DomainError::InvalidRequest("recipe has no id".into()))?
            .to_string();
        let test_case = serde_json::from_value(
            recipe.get("testCase").cloned().unwrap_or_else(|| json!({"id": id.clone()})),
        )?;

        let constraint = |key: &str| -> Value {
            recipe
                .get("constraints")
                .and_then(Value::as_array)
                .and_then(|constraints| {
                    constraints
                        .iter()
                        .find(|c| c.get("key").and_then(Value::as_str) == Some(key))
                })
                .and_then(|c| c.get("value"))
                .cloned()
                .unwrap_or(Value::Null)
        };

        let strings = |value: Value| -> Vec<String> {
            serde_json::from_value(value).unwrap_or_default()
        };
        let map = |value: Value| -> Map<String, Value> {
            value.as_object().cloned().unwrap_or_default()
        };
        let test_runner = constraint("TEST_RUNNER")
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                DomainError::InvalidRequest(format!("recipe {id:?} has no TEST_RUNNER constraint"))
            })?;

        Ok(Test {
            id,
            test_case,
            execution: Execution {
                checkout: strings(constraint("CHECKOUT")),
                command: constraint("COMMAND").as_str().unwrap_or_default().to_string(),
                execute: strings(constraint("EXECUTE")),
                test_runner,
                environment: map(constraint("ENVIRONMENT")),
                parameters: map(constraint("PARAMETERS")),
            },
        })
    }

    /// The recipe form of this test: id, test case and the execution fields
    /// flattened into a constraint list. This is the shape persisted with a
    /// sub-suite and published on the event bus.
    pub fn recipe(&self) -> Value {
        json!({
            "id": self.id,
            "testCase": self.test_case,
            "constraints": [
                {"key": "ENVIRONMENT", "value": self.execution.environment},
                {"key": "COMMAND", "value": self.execution.command},
                {"key": "EXECUTE", "value": self.execution.execute},
                {"key": "CHECKOUT", "value": self.execution.checkout},
                {"key": "PARAMETERS", "value": self.execution.parameters},
                {"key": "TEST_RUNNER", "value": self.execution.test_runner},
            ],
        })
    }
}
