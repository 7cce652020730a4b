use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::DomainError;
use crate::request::Test;
use crate::resource::Resource;

/// Path inside an executor descriptor where the environment id lives.
pub const ENVIRONMENT_ID_PATH: &str = "instructions.environment.ENVIRONMENT_ID";

/// A bundle of recipes bound to exactly one IUT, one executor and one log
/// area. Built by the sub-suite builder, persisted by the publisher and
/// removed by the releaser.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubSuite {
    pub name: String,
    pub suite_id: String,
    pub sub_suite_id: Uuid,
    pub test_suite_started_id: String,
    pub priority: u32,
    pub recipes: Vec<Test>,
    pub test_runner: String,
    pub iut: Resource,
    pub executor: Resource,
    pub log_area: Resource,
    pub artifact: String,
    pub context: String,
}

impl SubSuite {
    /// The unique environment id of this sub-suite, taken from the executor's
    /// spin-up instructions.
    pub fn environment_id(&self) -> Option<Uuid> {
        self.executor
            .get_path(ENVIRONMENT_ID_PATH)
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// The persisted and published form: recipes flattened to their
    /// constraint shape, resources as full maps.
    pub fn wire(&self) -> Value {
        json!({
            "name": self.name,
            "suite_id": self.suite_id,
            "sub_suite_id": self.sub_suite_id,
            "test_suite_started_id": self.test_suite_started_id,
            "priority": self.priority,
            "recipes": self.recipes.iter().map(Test::recipe).collect::<Vec<_>>(),
            "test_runner": self.test_runner,
            "iut": self.iut.as_map(),
            "executor": self.executor.as_map(),
            "log_area": self.log_area.as_map(),
            "artifact": self.artifact,
            "context": self.context,
        })
    }
}

/// The subset of a persisted sub-suite the releaser needs. Recipes are left
/// opaque; only the resource descriptors and identifiers are read back.
#[derive(Debug, Clone, Deserialize)]
pub struct StoredSubSuite {
    pub name: String,
    pub suite_id: String,
    pub sub_suite_id: Uuid,
    pub test_suite_started_id: String,
    pub iut: Resource,
    pub executor: Resource,
    pub log_area: Resource,
}

impl StoredSubSuite {
    pub fn from_json(payload: &[u8]) -> Result<Self, DomainError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn environment_id(&self) -> Option<Uuid> {
        self.executor
            .get_path(ENVIRONMENT_ID_PATH)
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}
