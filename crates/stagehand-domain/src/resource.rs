use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DomainError;

// ── Resource kinds ────────────────────────────────────────────────────────────

/// The three kinds of resources a checkout reserves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Iut,
    ExecutionSpace,
    LogArea,
}

impl ResourceKind {
    /// Segment used in store keys (`/environment/provider/<segment>/<id>`).
    pub fn key_segment(&self) -> &'static str {
        match self {
            ResourceKind::Iut => "iut",
            ResourceKind::ExecutionSpace => "execution-space",
            ResourceKind::LogArea => "log-area",
        }
    }

    /// Root key of this kind's ruleset inside a registered provider document.
    pub fn ruleset_key(&self) -> &'static str {
        match self {
            ResourceKind::Iut => "iut",
            ResourceKind::ExecutionSpace => "execution_space",
            ResourceKind::LogArea => "log",
        }
    }

    /// Dataset key a single descriptor is published under while a rule that
    /// concerns it is being evaluated.
    pub fn singular_key(&self) -> &'static str {
        match self {
            ResourceKind::Iut => "iut",
            ResourceKind::ExecutionSpace => "execution_space",
            ResourceKind::LogArea => "log_area",
        }
    }

    /// Dataset key under which drivers track their checked-out resources.
    pub fn dataset_key(&self) -> &'static str {
        match self {
            ResourceKind::Iut => "iuts",
            ResourceKind::ExecutionSpace => "execution_spaces",
            ResourceKind::LogArea => "log_areas",
        }
    }

    /// Key of the resource list in a remote provider's status payload.
    pub fn response_key(&self) -> &'static str {
        match self {
            ResourceKind::Iut => "iuts",
            ResourceKind::ExecutionSpace => "execution_spaces",
            ResourceKind::LogArea => "log_areas",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Iut => write!(f, "iut"),
            ResourceKind::ExecutionSpace => write!(f, "execution space"),
            ResourceKind::LogArea => write!(f, "log area"),
        }
    }
}

// ── Resource descriptor ───────────────────────────────────────────────────────

/// A resource handed out by a provider: an opaque attribute bag plus the id
/// of the provider that issued it.
///
/// The provider id is fixed at construction. `update` merges new attributes
/// but can never rebind the resource to another provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    provider_id: String,
    #[serde(flatten)]
    attributes: Map<String, Value>,
}

impl Resource {
    pub fn new(
        provider_id: impl Into<String>,
        attributes: Map<String, Value>,
    ) -> Result<Self, DomainError> {
        let provider_id = provider_id.into();
        if provider_id.is_empty() {
            return Err(DomainError::MissingProviderId);
        }
        let mut attributes = attributes;
        attributes.remove("provider_id");
        Ok(Resource { provider_id, attributes })
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Shallow-merge `patch` into the attribute bag. A `provider_id` key in
    /// the patch is ignored.
    pub fn update(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            if key == "provider_id" {
                continue;
            }
            self.attributes.insert(key.clone(), value.clone());
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if key == "provider_id" {
            return;
        }
        self.attributes.insert(key, value);
    }

    /// The full serialised form, `provider_id` included.
    pub fn as_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("provider_id".to_string(), Value::String(self.provider_id.clone()));
        for (key, value) in &self.attributes {
            map.insert(key.clone(), value.clone());
        }
        map
    }

    /// Dotted-path lookup into the attribute bag, e.g.
    /// `instructions.environment.ENVIRONMENT_ID`.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.attributes.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn empty_provider_id_is_rejected() {
        assert!(Resource::new("", Map::new()).is_err());
    }

    #[test]
    fn update_cannot_rebind_provider() {
        let mut resource = Resource::new("provider-a", Map::new()).unwrap();
        resource.update(&attrs(json!({"provider_id": "provider-b", "name": "box-1"})));
        assert_eq!(resource.provider_id(), "provider-a");
        assert_eq!(resource.get("name"), Some(&json!("box-1")));
    }

    #[test]
    fn as_map_round_trips_through_serde() {
        let resource =
            Resource::new("provider-a", attrs(json!({"name": "box-1", "port": 22}))).unwrap();
        let map = resource.as_map();
        assert_eq!(map["provider_id"], json!("provider-a"));

        let back: Resource = serde_json::from_value(Value::Object(map)).unwrap();
        assert_eq!(back, resource);
    }

    #[test]
    fn get_path_walks_nested_objects() {
        let resource = Resource::new(
            "provider-a",
            attrs(json!({"instructions": {"environment": {"ENVIRONMENT_ID": "abc"}}})),
        )
        .unwrap();
        assert_eq!(
            resource.get_path("instructions.environment.ENVIRONMENT_ID"),
            Some(&json!("abc"))
        );
        assert_eq!(resource.get_path("instructions.missing"), None);
    }
}
