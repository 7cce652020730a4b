//! Building environment requests from a test execution recipe collection
//! (TERCC), the shape the suite runner hands over when no request resource
//! exists.

use serde_json::{Map, Value};

use stagehand_domain::{EnvironmentRequest, ProviderIds, Test};

use crate::error::CheckoutError;

/// One environment request per batch in the collection, correlated with the
/// suite runner ids in order. The configured dataset applies to every batch
/// unless it is a list, in which case it must pair up with the batches.
pub fn requests_from_tercc(
    tercc: &Value,
    suite_runner_ids: &[String],
    dataset: Option<&Value>,
) -> Result<Vec<EnvironmentRequest>, CheckoutError> {
    let identifier = tercc
        .get("meta")
        .and_then(|meta| meta.get("id"))
        .and_then(Value::as_str)
        .ok_or_else(|| CheckoutError::Tercc("collection has no meta.id".into()))?;
    let artifact = tercc
        .get("links")
        .and_then(Value::as_array)
        .and_then(|links| links.first())
        .and_then(|link| link.get("target"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let batches = tercc
        .get("data")
        .and_then(|data| data.get("batches"))
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| CheckoutError::Tercc("collection has no data.batches".into()))?;

    if suite_runner_ids.len() != batches.len() {
        return Err(CheckoutError::Tercc(format!(
            "{} suite runner ids for {} batches",
            suite_runner_ids.len(),
            batches.len()
        )));
    }
    let datasets = per_batch_datasets(dataset, batches.len())?;

    let mut requests = Vec::with_capacity(batches.len());
    for ((batch, id), dataset) in batches.iter().zip(suite_runner_ids).zip(datasets) {
        let recipes = batch
            .get("recipes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let tests = recipes
            .iter()
            .map(Test::from_recipe)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CheckoutError::Tercc(e.to_string()))?;

        let identity = dataset
            .get("identity")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        requests.push(EnvironmentRequest {
            identifier: identifier.to_string(),
            id: id.clone(),
            name: batch.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
            identity,
            artifact: artifact.to_string(),
            dataset,
            minimum_amount: 1,
            maximum_amount: 10,
            providers: ProviderIds::default(),
            tests,
        });
    }
    Ok(requests)
}

fn per_batch_datasets(
    dataset: Option<&Value>,
    batches: usize,
) -> Result<Vec<Map<String, Value>>, CheckoutError> {
    match dataset {
        Some(Value::Array(datasets)) => {
            if datasets.len() != batches {
                return Err(CheckoutError::Tercc(format!(
                    "{} datasets provided for {batches} batches",
                    datasets.len()
                )));
            }
            Ok(datasets
                .iter()
                .map(|d| d.as_object().cloned().unwrap_or_default())
                .collect())
        }
        Some(Value::Object(dataset)) => Ok(vec![dataset.clone(); batches]),
        _ => Ok(vec![Map::new(); batches]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recipe(id: &str, runner: &str) -> Value {
        json!({
            "id": id,
            "testCase": {"id": format!("case-{id}"), "tracker": "", "url": ""},
            "constraints": [
                {"key": "ENVIRONMENT", "value": {}},
                {"key": "COMMAND", "value": "pytest"},
                {"key": "EXECUTE", "value": []},
                {"key": "CHECKOUT", "value": ["git clone ."]},
                {"key": "PARAMETERS", "value": {}},
                {"key": "TEST_RUNNER", "value": runner},
            ],
        })
    }

    fn tercc() -> Value {
        json!({
            "meta": {"id": "testrun-1"},
            "links": [{"type": "CAUSE", "target": "artifact-1"}],
            "data": {"batches": [
                {"name": "SuiteA", "recipes": [recipe("t1", "runner-a")]},
                {"name": "SuiteB", "recipes": [recipe("t2", "runner-b")]},
            ]},
        })
    }

    #[test]
    fn one_request_per_batch_in_order() {
        let ids = vec!["started-1".to_string(), "started-2".to_string()];
        let requests = requests_from_tercc(&tercc(), &ids, None).unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].identifier, "testrun-1");
        assert_eq!(requests[0].id, "started-1");
        assert_eq!(requests[0].name, "SuiteA");
        assert_eq!(requests[0].artifact, "artifact-1");
        assert_eq!(requests[1].id, "started-2");
        assert_eq!(requests[1].tests[0].execution.test_runner, "runner-b");
    }

    #[test]
    fn runner_id_count_must_match_batches() {
        let ids = vec!["started-1".to_string()];
        assert!(requests_from_tercc(&tercc(), &ids, None).is_err());
    }

    #[test]
    fn dataset_list_pairs_with_batches() {
        let ids = vec!["started-1".to_string(), "started-2".to_string()];
        let datasets = json!([{"identity": "pkg:generic/a@1"}, {"identity": "pkg:generic/b@1"}]);
        let requests = requests_from_tercc(&tercc(), &ids, Some(&datasets)).unwrap();
        assert_eq!(requests[0].identity, "pkg:generic/a@1");
        assert_eq!(requests[1].identity, "pkg:generic/b@1");

        let short = json!([{"identity": "pkg:generic/a@1"}]);
        assert!(requests_from_tercc(&tercc(), &ids, Some(&short)).is_err());
    }
}
