use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use stagehand_checkout::orchestrate::run_for_request;
use stagehand_checkout::{requests_from_tercc, Releaser, UploadPublisher};
use stagehand_domain::ResourceKind;
use stagehand_provider::ProviderRegistry;
use stagehand_store::Keys;

use crate::error::ApiError;
use crate::state::AppState;

// ── Register ──────────────────────────────────────────────────────────────────

/// Register one or several providers in the global catalog.
pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<StatusCode, ApiError> {
    let registry = ProviderRegistry::new(state.store.clone(), None);
    let mut registered = 0;
    for (field, kind) in [
        ("iut_provider", ResourceKind::Iut),
        ("execution_space_provider", ResourceKind::ExecutionSpace),
        ("log_area_provider", ResourceKind::LogArea),
    ] {
        if let Some(document) = body.get(field) {
            registry.register_provider(kind, document).await?;
            registered += 1;
        }
    }
    if registered == 0 {
        return Err(ApiError::bad_request(
            "at least one of 'iut_provider', 'log_area_provider' & \
             'execution_space_provider' is a required parameter",
        ));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── Configure ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ConfigureBody {
    pub suite_id: Option<String>,
    pub iut_provider: Option<String>,
    pub execution_space_provider: Option<String>,
    pub log_area_provider: Option<String>,
    pub dataset: Option<Value>,
}

/// Bind registered providers and a dataset to a testrun, ahead of checkout.
pub async fn configure(
    State(state): State<AppState>,
    Json(body): Json<ConfigureBody>,
) -> Result<StatusCode, ApiError> {
    let (Some(suite_id), Some(iut), Some(execution_space), Some(log_area), Some(dataset)) = (
        body.suite_id,
        body.iut_provider,
        body.execution_space_provider,
        body.log_area_provider,
        body.dataset,
    ) else {
        return Err(ApiError::bad_request("missing parameters to configure request"));
    };

    info!(suite_id, "configuring environment provider");
    let registry = ProviderRegistry::new(state.store.clone(), Some(suite_id));
    registry.configure(&iut, &execution_space, &log_area, &dataset).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct ConfigureQuery {
    pub suite_id: Option<String>,
}

/// Read back a stored configuration, to verify a configure call.
pub async fn get_configuration(
    State(state): State<AppState>,
    Query(query): Query<ConfigureQuery>,
) -> Result<Json<Value>, ApiError> {
    let suite_id = query
        .suite_id
        .ok_or_else(|| ApiError::bad_request("'suite_id' is a required parameter"))?;
    let registry = ProviderRegistry::new(state.store.clone(), Some(suite_id));
    let configuration = registry.configuration().await?;
    Ok(Json(json!(configuration)))
}

// ── Checkout ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CheckoutBody {
    pub suite_id: Option<String>,
    pub suite_runner_ids: Option<Vec<String>>,
}

/// Start a checkout as a background task and return its id for polling.
pub async fn checkout(
    State(state): State<AppState>,
    Json(body): Json<CheckoutBody>,
) -> Result<Json<Value>, ApiError> {
    let (Some(suite_id), Some(suite_runner_ids)) = (body.suite_id, body.suite_runner_ids) else {
        return Err(ApiError::bad_request(
            "the 'suite_id' and 'suite_runner_ids' parameters are required",
        ));
    };

    let tercc = state
        .tercc
        .clone()
        .ok_or_else(|| ApiError::bad_request("no test recipe collection is loaded"))?;
    let registry = ProviderRegistry::new(state.store.clone(), Some(suite_id.clone()));
    let dataset = registry.dataset().await?;
    let requests = requests_from_tercc(&tercc, &suite_runner_ids, dataset.as_ref())
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    if requests.iter().any(|r| r.identifier != suite_id) {
        return Err(ApiError::bad_request("suite_id does not match the recipe collection"));
    }

    let store = state.store.clone();
    let config = state.config.clone();
    let events = state.events.clone();
    let task_id = state.tasks.spawn(async move {
        for request in &requests {
            let publisher = Arc::new(UploadPublisher::new(
                store.clone(),
                events.clone(),
                config.encryption_key.clone(),
            ));
            run_for_request(store.clone(), config.clone(), events.clone(), publisher, request)
                .await
                .map_err(|e| {
                    error!(error = %e, "checkout task failed");
                    e.to_string()
                })?;
        }
        Ok(json!({"error": null}))
    });

    // Legacy correlation pointers for the release-by-task-id path.
    state
        .store
        .put(&Keys::suite_id_pointer(&task_id.to_string()), suite_id.clone().into_bytes(), None)
        .await?;
    state
        .store
        .put(&Keys::task_id(&suite_id), task_id.to_string().into_bytes(), None)
        .await?;

    Ok(Json(json!({"result": "success", "data": {"id": task_id}})))
}

// ── Status & release ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub id: Option<uuid::Uuid>,
    pub release: Option<String>,
    pub single_release: Option<String>,
}

/// Poll a checkout task, or release environments. `single_release` (by
/// environment id) is the canonical release parameter; `release` (by task
/// id) is kept for backward compatibility.
pub async fn status_or_release(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<Value>, ApiError> {
    if let Some(environment_id) = query.single_release {
        let releaser = Releaser::new(state.store.clone(), state.config.clone());
        let outcome = releaser.release_by_environment_id(&environment_id).await?;
        if !outcome.success() {
            return Ok(Json(json!({
                "error": "Failed to release environment",
                "details": outcome.message(),
                "status": "FAILURE",
            })));
        }
        return Ok(Json(json!({"status": "SUCCESS"})));
    }

    if let Some(task_id) = query.release {
        let releaser = Releaser::new(state.store.clone(), state.config.clone());
        let (success, message) = releaser.release_by_task_id(&task_id).await?;
        if !success {
            error!(task_id, message, "failed to release environment");
            return Ok(Json(json!({
                "error": "Failed to release environment",
                "details": message,
                "status": "FAILURE",
            })));
        }
        return Ok(Json(json!({"status": "SUCCESS"})));
    }

    if let Some(id) = query.id {
        let entry = state.tasks.get(id).await;
        return Ok(Json(json!({"status": entry.status, "result": entry.result})));
    }

    Err(ApiError::bad_request("'id', 'release' or 'single_release' are required parameters"))
}
