use std::sync::Arc;

use anyhow::{bail, Context as _};
use tracing::info;

use stagehand_api::{build_app, AppState};
use stagehand_checkout::kubernetes;
use stagehand_checkout::orchestrate::run_for_request;
use stagehand_checkout::publish::ClusterEnvironmentCreator;
use stagehand_checkout::{
    requests_from_tercc, LoggingEventClient, OrchestratedPublisher, Releaser, UploadPublisher,
};
use stagehand_config::{Config, PublishMode};
use stagehand_provider::ProviderRegistry;
use stagehand_store::{EtcdStore, InMemoryStore, Store};

async fn store(config: &Config, in_memory: bool) -> anyhow::Result<Arc<dyn Store>> {
    if in_memory {
        return Ok(Arc::new(InMemoryStore::new()));
    }
    let endpoint = config.etcd_endpoint();
    let store = EtcdStore::connect(&endpoint)
        .await
        .with_context(|| format!("could not connect to etcd at {endpoint}"))?;
    Ok(Arc::new(store))
}

/// Register provider documents found on disk, one JSON file per provider.
/// The directories are named by the `IUT_PROVIDERS`,
/// `EXECUTION_SPACE_PROVIDERS` and `LOG_AREA_PROVIDERS` variables.
async fn register_providers_from_disk(store: &Arc<dyn Store>) -> anyhow::Result<()> {
    use stagehand_domain::ResourceKind;

    let registry = ProviderRegistry::new(store.clone(), None);
    for (variable, kind) in [
        ("IUT_PROVIDERS", ResourceKind::Iut),
        ("EXECUTION_SPACE_PROVIDERS", ResourceKind::ExecutionSpace),
        ("LOG_AREA_PROVIDERS", ResourceKind::LogArea),
    ] {
        let Ok(directory) = std::env::var(variable) else { continue };
        let Ok(mut entries) = tokio::fs::read_dir(&directory).await else {
            tracing::warn!(directory, "provider directory does not exist");
            continue;
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let raw = tokio::fs::read(entry.path()).await?;
            let document = serde_json::from_slice(&raw).with_context(|| {
                format!("provider file {:?} is not valid JSON", entry.path())
            })?;
            let id = registry.register_provider(kind, &document).await?;
            info!(provider = %id, file = ?entry.path(), "registered provider from disk");
        }
    }
    Ok(())
}

pub async fn serve(bind: String, port: u16, in_memory: bool) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let store = store(&config, in_memory).await?;
    register_providers_from_disk(&store).await?;
    let tercc = std::env::var("TERCC").ok().map(|raw| serde_json::from_str(&raw)).transpose()
        .context("TERCC is not valid JSON")?;

    let state = AppState::new(store, config, Arc::new(LoggingEventClient), tercc);
    let app = build_app(state);

    let address = format!("{bind}:{port}");
    info!(%address, "serving the environment provider API");
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("could not bind {address}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub async fn checkout(suite_runner_ids: Vec<String>, in_memory: bool) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let store = store(&config, in_memory).await?;
    let events = Arc::new(LoggingEventClient);

    match config.publish_mode.clone() {
        PublishMode::Orchestrated { request, .. } => {
            let client = kube::Client::try_default()
                .await
                .context("could not build a cluster client")?;
            let namespace = client.default_namespace().to_string();
            let (domain_request, owner) =
                kubernetes::fetch_request(client.clone(), &namespace, &request).await?;

            let publisher = Arc::new(OrchestratedPublisher::new(
                store.clone(),
                events.clone(),
                Arc::new(ClusterEnvironmentCreator { client }),
                owner,
                config.etos_api.clone(),
            ));
            run_for_request(store, config, events, publisher, &domain_request).await?;
        }
        PublishMode::Upload => {
            let raw = std::env::var("TERCC")
                .context("TERCC must be set when no request resource is configured")?;
            let tercc: serde_json::Value =
                serde_json::from_str(&raw).context("TERCC is not valid JSON")?;
            if suite_runner_ids.is_empty() {
                bail!("at least one --suite-runner-id is required in TERCC mode");
            }
            let testrun_id = tercc["meta"]["id"].as_str().unwrap_or_default().to_string();
            let registry = ProviderRegistry::new(store.clone(), Some(testrun_id));
            let dataset = registry.dataset().await?;
            let requests = requests_from_tercc(&tercc, &suite_runner_ids, dataset.as_ref())?;

            for request in &requests {
                let publisher = Arc::new(UploadPublisher::new(
                    store.clone(),
                    events.clone(),
                    config.encryption_key.clone(),
                ));
                run_for_request(store.clone(), config.clone(), events.clone(), publisher, request)
                    .await?;
            }
        }
    }
    Ok(())
}

pub async fn release(testrun_id: String, in_memory: bool) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let store = store(&config, in_memory).await?;
    let releaser = Releaser::new(store, config);
    let (success, message) = releaser.release_full_testrun(&testrun_id).await?;
    if !success {
        bail!("some or all release tasks failed:\n{message}");
    }
    info!(testrun_id, "testrun released");
    Ok(())
}
