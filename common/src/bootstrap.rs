// Bootstrap utilities shared by the scheduler and scanner binaries

use crate::catalog::{Endpoints, RestCatalogClient};
use crate::config::{GateBackend, Settings};
use crate::gate::{FileGateLock, GateLock, RedisGateLock};
use crate::policy::SchedulePolicies;
use crate::telemetry;
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Load settings from `config_dir` and validate them
pub fn load_settings(config_dir: &str) -> Result<Settings> {
    let settings = Settings::load_from_path(config_dir)
        .with_context(|| format!("Failed to load configuration from {}", config_dir))?;
    settings
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;
    Ok(settings)
}

/// Logging, plus the metrics exporter when a port is configured
pub fn init_observability(service_name: &'static str, settings: &Settings) -> Result<()> {
    let observability = &settings.observability;
    telemetry::init_logging(
        service_name,
        &observability.log_level,
        observability.tracing_endpoint.as_deref(),
    )?;

    if let Some(port) = observability.metrics_port {
        telemetry::init_metrics(port)?;
    }
    Ok(())
}

/// Build the REST client for the configured tenant.
///
/// `agent` names the calling binary in the `User-Agent` header.
#[tracing::instrument(skip(settings))]
pub fn init_catalog_client(settings: &Settings, agent: &str) -> Result<Arc<RestCatalogClient>> {
    let credentials = settings
        .credentials()
        .map_err(|e| anyhow!("Failed to load tenant credentials: {}", e))?;
    let endpoints = Endpoints::resolve(&credentials.tenant, &settings.tenant)
        .context("Failed to resolve tenant endpoints")?;

    info!(
        tenant = %credentials.tenant,
        api = %endpoints.api_base,
        "Initializing catalog client"
    );

    let client = RestCatalogClient::new(
        endpoints,
        credentials,
        &settings.tenant,
        &settings.catalog,
        agent,
    )
    .context("Failed to build catalog client")?;
    Ok(Arc::new(client))
}

/// Materialize policy and group registries; invalid definitions are logged
/// and dropped, never fatal
pub fn init_policies(settings: &Settings) -> Arc<SchedulePolicies> {
    let policies = SchedulePolicies::from_config(&settings.schedule);
    info!(
        policies = policies.policies.len(),
        group_bindings = policies.groups.len(),
        default_policy = policies.default_cron.is_some(),
        "Schedule policies loaded"
    );
    Arc::new(policies)
}

#[tracing::instrument(skip(settings))]
pub async fn init_gate_lock(settings: &Settings) -> Result<Arc<dyn GateLock>> {
    let gate = &settings.gate;
    match gate.backend {
        GateBackend::File => {
            info!(lock_dir = %gate.lock_dir.display(), "Using file gate lock");
            Ok(Arc::new(FileGateLock::new(gate.lock_dir.clone())))
        }
        GateBackend::Redis => {
            let url = gate
                .redis_url
                .as_deref()
                .ok_or_else(|| anyhow!("Gate redis_url required when backend is 'redis'"))?;
            let lock = RedisGateLock::connect(url, Duration::from_secs(gate.lease_seconds))
                .await
                .context("Failed to connect gate lock to Redis")?;
            Ok(Arc::new(lock))
        }
    }
}
