//! Startup image drift detection
//!
//! A fleet created by an older operator release keeps running the old agent
//! image until something touches its WolConfig. At startup the operator
//! scans the managed DaemonSets once and, where the pod image differs from
//! the expected agent image and the config carries no explicit override,
//! stamps an annotation on the WolConfig to provoke a reconcile.
//!
//! Best-effort: failures are logged and never block manager startup.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use super::config::{ConfigStore, IMAGE_CHECK_ANNOTATION};
use super::fleet::{FleetParams, FleetStore, AGENT_APP_LABEL, WOLCONFIG_LABEL};
use crate::Error;

/// Delay before the scan so the manager caches have a chance to fill.
const STARTUP_DELAY: Duration = Duration::from_secs(2);

/// Spawns the one-shot drift detection task.
pub fn spawn(
    configs: Arc<dyn ConfigStore>,
    fleets: Arc<dyn FleetStore>,
    params: FleetParams,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(STARTUP_DELAY).await;
        match detect_image_drift(configs.as_ref(), fleets.as_ref(), &params).await {
            Ok(0) => info!("no agent image drift detected"),
            Ok(triggered) => info!(triggered, "agent image drift detection complete"),
            Err(e) => error!(error = %e, "agent image drift detection failed"),
        }
    })
}

/// Scans managed DaemonSets for image drift and annotates the owning
/// WolConfigs. Returns how many reconciles were triggered.
pub async fn detect_image_drift(
    configs: &dyn ConfigStore,
    fleets: &dyn FleetStore,
    params: &FleetParams,
) -> Result<usize, Error> {
    if params.agent_image.is_empty() {
        info!("expected agent image not set, skipping drift detection");
        return Ok(0);
    }

    let managed = fleets.list_managed(&params.namespace).await?;
    info!(
        count = managed.len(),
        expected_image = %params.agent_image,
        "checking agent DaemonSets for image drift"
    );

    let mut triggered = 0;
    for fleet in managed {
        let labels = fleet.metadata.labels.clone().unwrap_or_default();
        if labels.get("app").map(String::as_str) != Some(AGENT_APP_LABEL) {
            continue;
        }
        let Some(config_name) = labels.get(WOLCONFIG_LABEL) else {
            warn!(
                fleet = fleet.metadata.name.as_deref().unwrap_or("<unnamed>"),
                "agent DaemonSet missing WolConfig label, skipping"
            );
            continue;
        };

        let current_image = fleet
            .spec
            .as_ref()
            .and_then(|spec| spec.template.spec.as_ref())
            .and_then(|pod| pod.containers.first())
            .and_then(|container| container.image.clone());
        let Some(current_image) = current_image else {
            continue;
        };
        if current_image == params.agent_image {
            continue;
        }

        let config = match configs.get(config_name).await {
            Ok(Some(config)) => config,
            Ok(None) => continue,
            Err(e) => {
                warn!(config = %config_name, error = %e, "failed to get WolConfig for drifted fleet");
                continue;
            }
        };
        // An explicit image override pins the fleet; never fight it.
        if config
            .spec
            .agent
            .image
            .as_deref()
            .is_some_and(|image| !image.is_empty())
        {
            info!(config = %config_name, "WolConfig has explicit image override, skipping");
            continue;
        }

        info!(
            config = %config_name,
            current_image = %current_image,
            new_image = %params.agent_image,
            "image drift detected, triggering reconciliation"
        );
        match configs
            .annotate(config_name, IMAGE_CHECK_ANNOTATION, &Utc::now().to_rfc3339())
            .await
        {
            Ok(()) => triggered += 1,
            Err(e) => {
                warn!(config = %config_name, error = %e, "failed to trigger reconciliation");
            }
        }
    }

    Ok(triggered)
}
