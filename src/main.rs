//! One-shot updater: recreates the configured container on the configured
//! image, rolling back on failure.

use std::pin::pin;

use anyhow::{anyhow, bail};
use log::{error, info, warn};
use serde_json::json;
use tokio::signal;

use docker_ext::{Config, DockerRuntime, UpdateOrchestrator, UpdateStatus};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!(
        "Starting docker-ext against {}",
        cfg.docker_host.as_deref().unwrap_or("local docker")
    );

    let Some(target) = cfg.target.clone() else {
        bail!("no update target configured (set target.container and target.image)");
    };

    let runtime = DockerRuntime::connect(&cfg)?;
    let orchestrator = UpdateOrchestrator::new(runtime).with_poll_interval(cfg.poll_interval());

    let mut update = pin!(orchestrator.update(
        &target.container,
        &target.image,
        cfg.force_remove,
        cfg.verify_timeout(),
    ));

    // A remove/create/start sequence is never cut short: on Ctrl+C keep
    // waiting for the update to settle.
    let settled = tokio::select! {
        outcome = &mut update => Some(outcome),
        res = signal::ctrl_c() => {
            match res {
                Ok(()) => warn!("Received Ctrl+C, waiting for the update of {} to settle...", target.container),
                Err(err) => error!("Unable to listen for shutdown signal: {}", err),
            }
            None
        }
    };
    let outcome = match settled {
        Some(outcome) => outcome,
        None => update.await,
    };

    let report = json!({
        "container": target.container,
        "status": outcome.status,
        "final_image": outcome.final_image.as_ref().map(ToString::to_string),
        "error": outcome.error.as_ref().map(ToString::to_string),
    });
    println!("{report}");

    match outcome.status {
        UpdateStatus::Succeeded => Ok(()),
        _ if outcome.needs_intervention() => Err(anyhow!(
            "rollback failed, {} needs manual intervention",
            target.container
        )),
        UpdateStatus::RolledBack => Err(anyhow!("update of {} rolled back", target.container)),
        UpdateStatus::Failed => Err(anyhow!("update of {} failed", target.container)),
    }
}
