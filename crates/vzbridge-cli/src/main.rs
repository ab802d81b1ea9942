//! vzbridge dry-run driver.
//!
//! Loads a machine description, validates every device against the
//! simulated engine, then saves the machine state (and optionally restores
//! it) while logging attachment events. Prints the snapshot reports as JSON
//! on stdout; logs go to stderr.

mod config;

use anyhow::Context;
use config::CliConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vzbridge::{
    AttachmentBridge, AttachmentEvent, AttachmentEvents, MachineSpec, PendingSnapshot, Platform,
    SimulatedEngine, SnapshotMode, SnapshotReport, VirtualMachine,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("vzbridge=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = CliConfig::from_env()?;
    config.validate()?;
    tracing::info!(?config, "Configuration loaded");

    let spec = MachineSpec::load(&config.machine_path)
        .with_context(|| format!("loading {}", config.machine_path.display()))?;
    let platform = spec.platform.unwrap_or_else(Platform::host);
    let engine =
        Arc::new(SimulatedEngine::new(platform).with_snapshot_mode(SnapshotMode::WriteFile));

    let bridge = AttachmentBridge::new();
    let built = spec
        .build(engine.as_ref(), &bridge)
        .context("machine description rejected")?;
    for events in built.events {
        tokio::spawn(log_events(events));
    }

    let vm = VirtualMachine::new(engine, bridge, built.config);
    let outcome = run(&vm, &config).await;
    vm.destroy();

    let reports = outcome?;
    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

async fn run(vm: &VirtualMachine, config: &CliConfig) -> anyhow::Result<Vec<SnapshotReport>> {
    vm.validate_save_restore_support()?;

    tokio::fs::create_dir_all(&config.snapshot_dir)
        .await
        .with_context(|| format!("creating {}", config.snapshot_dir.display()))?;
    let path = config.snapshot_dir.join(format!("{}.vzsave", vm.id()));

    let mut reports = vec![wait_for(vm.save(&path)?, config.wait).await?];
    if config.restore {
        reports.push(wait_for(vm.restore(&path)?, config.wait).await?);
    }
    Ok(reports)
}

async fn wait_for(pending: PendingSnapshot, wait: Duration) -> anyhow::Result<SnapshotReport> {
    let kind = pending.kind();
    let operation = pending.handle();
    match tokio::time::timeout(wait, pending).await {
        Ok(result) => Ok(result?),
        Err(_) => anyhow::bail!("{kind} {operation} did not finish within {wait:?}"),
    }
}

async fn log_events(mut events: AttachmentEvents) {
    let handle = events.handle();
    while let Some(event) = events.recv().await {
        match event {
            AttachmentEvent::Connected => tracing::info!(%handle, "Storage attachment connected"),
            AttachmentEvent::EncounteredError(e) => {
                tracing::error!(%handle, error = %e, retryable = e.is_transient(), "Storage attachment failed")
            }
        }
    }
    tracing::debug!(%handle, "Attachment event stream closed");
}
