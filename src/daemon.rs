//! Daemon runner: wires config, storage and RPC together.

use crate::build_info::BUILD_SHA;
use crate::callbacks::CallbackBus;
use crate::config::DaemonConfig;
use crate::engine::{AllowAllPolicy, CommandEngine};
use crate::paths;
use crate::persistence::PersistenceStore;
use crate::reconciler::StageReconciler;
use crate::registry::{RegistryDeps, SessionRegistry};
use crate::rpc::server::{
    find_available_port, run_installer_server, run_observer_cleanup, run_observer_listener,
    OBSERVER_PING_INTERVAL,
};
use crate::rpc::PortFileContent;
use anyhow::{Context, Result};
use fs2::FileExt;
use std::fmt::Write;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Takes the exclusive lock that keeps a second daemon off `state_dir`.
///
/// The lock is held for as long as the returned file stays open.
pub fn acquire_state_lock(state_dir: &Path) -> Result<File> {
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("Failed to create state dir {}", state_dir.display()))?;
    let lock_path = paths::state_lock_path(state_dir);
    let lock_file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .context("Failed to open lock file")?;

    match lock_file.try_lock_exclusive() {
        Ok(()) => Ok(lock_file),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            anyhow::bail!(
                "Another daemon already owns {}",
                state_dir.display()
            )
        }
        Err(e) => Err(e).context("Failed to acquire state lock"),
    }
}

/// Boots the registry from config and sweeps every configured volume.
pub async fn start_registry(config: &DaemonConfig) -> Result<SessionRegistry> {
    let state_dir = config.state_dir()?;
    let store = PersistenceStore::open(state_dir, config.registry.max_session_age())
        .context("Failed to open session store")?;
    let stages = StageReconciler::new(
        config.internal_staging_dir()?,
        config.volumes.adopted.clone(),
    );

    let registry = SessionRegistry::boot(
        config.registry.clone(),
        RegistryDeps {
            store,
            stages,
            bus: CallbackBus::new(config.delivery_timeout()),
            policy: Arc::new(AllowAllPolicy),
            engine: Arc::new(CommandEngine::new(config.engine.commit_command.clone())),
        },
    );

    for report in registry.reconcile_all().await {
        if !report.deleted.is_empty() || !report.failed.is_empty() {
            tracing::info!(
                volume = %report.volume,
                deleted = report.deleted.len(),
                failed = report.failed.len(),
                "Reconciled staging root"
            );
        }
    }
    Ok(registry)
}

/// Runs the daemon until ctrl-c or an RPC shutdown request.
pub async fn run_daemon(config: DaemonConfig) -> Result<()> {
    let state_dir = config.state_dir()?;
    let _state_lock = acquire_state_lock(&state_dir)?;

    let registry = start_registry(&config).await?;

    let pid_path = paths::sessiond_pid_path()?;
    std::fs::write(&pid_path, std::process::id().to_string())
        .context("Failed to write PID file")?;
    let sha_path = paths::sessiond_build_sha_path()?;
    std::fs::write(&sha_path, BUILD_SHA).context("Failed to write build SHA file")?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let auth_token: String =
        rand::Rng::sample_iter(rand::thread_rng(), &rand::distributions::Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();

    let main_port = find_available_port().await?;
    let subscriber_port = find_available_port().await?;

    let port_path = paths::sessiond_port_path()?;
    let port_content = PortFileContent {
        port: main_port,
        subscriber_port,
        token: auth_token.clone(),
    };
    std::fs::write(&port_path, serde_json::to_string(&port_content)?)
        .context("Failed to write port file")?;

    tracing::info!(
        main_port,
        subscriber_port,
        state_dir = %state_dir.display(),
        "Daemon starting"
    );

    let observer_registry = registry.clone();
    let observer_shutdown = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) =
            run_observer_listener(observer_registry, observer_shutdown, subscriber_port).await
        {
            tracing::error!(error = %e, "Observer listener error");
        }
    });

    let cleanup_bus = registry.bus().clone();
    let cleanup_shutdown = shutdown_tx.clone();
    tokio::spawn(async move {
        run_observer_cleanup(cleanup_bus, cleanup_shutdown, OBSERVER_PING_INTERVAL).await;
    });

    let signal_shutdown = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
            let _ = signal_shutdown.send(());
        }
    });

    run_installer_server(registry.clone(), shutdown_tx.clone(), auth_token, main_port).await?;

    if let Err(e) = registry.shutdown().await {
        tracing::error!(error = %e, "Final checkpoint failed");
    }

    let _ = std::fs::remove_file(&port_path);
    let _ = std::fs::remove_file(&pid_path);
    tracing::info!("Daemon stopped");
    Ok(())
}

/// Renders the persisted document without starting a daemon.
pub fn offline_dump(config: &DaemonConfig) -> Result<String> {
    let state_dir = config.state_dir()?;
    let mut store = PersistenceStore::open(state_dir, config.registry.max_session_age())
        .context("Failed to open session store")?;
    let loaded = store.load(chrono::Utc::now());

    let mut out = String::new();
    writeln!(out, "Document: {}", store.document_path().display())?;
    writeln!(out, "Active sessions: {}", loaded.active.len())?;
    for session in &loaded.active {
        writeln!(
            out,
            "  {} {} installer={} uid={} user={} stage={}",
            session.id(),
            session.state(),
            session.installer_package(),
            session.installer_uid(),
            session.user_id(),
            session.stage()
        )?;
    }
    writeln!(out, "Past max age: {}", loaded.expired.len())?;
    for session in &loaded.expired {
        writeln!(
            out,
            "  {} created={}",
            session.id(),
            session.created_at().to_rfc3339()
        )?;
    }
    writeln!(out, "Unreadable entries: {}", loaded.skipped)?;
    let legacy: Vec<String> = loaded.legacy_ids.iter().map(|id| id.to_string()).collect();
    writeln!(out, "Legacy ids: [{}]", legacy.join(", "))?;
    Ok(out)
}

#[cfg(test)]
#[path = "tests/daemon_tests.rs"]
mod tests;
