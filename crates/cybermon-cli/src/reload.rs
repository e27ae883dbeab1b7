use cybermon_config::ScriptingConfig;
use cybermon_lua::{BridgeError, CallbackDispatcher, SharedDispatcher};
use tokio::sync::watch;
use tracing::{error, info};

/// Reload signal type (empty - just signals that a reload is requested)
#[derive(Debug, Clone)]
pub struct ReloadSignal;

/// Create a reload signal channel and spawn SIGUSR2 handler
///
/// Returns a receiver that will be notified when SIGUSR2 is received
#[cfg(unix)]
pub fn setup_reload_signal() -> watch::Receiver<Option<ReloadSignal>> {
    let (reload_tx, reload_rx) = watch::channel(None);

    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigusr2 = match signal(SignalKind::user_defined2()) {
            Ok(s) => s,
            Err(e) => {
                error!(target: "reload", "Failed to register SIGUSR2 handler: {}", e);
                return;
            }
        };

        while sigusr2.recv().await.is_some() {
            info!(target: "reload", "Received SIGUSR2 - reloading script");
            if reload_tx.send(Some(ReloadSignal)).is_err() {
                info!(target: "reload", "Reload receiver dropped, shutting down SIGUSR2 handler");
                break;
            }
        }
    });

    reload_rx
}

/// Create a reload signal channel (non-Unix platforms don't support SIGUSR2)
#[cfg(not(unix))]
pub fn setup_reload_signal() -> watch::Receiver<Option<ReloadSignal>> {
    let (reload_tx, reload_rx) = watch::channel(None);
    tracing::warn!(target: "reload", "SIGUSR2 reload not supported on this platform");
    // Keep the sender alive but never send signals
    std::mem::forget(reload_tx);
    reload_rx
}

/// Reload the script every time `signals` fires, until the sender is dropped
pub async fn watch_reloads(
    mut signals: watch::Receiver<Option<ReloadSignal>>,
    shared: SharedDispatcher,
    config: ScriptingConfig,
) {
    while signals.changed().await.is_ok() {
        let requested = signals.borrow_and_update().is_some();
        if !requested {
            continue;
        }

        // Loading the script and waiting on the dispatcher lock both block
        let (shared, config) = (shared.clone(), config.clone());
        match tokio::task::spawn_blocking(move || reload_script(&shared, &config)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(target: "reload", "Reload failed, keeping the previous script: {}", e);
            }
            Err(e) => error!(target: "reload", "Reload task failed: {}", e),
        }
    }
}

/// Build a fresh dispatcher from `config` and swap it in.
///
/// The new script is loaded before the lock is taken, so a script that
/// fails to load leaves the running one untouched.
pub fn reload_script(shared: &SharedDispatcher, config: &ScriptingConfig) -> Result<(), BridgeError> {
    let fresh = CallbackDispatcher::from_config(config)?;
    drop(shared.replace(fresh));
    info!(target: "reload", "Reloaded {}", config.script.display());
    Ok(())
}
