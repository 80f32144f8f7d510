//! Translates OS signals into `close_app` commands, see `spec.md` section 9's
//! "signal bridge" design note: the core holds no global state beyond this
//! bridge and the per-kind addon registries.

use tokio::sync::oneshot;

use crate::app::GraphControlCommand;

/// Waits for `SIGINT` or `SIGTERM` and posts a single `CloseApp` command onto
/// `command_tx`, then returns. Intended to be raced against an app's own
/// `run()` future with `tokio::select!`, mirroring the orchestrator's
/// top-level shutdown loop.
///
/// A no-op if the `TEN_DISABLE_SIGNAL_TRAP` environment variable is set to
/// `"true"`, per `spec.md` section 6.
pub async fn wait_for_shutdown_signal(command_tx: tokio::sync::mpsc::UnboundedSender<GraphControlCommand>) {
    if std::env::var("TEN_DISABLE_SIGNAL_TRAP").as_deref() == Ok("true") {
        std::future::pending::<()>().await;
        return;
    }

    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(error) => {
            tracing::error!(%error, "failed to install SIGTERM handler");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, closing app");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, closing app");
        }
    }

    let (response_tx, response_rx) = oneshot::channel();
    if command_tx.send(GraphControlCommand::CloseApp { response_tx }).is_err() {
        return;
    }
    let _ = response_rx.await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_signal_trap_never_resolves_on_its_own() {
        std::env::set_var("TEN_DISABLE_SIGNAL_TRAP", "true");
        let (command_tx, _command_rx) = tokio::sync::mpsc::unbounded_channel();
        let result = tokio::time::timeout(std::time::Duration::from_millis(20), wait_for_shutdown_signal(command_tx)).await;
        assert!(result.is_err(), "expected the wait to still be pending");
        std::env::remove_var("TEN_DISABLE_SIGNAL_TRAP");
    }
}
