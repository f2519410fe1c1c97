use tokio::{signal, sync::watch};

/// Why the process is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM
    Terminate,
    /// Triggered programmatically
    Requested,
}

/// Broadcasts a single shutdown event to every waiter, including those that
/// start waiting after the event fired.
pub struct GracefulShutdown {
    tx: watch::Sender<Option<ShutdownReason>>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Record `reason` unless a shutdown is already under way.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        let fired = self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        if fired {
            tracing::info!(?reason, "Shutdown initiated");
        } else {
            tracing::warn!(?reason, "Shutdown already initiated, ignoring signal");
        }
    }

    /// Wait for SIGINT or SIGTERM and trigger the shutdown.
    pub async fn run_signal_handler(&self) {
        tracing::info!("Signal handler started. Listening for SIGTERM and SIGINT");

        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                    return;
                }
                self.trigger_shutdown(ShutdownReason::Interrupt);
            }
            _ = wait_for_sigterm() => self.trigger_shutdown(ShutdownReason::Terminate),
        }
    }

    /// Resolves once a shutdown has been triggered.
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.unwrap_or(ShutdownReason::Requested),
            Err(_) => ShutdownReason::Requested,
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
