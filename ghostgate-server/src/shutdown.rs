//! Graceful shutdown on SIGTERM/SIGINT (Ctrl-C elsewhere).
//!
//! [`Shutdown`] turns the first signal into a cancelled
//! [`CancellationToken`]. The HTTP server and every background job hold a
//! clone and stop when it fires.

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Signal listener plus the tracker of tasks that must finish before exit.
#[allow(missing_debug_implementations)] // TaskTracker doesn't impl Debug
pub struct Shutdown {
    tasks: TaskTracker,
    token: CancellationToken,
}

impl Shutdown {
    /// Installs the signal handlers.
    ///
    /// # Errors
    ///
    /// Returns an [`std::io::Error`] if signal registration fails.
    #[allow(clippy::unnecessary_wraps)] // Result needed on Unix for signal registration
    pub fn install() -> Result<Self, std::io::Error> {
        let token = CancellationToken::new();
        let tasks = TaskTracker::new();
        let trigger = token.clone();

        #[cfg(unix)]
        {
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            tasks.spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                    _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
                    () = trigger.cancelled() => return,
                }
                trigger.cancel();
            });
        }

        #[cfg(not(unix))]
        tasks.spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("received Ctrl-C, shutting down"),
                () = trigger.cancelled() => return,
            }
            trigger.cancel();
        });

        Ok(Self { tasks, token })
    }

    /// A token cancelled on shutdown.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Tracker for background tasks awaited by [`Shutdown::drain`].
    #[must_use]
    pub const fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Cancels everything and waits for tracked tasks to finish.
    pub async fn drain(self) {
        self.token.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}
