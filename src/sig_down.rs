//! Graceful shutdown on SIGINT / SIGTERM.

use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cancels a [`CancellationToken`] on the first termination signal.
///
/// In-flight submissions are not aborted: the HTTP server stops accepting connections and
/// waits for running handlers, so a transfer already broadcast still gets its receipt
/// recorded.
pub struct SigDown {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SigDown {
    pub fn try_new() -> Result<Self, std::io::Error> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let token = CancellationToken::new();
        let inner = token.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => tracing::info!("SIGINT received, shutting down"),
                _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
                _ = inner.cancelled() => {}
            }
            inner.cancel();
        });
        Ok(Self { token, task })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for SigDown {
    fn drop(&mut self) {
        self.token.cancel();
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropping_cancels_outstanding_tokens() {
        let sig_down = SigDown::try_new().unwrap();
        let token = sig_down.cancellation_token();
        assert!(!token.is_cancelled());
        drop(sig_down);
        token.cancelled().await;
    }
}
