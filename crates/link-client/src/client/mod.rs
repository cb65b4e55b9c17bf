// Link components: connection supervision, publishing, consuming and reporting.
pub mod backoff;
pub mod buffer;
pub mod connection;
pub mod inflight;
pub mod liveness;
pub mod publisher;
pub mod sequencer;
pub mod stats;
pub mod subscription;

use tokio::sync::watch;

/// Resolves once shutdown is requested or the signal sender is gone.
pub(crate) async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
