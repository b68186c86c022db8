//! One module per command group.

pub mod election;
pub mod kv;
pub mod lock;
pub mod queue;
pub mod service;
pub mod watch;

/// Resolve on Ctrl-C.
pub(crate) async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
