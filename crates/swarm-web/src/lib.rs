//! Read-only dashboard over the orchestrator's state store.
//!
//! The daemon embeds this server on its own thread; the `DashboardStore`
//! trait is the seam between the HTTP surface and the SQLite store, keeping
//! this crate free of persistence concerns.

pub mod error;
pub mod model;
pub mod routes;
pub mod store;

use std::future::Future;
use std::sync::Arc;

use tracing::info;

pub use error::WebError;
pub use model::{group_pr_views, AgentRunView, PrView};
pub use routes::router;
pub use store::{DashboardStore, QueryError};

/// Serve the dashboard until `shutdown` resolves.
pub async fn serve(
    bind: &str,
    store: Arc<dyn DashboardStore>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), WebError> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %bind, "dashboard listening");
    axum::serve(listener, router(store))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
