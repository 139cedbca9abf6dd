//! Demo binary: one full session lifecycle against the simulated backend.

use std::sync::Arc;

use tokio::time::{sleep, Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

use deskvisor::session::SessionState;
use deskvisor::{
    Config, OrchestratorError, SessionManager, SessionRequest, SimBackend, TerminationReason,
    TracingAuditSink,
};

#[tokio::main]
async fn main() -> Result<(), OrchestratorError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let backend = Arc::new(SimBackend::new());
    let manager = SessionManager::new(Config::default(), backend, Arc::new(TracingAuditSink))?;
    manager.start();

    let session = manager
        .create_session(SessionRequest::new("demo-user"))
        .await?;
    info!(session_id = %session.id, "session requested");

    // Wait for the drive task to bring it Active.
    let mut snapshot = manager.get_session(&session.id).await?;
    while !matches!(
        snapshot.state,
        SessionState::Active | SessionState::Terminated
    ) {
        sleep(Duration::from_millis(200)).await;
        snapshot = manager.get_session(&session.id).await?;
    }
    info!(
        session_id = %snapshot.id,
        state = %snapshot.state,
        capacity = ?snapshot.capacity,
        endpoint = ?snapshot.endpoint,
        "session ready"
    );

    // Simulate a short desktop session, then tear it down.
    sleep(Duration::from_secs(5)).await;
    manager
        .terminate_session(&session.id, TerminationReason::UserRequested)
        .await?;

    let terminated = manager.get_session(&session.id).await?;
    info!(
        session_id = %terminated.id,
        state = %terminated.state,
        cost = terminated.cost,
        reason = ?terminated.termination,
        "session torn down"
    );
    Ok(())
}
