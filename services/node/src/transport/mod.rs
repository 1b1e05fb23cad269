//! Container-to-container transport.
//!
//! The trait hides how a peer is reached; the TCP implementation is the
//! production one and the integration tests wire nodes together in memory.
//! `refresh` invalidates whatever cached handle the transport holds for a
//! peer, so a retry after a link failure goes through a freshly resolved
//! connection.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use caravan_id::ContainerName;
use caravan_wire::{Command, MobilityError, Reply};

mod tcp;

pub use tcp::{serve, AddressBook, CommandHandler, TcpTransport, MAX_FRAME_LEN};

/// Reaches peer containers by name.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs one remote operation and returns its typed result.
    async fn call(&self, to: &ContainerName, command: Command) -> Result<Reply, MobilityError>;

    /// Drops any cached handle for the peer so the next call re-resolves it.
    async fn refresh(&self, to: &ContainerName);
}

/// Calls a peer, retrying exactly once on link failure against a refreshed
/// handle. Non-link errors are never retried.
pub async fn call_with_retry(
    transport: &dyn Transport,
    to: &ContainerName,
    command: Command,
) -> Result<Reply, MobilityError> {
    let op = command.op_name();
    match transport.call(to, command.clone()).await {
        Err(e) if e.is_retryable() => {
            warn!(container = %to, op, error = %e, "link failure, retrying once");
            transport.refresh(to).await;
            transport.call(to, command).await
        }
        other => other,
    }
}

/// Liveness probe: true only if the peer answers a ping within the timeout.
/// A single attempt, no retry.
pub async fn probe_alive(transport: &dyn Transport, to: &ContainerName, timeout: Duration) -> bool {
    let alive = matches!(
        tokio::time::timeout(timeout, transport.call(to, Command::Ping)).await,
        Ok(Ok(Reply::Ready { ready: true }))
    );
    debug!(container = %to, alive, "liveness probe");
    alive
}
