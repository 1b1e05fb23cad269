//! The global agent directory, hosted on the main container only.
//!
//! Authoritative name-to-container mapping for the whole platform. Identity
//! transfer is a compare-and-swap: the entry is re-pointed only if it still
//! names the expected source, so a racing transaction cannot clobber a
//! concurrent move of the same agent.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use caravan_id::{AgentName, ContainerName};
use caravan_wire::MobilityError;

/// One registered agent.
#[derive(Debug, Clone, PartialEq)]
pub struct GadtEntry {
    /// The container currently owning the agent.
    pub container: ContainerName,

    /// Owner principal, if any.
    pub owner: Option<String>,

    /// When the entry was registered or last force-replaced.
    pub registered_at: DateTime<Utc>,
}

/// The platform-wide agent directory.
#[derive(Default)]
pub struct GlobalAgentDirectory {
    entries: Mutex<HashMap<AgentName, GadtEntry>>,
}

impl GlobalAgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lookup(&self, agent: &AgentName) -> Option<GadtEntry> {
        self.entries.lock().await.get(agent).cloned()
    }

    /// Registers an agent. Without `force` an existing entry wins and the
    /// call fails with a name clash naming the current holder; with `force`
    /// the entry is replaced (used after the holder was probed dead).
    pub async fn insert(
        &self,
        agent: &AgentName,
        container: &ContainerName,
        owner: Option<String>,
        force: bool,
    ) -> Result<(), MobilityError> {
        let mut entries = self.entries.lock().await;
        if !force {
            if let Some(existing) = entries.get(agent) {
                return Err(MobilityError::NameClash {
                    agent: agent.clone(),
                    holder: existing.container.clone(),
                });
            }
        }
        entries.insert(
            agent.clone(),
            GadtEntry {
                container: container.clone(),
                owner,
                registered_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Atomically re-points `agent` from `from` to `to`. Returns false
    /// without mutating if the entry no longer names `from`.
    pub async fn transfer_ownership(
        &self,
        agent: &AgentName,
        from: &ContainerName,
        to: &ContainerName,
    ) -> Result<bool, MobilityError> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(agent).ok_or_else(|| MobilityError::NotFound {
            agent: agent.clone(),
        })?;
        if &entry.container != from {
            return Ok(false);
        }
        entry.container = to.clone();
        Ok(true)
    }

    pub async fn remove(&self, agent: &AgentName) -> bool {
        self.entries.lock().await.remove(agent).is_some()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
