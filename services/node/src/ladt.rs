//! The local agent directory.
//!
//! Maps agent names to the instances hosted on this container. Each instance
//! sits behind its own async lock so a relocation holds exactly one agent
//! exclusively; the directory map itself is only locked for lookups and never
//! across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use caravan_id::AgentName;
use caravan_wire::{AgentMessage, MobilityError};

use crate::agent::{AgentInstance, Inbox};

struct Entry {
    instance: Arc<tokio::sync::Mutex<AgentInstance>>,
    inbox: Arc<Inbox>,
}

/// Directory of agents local to this container.
#[derive(Default)]
pub struct LocalAgentDirectory {
    agents: Mutex<HashMap<AgentName, Entry>>,
}

/// Exclusive hold on one agent instance. Dropping it releases the agent.
pub type AgentGuard = OwnedMutexGuard<AgentInstance>;

impl LocalAgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an instance under its own name. Replaces any previous entry
    /// with the same name.
    pub fn insert(&self, instance: AgentInstance) {
        let inbox = instance.inbox();
        let name = instance.name().clone();
        self.lock_map().insert(
            name,
            Entry {
                instance: Arc::new(tokio::sync::Mutex::new(instance)),
                inbox,
            },
        );
    }

    /// Acquires the agent exclusively, waiting if another task holds it.
    /// The guard keeps the hold until dropped; removing the entry from the
    /// directory does not invalidate it.
    pub async fn acquire(&self, name: &AgentName) -> Result<AgentGuard, MobilityError> {
        let instance = {
            let map = self.lock_map();
            match map.get(name) {
                Some(entry) => Arc::clone(&entry.instance),
                None => {
                    return Err(MobilityError::NotFound {
                        agent: name.clone(),
                    })
                }
            }
        };
        Ok(instance.lock_owned().await)
    }

    /// Removes the entry. A guard already held on the instance stays valid.
    pub fn remove(&self, name: &AgentName) -> bool {
        self.lock_map().remove(name).is_some()
    }

    pub fn contains(&self, name: &AgentName) -> bool {
        self.lock_map().contains_key(name)
    }

    pub fn inbox(&self, name: &AgentName) -> Option<Arc<Inbox>> {
        self.lock_map().get(name).map(|e| Arc::clone(&e.inbox))
    }

    /// Routes a message to a local agent. Fails if the agent is absent or
    /// not yet visible to routing.
    pub fn deliver(&self, name: &AgentName, message: AgentMessage) -> Result<(), MobilityError> {
        let inbox = self.inbox(name).ok_or_else(|| MobilityError::NotFound {
            agent: name.clone(),
        })?;
        if inbox.deliver(message) {
            Ok(())
        } else {
            Err(MobilityError::NotFound {
                agent: name.clone(),
            })
        }
    }

    pub fn names(&self) -> Vec<AgentName> {
        self.lock_map().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_map().is_empty()
    }

    fn lock_map(&self) -> std::sync::MutexGuard<'_, HashMap<AgentName, Entry>> {
        match self.agents.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use caravan_wire::AgentMessage;
    use serde_json::json;

    fn name(s: &str) -> AgentName {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_acquire_unknown_agent() {
        let ladt = LocalAgentDirectory::new();
        let err = ladt.acquire(&name("ghost")).await.unwrap_err();
        assert!(matches!(err, MobilityError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let ladt = Arc::new(LocalAgentDirectory::new());
        ladt.insert(AgentInstance::new(name("trader-7"), None));

        let guard = ladt.acquire(&name("trader-7")).await.unwrap();

        let contender = {
            let ladt = Arc::clone(&ladt);
            tokio::spawn(async move { ladt.acquire(&name("trader-7")).await.map(|_| ()) })
        };
        // The contender cannot finish while the guard is held.
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_guard_survives_removal() {
        let ladt = LocalAgentDirectory::new();
        ladt.insert(AgentInstance::new(name("trader-7"), None));

        let guard = ladt.acquire(&name("trader-7")).await.unwrap();
        assert!(ladt.remove(&name("trader-7")));
        assert_eq!(guard.name(), &name("trader-7"));
        assert!(!ladt.contains(&name("trader-7")));
    }

    #[tokio::test]
    async fn test_deliver_while_held() {
        let ladt = LocalAgentDirectory::new();
        ladt.insert(AgentInstance::new(name("trader-7"), None));

        // Delivery goes through the inbox handle, not the instance lock.
        let _guard = ladt.acquire(&name("trader-7")).await.unwrap();
        ladt.deliver(&name("trader-7"), AgentMessage::new(name("peer"), json!("hi")))
            .unwrap();
        assert_eq!(ladt.inbox(&name("trader-7")).unwrap().len(), 1);
    }

    #[test]
    fn test_deliver_to_invisible_inbox_fails() {
        let ladt = LocalAgentDirectory::new();
        let instance = AgentInstance::new(name("trader-7"), None);
        instance.inbox().set_visible(false);
        ladt.insert(instance);

        let err = ladt
            .deliver(&name("trader-7"), AgentMessage::new(name("peer"), json!(1)))
            .unwrap_err();
        assert!(matches!(err, MobilityError::NotFound { .. }));
    }
}
