//! The container node.
//!
//! Owns the local agent directory, the origin-site table, the code store,
//! and, on the main container, the global agent directory. Every remote
//! operation lands in [`ContainerNode::handle`], an exhaustive match over
//! the command set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use caravan_id::{AgentName, ContainerName, RequestId};
use caravan_wire::{
    AgentMessage, AgentSnapshot, Command, LifeCycleState, MobilityError, RelocateMode, Reply,
    TransferVerdict,
};

use crate::agent::AgentInstance;
use crate::codefetch::{CodeSourceCache, CodeStore};
use crate::config::Config;
use crate::gadt::GlobalAgentDirectory;
use crate::ladt::LocalAgentDirectory;
use crate::policy::{AllowAll, MobilityPolicy};
use crate::transport::{call_with_retry, probe_alive, CommandHandler, Transport};

/// One container of the platform.
pub struct ContainerNode {
    pub(crate) name: ContainerName,
    pub(crate) main_container: ContainerName,
    pub(crate) probe_timeout: Duration,
    pub(crate) ladt: LocalAgentDirectory,
    /// Origin-site table: agents whose code lives on another container.
    pub(crate) sites: std::sync::Mutex<HashMap<AgentName, ContainerName>>,
    pub(crate) code_store: CodeStore,
    pub(crate) code_sources: CodeSourceCache,
    /// Provision ids of copies created here, for acking retried creations.
    pub(crate) provisions: std::sync::Mutex<HashMap<AgentName, RequestId>>,
    /// Present only on the main container.
    pub(crate) gadt: Option<GlobalAgentDirectory>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) policy: Box<dyn MobilityPolicy>,
}

impl ContainerNode {
    pub fn new(config: &Config, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: config.node_name.clone(),
            main_container: config.main_container.clone(),
            probe_timeout: config.probe_timeout(),
            ladt: LocalAgentDirectory::new(),
            sites: std::sync::Mutex::new(HashMap::new()),
            code_store: CodeStore::new(
                config.code_registry_dir.clone(),
                config.code_paths.clone(),
            ),
            code_sources: CodeSourceCache::new(),
            provisions: std::sync::Mutex::new(HashMap::new()),
            gadt: config.is_main().then(GlobalAgentDirectory::new),
            transport,
            policy: Box::new(AllowAll),
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn MobilityPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn name(&self) -> &ContainerName {
        &self.name
    }

    pub fn is_main(&self) -> bool {
        self.gadt.is_some()
    }

    pub fn directory(&self) -> &LocalAgentDirectory {
        &self.ladt
    }

    pub fn gadt(&self) -> Option<&GlobalAgentDirectory> {
        self.gadt.as_ref()
    }

    /// Registers a locally born agent: the identity is recorded with the
    /// main container's directory first, then the instance goes into the
    /// local table. A refused registration leaves nothing behind.
    pub async fn register_agent(&self, instance: AgentInstance) -> Result<(), MobilityError> {
        let name = instance.name().clone();
        let owner = instance.owner().map(str::to_string);
        if self.is_main() {
            self.register_identity(&name, &self.name, owner).await?;
        } else {
            let reply = call_with_retry(
                self.transport.as_ref(),
                &self.main_container,
                Command::InformCloned {
                    agent: name.clone(),
                    container: self.name.clone(),
                    owner,
                },
            )
            .await?;
            if reply != Reply::Ack {
                return Err(MobilityError::link(
                    &self.main_container,
                    format!("unexpected reply {:?} to agent registration", reply),
                ));
            }
        }
        info!(agent = %name, "agent registered");
        self.ladt.insert(instance);
        Ok(())
    }

    /// Routes a message to a local agent's inbox.
    pub fn deliver_local(
        &self,
        agent: &AgentName,
        message: AgentMessage,
    ) -> Result<(), MobilityError> {
        self.ladt.deliver(agent, message)
    }

    /// Life-cycle state of a local agent, if present. Waits for any
    /// in-flight hold on the instance.
    pub async fn agent_state(&self, agent: &AgentName) -> Option<LifeCycleState> {
        match self.ladt.acquire(agent).await {
            Ok(guard) => Some(guard.state()),
            Err(_) => None,
        }
    }

    // =========================================================================
    // Command dispatch
    // =========================================================================

    pub async fn handle(
        &self,
        origin: &ContainerName,
        command: Command,
    ) -> Result<Reply, MobilityError> {
        debug!(origin = %origin, op = command.op_name(), "command received");
        match command {
            Command::CreateAgent {
                agent,
                snapshot,
                class_site,
                mode,
                start,
                provision_id,
            } => {
                self.create_agent(agent, &snapshot, class_site, mode, start, provision_id)
                    .await?;
                Ok(Reply::Ack)
            }

            Command::FetchCodeModule { module, agent } => {
                let bytes = self.code_store.fetch(&module, &agent)?;
                Ok(Reply::Code { bytes })
            }

            Command::RequestMove { agent, destination } => {
                let entry = self.resolve_owner(&agent).await?;
                call_with_retry(
                    self.transport.as_ref(),
                    &entry,
                    Command::MoveAgent { agent, destination },
                )
                .await
            }

            Command::RequestClone {
                agent,
                destination,
                new_name,
            } => {
                let entry = self.resolve_owner(&agent).await?;
                call_with_retry(
                    self.transport.as_ref(),
                    &entry,
                    Command::CopyAgent {
                        agent,
                        destination,
                        new_name,
                    },
                )
                .await
            }

            Command::MoveAgent { agent, destination } => {
                let outcome = self
                    .relocate(&agent, &destination, RelocateMode::Move, None)
                    .await;
                Ok(Reply::Relocated { outcome })
            }

            Command::CopyAgent {
                agent,
                destination,
                new_name,
            } => {
                let outcome = self
                    .relocate(&agent, &destination, RelocateMode::Clone, Some(new_name))
                    .await;
                Ok(Reply::Relocated { outcome })
            }

            Command::Prepare => Ok(Reply::Ready { ready: true }),

            Command::TransferIdentity { agent, from, to } => {
                let committed = self.transfer_identity(&agent, &from, &to).await?;
                Ok(Reply::Transferred { committed })
            }

            Command::HandleTransferResult {
                agent,
                verdict,
                messages,
            } => {
                self.handle_transfer_result(&agent, verdict, messages).await?;
                Ok(Reply::Ack)
            }

            Command::InformCloned {
                agent,
                container,
                owner,
            } => {
                self.register_identity(&agent, &container, owner).await?;
                Ok(Reply::Ack)
            }

            Command::Ping => Ok(Reply::Ready { ready: true }),
        }
    }

    // =========================================================================
    // Destination side
    // =========================================================================

    /// Provisions an agent from a snapshot. For a clone (`start`) the
    /// instance is registered with the main container and powered up before
    /// it becomes reachable; a refused registration discards it.
    ///
    /// Idempotent under the source's retry: a second creation carrying the
    /// provision id of a copy already made here is acknowledged as-is.
    async fn create_agent(
        &self,
        agent: AgentName,
        snapshot_bytes: &[u8],
        class_site: ContainerName,
        mode: RelocateMode,
        start: bool,
        provision_id: RequestId,
    ) -> Result<(), MobilityError> {
        if self.ladt.contains(&agent) {
            if self.lock_provisions().get(&agent) == Some(&provision_id) {
                info!(agent = %agent, mode = %mode, "copy already provisioned, acknowledging retry");
                return Ok(());
            }
            // A different resident holds the name; never overwrite it.
            return Err(MobilityError::NameClash {
                agent,
                holder: self.name.clone(),
            });
        }

        let snapshot = AgentSnapshot::decode(snapshot_bytes)?;
        let owner = snapshot.owner.clone();

        // Resolve every module first so a missing one aborts before any
        // directory is touched.
        if class_site != self.name {
            let source = self
                .code_sources
                .source_for(&agent, &class_site, &self.transport);
            for module in &snapshot.code_modules {
                source.resolve(module).await?;
            }
        } else {
            for module in &snapshot.code_modules {
                self.code_store.fetch(module, &agent)?;
            }
        }

        let mut instance = AgentInstance::materialize(snapshot, agent.clone(), mode)?;

        if start {
            if self.is_main() {
                self.register_identity(&agent, &self.name, owner).await?;
            } else {
                let reply = call_with_retry(
                    self.transport.as_ref(),
                    &self.main_container,
                    Command::InformCloned {
                        agent: agent.clone(),
                        container: self.name.clone(),
                        owner,
                    },
                )
                .await?;
                if reply != Reply::Ack {
                    return Err(MobilityError::link(
                        &self.main_container,
                        format!("unexpected reply {:?} to clone registration", reply),
                    ));
                }
            }
            instance.power_up()?;
        }

        if class_site != self.name {
            self.record_site(&agent, class_site);
        }
        self.lock_provisions().insert(agent.clone(), provision_id);
        self.ladt.insert(instance);
        info!(agent = %agent, mode = %mode, start, "agent provisioned");
        Ok(())
    }

    /// Applies the transfer verdict to a provisioned move copy.
    async fn handle_transfer_result(
        &self,
        agent: &AgentName,
        verdict: TransferVerdict,
        messages: Vec<AgentMessage>,
    ) -> Result<(), MobilityError> {
        let mut guard = self.ladt.acquire(agent).await?;
        if guard.state() != LifeCycleState::Transit {
            // Not a copy waiting on a verdict.
            return Err(MobilityError::NotFound {
                agent: agent.clone(),
            });
        }
        match verdict {
            TransferVerdict::Abort => {
                drop(guard);
                self.forget_agent(agent);
                info!(agent = %agent, "provisioned copy discarded");
            }
            TransferVerdict::Commit => {
                // Prepend the transfer buffer ahead of anything delivered
                // here, preserving original arrival order.
                let inbox = guard.inbox();
                for message in messages.into_iter().rev() {
                    inbox.put_back(message);
                }
                guard.power_up()?;
                info!(agent = %agent, "agent powered up");
            }
        }
        Ok(())
    }

    // =========================================================================
    // Main-container operations
    // =========================================================================

    /// Identity transfer: probes both participants (each call retried once
    /// on link failure, bounded by the probe timeout), then re-points the
    /// directory entry atomically. Any probe failure aborts with no
    /// directory mutation.
    async fn transfer_identity(
        &self,
        agent: &AgentName,
        from: &ContainerName,
        to: &ContainerName,
    ) -> Result<bool, MobilityError> {
        let gadt = self.require_gadt("transfer_identity")?;
        if gadt.lookup(agent).await.is_none() {
            return Err(MobilityError::NotFound {
                agent: agent.clone(),
            });
        }

        if !self.probe_ready(from).await {
            warn!(agent = %agent, container = %from, "source not ready, aborting transfer");
            return Ok(false);
        }
        if !self.probe_ready(to).await {
            warn!(agent = %agent, container = %to, "destination not ready, aborting transfer");
            return Ok(false);
        }

        let committed = gadt.transfer_ownership(agent, from, to).await?;
        if committed {
            info!(agent = %agent, from = %from, to = %to, "identity transferred");
        } else {
            warn!(agent = %agent, from = %from, "directory entry moved underneath, aborting transfer");
        }
        Ok(committed)
    }

    /// Registers a born or cloned agent's identity. On a name clash the
    /// current holder is probed; a dead holder's entry is treated as stale
    /// and force-replaced.
    async fn register_identity(
        &self,
        agent: &AgentName,
        container: &ContainerName,
        owner: Option<String>,
    ) -> Result<(), MobilityError> {
        let gadt = self.require_gadt("inform_cloned")?;
        match gadt.insert(agent, container, owner.clone(), false).await {
            Ok(()) => {
                info!(agent = %agent, container = %container, "identity registered");
                Ok(())
            }
            Err(MobilityError::NameClash { holder, .. }) => {
                // The same container re-announcing an identity it already
                // holds is a retried registration, not a clash.
                if holder == *container {
                    return Ok(());
                }
                if probe_alive(self.transport.as_ref(), &holder, self.probe_timeout).await {
                    Err(MobilityError::NameClash {
                        agent: agent.clone(),
                        holder,
                    })
                } else {
                    warn!(agent = %agent, holder = %holder, "stale directory entry, force-replacing");
                    gadt.insert(agent, container, owner, true).await?;
                    info!(agent = %agent, container = %container, "identity registered");
                    Ok(())
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn resolve_owner(&self, agent: &AgentName) -> Result<ContainerName, MobilityError> {
        let gadt = self.require_gadt("owner lookup")?;
        let entry = gadt.lookup(agent).await.ok_or_else(|| MobilityError::NotFound {
            agent: agent.clone(),
        })?;
        Ok(entry.container)
    }

    fn require_gadt(&self, op: &str) -> Result<&GlobalAgentDirectory, MobilityError> {
        self.gadt.as_ref().ok_or_else(|| {
            MobilityError::link(&self.name, format!("{} requires the main container", op))
        })
    }

    async fn probe_ready(&self, container: &ContainerName) -> bool {
        matches!(
            tokio::time::timeout(
                self.probe_timeout,
                call_with_retry(self.transport.as_ref(), container, Command::Prepare),
            )
            .await,
            Ok(Ok(Reply::Ready { ready: true }))
        )
    }

    // =========================================================================
    // Local bookkeeping
    // =========================================================================

    /// The container an agent's code must be fetched from; this container
    /// for locally born agents.
    pub(crate) fn class_site_of(&self, agent: &AgentName) -> ContainerName {
        self.lock_sites()
            .get(agent)
            .cloned()
            .unwrap_or_else(|| self.name.clone())
    }

    fn record_site(&self, agent: &AgentName, class_site: ContainerName) {
        self.lock_sites().insert(agent.clone(), class_site);
    }

    /// Drops every trace of an agent that left or was discarded.
    pub(crate) fn forget_agent(&self, agent: &AgentName) {
        self.ladt.remove(agent);
        self.lock_sites().remove(agent);
        self.lock_provisions().remove(agent);
        self.code_sources.remove_agent(agent);
    }

    fn lock_sites(&self) -> std::sync::MutexGuard<'_, HashMap<AgentName, ContainerName>> {
        match self.sites.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_provisions(&self) -> std::sync::MutexGuard<'_, HashMap<AgentName, RequestId>> {
        match self.provisions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl CommandHandler for ContainerNode {
    async fn handle(
        &self,
        origin: &ContainerName,
        command: Command,
    ) -> Result<Reply, MobilityError> {
        ContainerNode::handle(self, origin, command).await
    }
}
