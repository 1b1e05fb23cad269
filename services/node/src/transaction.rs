//! The relocation transaction, run on the source container.
//!
//! The transaction advances through explicit phases; on failure, rollback is
//! keyed off the last phase reached, so every acquired resource is undone in
//! reverse order and the source agent ends up exactly where it started.
//!
//! Phases of a move:
//!   1. acquire the agent, enter TRANSIT, snapshot
//!   2. provision the copy on the destination
//!   3. identity transfer through the main container (the commit point)
//!   4. finalize: ship the transfer buffer and destroy the local instance,
//!      or restore it and tell the destination to discard
//!
//! A clone stops after provisioning: the destination registers and powers up
//! the copy itself, and the source always returns to ACTIVE.

use tracing::{error, info, warn};

use caravan_id::{AgentName, ContainerName, RequestId};
use caravan_wire::{
    Command, LifeCycleState, MobilityError, RelocateMode, RelocateOutcome, Reply, TransferVerdict,
};

use crate::ladt::AgentGuard;
use crate::node::ContainerNode;
use crate::transport::call_with_retry;

/// Agent held, pre-transaction image buffered, state flipped.
const PHASE_ACQUIRED: u8 = 1;
/// Destination holds a provisioned copy.
const PHASE_PROVISIONED: u8 = 2;

/// Why a transaction stopped, and how far it got.
struct Abort {
    phase: u8,
    cause: MobilityError,
}

impl Abort {
    fn at(phase: u8, cause: MobilityError) -> Self {
        Self { phase, cause }
    }
}

impl ContainerNode {
    /// Runs a relocation transaction for a local agent. Never panics and
    /// never leaves the agent in a transient state: the outcome is either
    /// COMMITTED or ABORTED with the source restored to ACTIVE.
    ///
    /// A clone request missing its new name is refused before any state
    /// changes; the closed taxonomy reports that refusal as `Interrupted`,
    /// the kind covering requests incompatible with the transaction's
    /// requirements.
    pub async fn relocate(
        &self,
        agent: &AgentName,
        destination: &ContainerName,
        mode: RelocateMode,
        new_name: Option<AgentName>,
    ) -> RelocateOutcome {
        info!(agent = %agent, destination = %destination, mode = %mode, "relocation requested");

        let mut guard = match self.ladt.acquire(agent).await {
            Ok(guard) => guard,
            Err(cause) => return RelocateOutcome::Aborted { cause },
        };

        // A move to the current container has nothing to do.
        if mode == RelocateMode::Move && destination == &self.name {
            info!(agent = %agent, "destination is the current container, nothing to move");
            return RelocateOutcome::Committed;
        }

        let authorized = match mode {
            RelocateMode::Move => self.policy.authorize_move(agent, destination),
            RelocateMode::Clone => self.policy.authorize_clone(agent, destination),
        };
        if let Err(cause) = authorized {
            warn!(agent = %agent, error = %cause, "relocation denied");
            return RelocateOutcome::Aborted { cause };
        }

        let target_name = match (mode, new_name) {
            (RelocateMode::Move, _) => agent.clone(),
            (RelocateMode::Clone, Some(name)) => name,
            (RelocateMode::Clone, None) => {
                return RelocateOutcome::Aborted {
                    cause: MobilityError::Interrupted {
                        detail: "clone requires a new name".to_string(),
                    },
                }
            }
        };

        let result = match mode {
            RelocateMode::Move => self.run_move(&mut guard, agent, destination).await,
            RelocateMode::Clone => {
                self.run_clone(&mut guard, agent, destination, &target_name)
                    .await
            }
        };

        match result {
            Ok(()) => {
                info!(agent = %agent, destination = %destination, mode = %mode, "relocation committed");
                RelocateOutcome::Committed
            }
            Err(abort) => {
                self.rollback(&mut guard, destination, &target_name, &abort)
                    .await;
                warn!(
                    agent = %agent,
                    destination = %destination,
                    mode = %mode,
                    phase = abort.phase,
                    error = %abort.cause,
                    "relocation aborted, source restored"
                );
                RelocateOutcome::Aborted { cause: abort.cause }
            }
        }
    }

    async fn run_move(
        &self,
        guard: &mut AgentGuard,
        agent: &AgentName,
        destination: &ContainerName,
    ) -> Result<(), Abort> {
        // Phase 1: enter TRANSIT and snapshot. A failing pre-hook has
        // already restored the agent.
        guard
            .begin_relocation(RelocateMode::Move)
            .map_err(|e| Abort::at(0, e))?;
        let snapshot_bytes = guard
            .snapshot()
            .encode()
            .map_err(|e| Abort::at(PHASE_ACQUIRED, e))?;
        let class_site = self.class_site_of(agent);

        // Phase 2: provision the copy.
        self.provision(
            destination,
            agent.clone(),
            snapshot_bytes,
            class_site,
            RelocateMode::Move,
        )
        .await
        .map_err(|e| Abort::at(PHASE_ACQUIRED, e))?;

        // The hold is exclusive, but a verdict for a previous incarnation
        // could have slipped in before it was taken.
        if guard.state() != LifeCycleState::Transit {
            return Err(Abort::at(
                PHASE_PROVISIONED,
                MobilityError::Interrupted {
                    detail: format!("agent left TRANSIT ({})", guard.state()),
                },
            ));
        }

        // Phase 3: the commit point.
        let reply = call_with_retry(
            self.transport.as_ref(),
            &self.main_container,
            Command::TransferIdentity {
                agent: agent.clone(),
                from: self.name.clone(),
                to: destination.clone(),
            },
        )
        .await
        .map_err(|e| Abort::at(PHASE_PROVISIONED, e))?;
        let committed = match reply {
            Reply::Transferred { committed } => committed,
            other => {
                return Err(Abort::at(
                    PHASE_PROVISIONED,
                    MobilityError::link(
                        &self.main_container,
                        format!("unexpected reply {:?} to identity transfer", other),
                    ),
                ))
            }
        };
        if !committed {
            return Err(Abort::at(
                PHASE_PROVISIONED,
                MobilityError::link(destination, "identity transfer aborted by coordinator"),
            ));
        }

        // Phase 4, COMMIT branch: close the inbox, drain the transfer
        // buffer, ship it, then tear down. A delivery racing the drain is
        // refused, so the sender re-routes against the updated directory
        // instead of losing the message with the departing instance.
        guard.inbox().set_visible(false);
        let messages = guard.inbox().drain();
        let shipped = call_with_retry(
            self.transport.as_ref(),
            destination,
            Command::HandleTransferResult {
                agent: agent.clone(),
                verdict: TransferVerdict::Commit,
                messages,
            },
        )
        .await;
        if let Err(e) = shipped {
            // The identity already belongs to the destination; the local
            // teardown must happen regardless.
            error!(agent = %agent, destination = %destination, error = %e,
                "verdict delivery failed after commit; destination copy needs operator attention");
        }

        if let Err(e) = guard.commit_departure() {
            error!(agent = %agent, error = %e, "departure finalization failed");
        }
        self.forget_agent(agent);
        Ok(())
    }

    async fn run_clone(
        &self,
        guard: &mut AgentGuard,
        agent: &AgentName,
        destination: &ContainerName,
        new_name: &AgentName,
    ) -> Result<(), Abort> {
        guard
            .begin_relocation(RelocateMode::Clone)
            .map_err(|e| Abort::at(0, e))?;
        let snapshot_bytes = guard
            .snapshot()
            .encode()
            .map_err(|e| Abort::at(PHASE_ACQUIRED, e))?;
        let class_site = self.class_site_of(agent);

        // The destination registers and powers up the copy itself; a name
        // clash or registration failure comes back as the typed error.
        self.provision(
            destination,
            new_name.clone(),
            snapshot_bytes,
            class_site,
            RelocateMode::Clone,
        )
        .await
        .map_err(|e| Abort::at(PHASE_ACQUIRED, e))?;

        guard.resume_active();
        Ok(())
    }

    async fn provision(
        &self,
        destination: &ContainerName,
        agent: AgentName,
        snapshot: Vec<u8>,
        class_site: ContainerName,
        mode: RelocateMode,
    ) -> Result<(), MobilityError> {
        let start = mode == RelocateMode::Clone;
        // Minted once, reused by the retry, so a creation whose reply was
        // lost is acknowledged instead of executed twice.
        let provision_id = RequestId::new();
        let reply = call_with_retry(
            self.transport.as_ref(),
            destination,
            Command::CreateAgent {
                agent,
                snapshot,
                class_site,
                mode,
                start,
                provision_id,
            },
        )
        .await?;
        match reply {
            Reply::Ack => Ok(()),
            other => Err(MobilityError::link(
                destination,
                format!("unexpected reply {:?} to provisioning", other),
            )),
        }
    }

    /// Undoes everything the failed transaction acquired, in reverse phase
    /// order. Always leaves the source agent ACTIVE with its buffered image
    /// restored; the interim message queue is never touched.
    async fn rollback(
        &self,
        guard: &mut AgentGuard,
        destination: &ContainerName,
        target_name: &AgentName,
        abort: &Abort,
    ) {
        if abort.phase >= PHASE_PROVISIONED {
            let discarded = call_with_retry(
                self.transport.as_ref(),
                destination,
                Command::HandleTransferResult {
                    agent: target_name.clone(),
                    verdict: TransferVerdict::Abort,
                    messages: Vec::new(),
                },
            )
            .await;
            if let Err(e) = discarded {
                warn!(agent = %target_name, destination = %destination, error = %e,
                    "could not tell destination to discard its copy");
            }
        }
        if abort.phase >= PHASE_ACQUIRED {
            guard.resume_active();
        }
    }
}
