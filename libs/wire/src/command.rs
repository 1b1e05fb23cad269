//! The closed command set of the mobility protocol.
//!
//! One variant per remote operation; handlers dispatch with an exhaustive
//! match. Adding an operation means adding a variant, which the compiler
//! then forces every dispatcher to handle.

use serde::{Deserialize, Serialize};

use caravan_id::{AgentName, ContainerName, RequestId};

use crate::{AgentMessage, MobilityError};

/// Whether a relocation moves the agent or duplicates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelocateMode {
    /// Relocate the agent; the source instance is destroyed on commit.
    Move,
    /// Duplicate the agent under a new identity; the source always stays.
    Clone,
}

impl std::fmt::Display for RelocateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelocateMode::Move => write!(f, "move"),
            RelocateMode::Clone => write!(f, "clone"),
        }
    }
}

/// Verdict of the identity-transfer step, shipped to the destination so it
/// either powers up or discards its provisioned copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferVerdict {
    Commit,
    Abort,
}

/// Outcome of a relocation as observed by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RelocateOutcome {
    /// The transaction committed.
    Committed,
    /// The transaction aborted; the cause is attached and the source agent
    /// was restored to ACTIVE.
    Aborted { cause: MobilityError },
}

impl RelocateOutcome {
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, RelocateOutcome::Committed)
    }
}

/// A remote operation of the mobility protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    /// Provision an agent on the receiving container from a snapshot.
    ///
    /// The instance is materialized in TRANSIT (move) or COPY (clone) state
    /// and, unless `start` is set, stays invisible to message routing until
    /// the transfer verdict arrives.
    ///
    /// `provision_id` is minted once per transaction and reused verbatim on
    /// a retry, so a receiver that already executed the creation but lost
    /// the reply acknowledges instead of creating twice.
    CreateAgent {
        agent: AgentName,
        /// Encoded [`crate::AgentSnapshot`]; decoded on the receiving side so
        /// codec failures surface as `Serialization` errors there.
        snapshot: Vec<u8>,
        class_site: ContainerName,
        mode: RelocateMode,
        start: bool,
        provision_id: RequestId,
    },

    /// Fetch the bytecode of one code module from the class site.
    FetchCodeModule { module: String, agent: AgentName },

    /// Ask the main container to relocate an agent; it resolves the owner
    /// and forwards a `MoveAgent` there.
    RequestMove {
        agent: AgentName,
        destination: ContainerName,
    },

    /// Ask the main container to clone an agent; it resolves the owner and
    /// forwards a `CopyAgent` there.
    RequestClone {
        agent: AgentName,
        destination: ContainerName,
        new_name: AgentName,
    },

    /// Run a move transaction on the container owning the agent.
    MoveAgent {
        agent: AgentName,
        destination: ContainerName,
    },

    /// Run a clone transaction on the container owning the agent.
    CopyAgent {
        agent: AgentName,
        destination: ContainerName,
        new_name: AgentName,
    },

    /// Readiness probe used by the coordinator before committing an
    /// identity transfer.
    Prepare,

    /// Atomically re-point the global directory entry for `agent` from
    /// `from` to `to`. Only the main container honors this.
    TransferIdentity {
        agent: AgentName,
        from: ContainerName,
        to: ContainerName,
    },

    /// Deliver the transfer verdict to the destination, together with the
    /// messages buffered on the source during the transaction (in original
    /// arrival order).
    HandleTransferResult {
        agent: AgentName,
        verdict: TransferVerdict,
        messages: Vec<AgentMessage>,
    },

    /// Register a newly created agent, born or cloned, in the global
    /// directory. Only the main container honors this.
    InformCloned {
        agent: AgentName,
        container: ContainerName,
        owner: Option<String>,
    },

    /// Liveness probe. Also the readiness probe's transport.
    Ping,
}

impl Command {
    /// Operation name for logging.
    #[must_use]
    pub fn op_name(&self) -> &'static str {
        match self {
            Command::CreateAgent { .. } => "create_agent",
            Command::FetchCodeModule { .. } => "fetch_code_module",
            Command::RequestMove { .. } => "request_move",
            Command::RequestClone { .. } => "request_clone",
            Command::MoveAgent { .. } => "move_agent",
            Command::CopyAgent { .. } => "copy_agent",
            Command::Prepare => "prepare",
            Command::TransferIdentity { .. } => "transfer_identity",
            Command::HandleTransferResult { .. } => "handle_transfer_result",
            Command::InformCloned { .. } => "inform_cloned",
            Command::Ping => "ping",
        }
    }
}

/// Success payloads, one shape per command family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    /// Plain acknowledgement.
    Ack,
    /// Readiness/liveness answer.
    Ready { ready: bool },
    /// Identity transfer verdict: true committed, false aborted.
    Transferred { committed: bool },
    /// Raw bytecode of a fetched module.
    Code { bytes: Vec<u8> },
    /// Outcome of a relocation run on the owning container.
    Relocated { outcome: RelocateOutcome },
}

// =============================================================================
// Tests
// =============================================================================
