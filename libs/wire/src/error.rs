//! The mobility error taxonomy.
//!
//! Every failure a peer can observe is one of these kinds; raw transport or
//! codec errors are folded into `LinkFailure` / `Serialization` at the
//! boundary so callers never see an unclassified error.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use caravan_id::{AgentName, ContainerName};

use crate::LifeCycleState;

/// Typed failure outcomes of the mobility protocol.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MobilityError {
    /// The agent identity is unknown to the container that was asked.
    #[error("agent {agent} not found")]
    NotFound { agent: AgentName },

    /// A clone target name is already registered to a live agent.
    #[error("name {agent} already registered to container {holder}")]
    NameClash {
        agent: AgentName,
        holder: ContainerName,
    },

    /// The mobility policy rejected the operation.
    #[error("denied by mobility policy: {reason}")]
    SecurityDenied { reason: String },

    /// A transport-level failure reaching a participant. Retried once
    /// against a re-resolved handle before escalating.
    #[error("link failure contacting {container}: {detail}")]
    LinkFailure {
        container: ContainerName,
        detail: String,
    },

    /// A code module could not be resolved at the class site. Fatal to the
    /// materialization that needed it; not retried.
    #[error("code module {module} not found for agent {agent}")]
    CodeNotFound { module: String, agent: AgentName },

    /// Snapshot encode/decode failure. Fatal to the transaction; the source
    /// agent is always rolled back to ACTIVE.
    #[error("snapshot serialization error: {detail}")]
    Serialization { detail: String },

    /// A life-cycle transition outside the legal edge set.
    #[error("illegal life-cycle transition {from} -> {to} for agent {agent}")]
    IllegalTransition {
        agent: AgentName,
        from: LifeCycleState,
        to: LifeCycleState,
    },

    /// The transaction was preempted by a request incompatible with the
    /// agent's current state.
    #[error("transaction interrupted: {detail}")]
    Interrupted { detail: String },
}

impl MobilityError {
    /// True if a single retry against a freshly resolved handle is
    /// warranted before escalating.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, MobilityError::LinkFailure { .. })
    }

    /// Wraps an unclassified transport-level failure.
    pub fn link(container: &ContainerName, detail: impl std::fmt::Display) -> Self {
        MobilityError::LinkFailure {
            container: container.clone(),
            detail: detail.to_string(),
        }
    }
}
