//! Agent snapshots and inbound messages.
//!
//! A snapshot is the explicit, versioned serialized form of an agent's
//! private state plus its pending life-cycle marker. The destination
//! reconstructs the instance deterministically from it; the wire format is
//! decoupled from any in-memory representation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use caravan_id::AgentName;

use crate::MobilityError;

/// Current snapshot format version. Bumped on incompatible layout changes.
pub const SNAPSHOT_VERSION: u16 = 1;

/// Life-cycle state of an agent instance.
///
/// An instance outside `Active` is exclusively held by the mobility
/// machinery; only the owning transaction may drain its queue or mutate its
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifeCycleState {
    /// Normal execution. The initial and default state.
    Active,
    /// A move is in progress.
    Transit,
    /// A clone is in progress.
    Copy,
    /// Terminal: the agent has left this container permanently.
    Gone,
}

impl LifeCycleState {
    /// Returns true if the edge `self -> to` is a legal transition.
    ///
    /// Legal edges: ACTIVE → TRANSIT, ACTIVE → COPY,
    /// TRANSIT → {GONE, ACTIVE}, COPY → ACTIVE.
    #[must_use]
    pub fn can_transition_to(self, to: LifeCycleState) -> bool {
        matches!(
            (self, to),
            (LifeCycleState::Active, LifeCycleState::Transit)
                | (LifeCycleState::Active, LifeCycleState::Copy)
                | (LifeCycleState::Transit, LifeCycleState::Gone)
                | (LifeCycleState::Transit, LifeCycleState::Active)
                | (LifeCycleState::Copy, LifeCycleState::Active)
        )
    }
}

impl Default for LifeCycleState {
    fn default() -> Self {
        LifeCycleState::Active
    }
}

impl std::fmt::Display for LifeCycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifeCycleState::Active => "active",
            LifeCycleState::Transit => "transit",
            LifeCycleState::Copy => "copy",
            LifeCycleState::Gone => "gone",
        };
        write!(f, "{}", s)
    }
}

/// One inbound message for an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    /// The sending agent.
    pub sender: AgentName,

    /// Opaque message body.
    pub body: serde_json::Value,

    /// When the message was sent.
    pub sent_at: DateTime<Utc>,
}

impl AgentMessage {
    /// Convenience constructor stamping the current time.
    pub fn new(sender: AgentName, body: serde_json::Value) -> Self {
        Self {
            sender,
            body,
            sent_at: Utc::now(),
        }
    }
}

/// Serialized form of an agent's private state and pending life-cycle
/// marker, shipped from source to destination container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    /// Snapshot format version.
    pub version: u16,

    /// The agent's identity at serialization time. For a clone the
    /// destination registers the instance under the freshly minted name
    /// carried by the create command, not this one.
    pub agent: AgentName,

    /// Pending life-cycle marker (`Transit` for a move, `Copy` for a clone).
    pub lifecycle: LifeCycleState,

    /// Owner principal, carried into the destination's directory entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// The agent's private state fields. Ordered so encoding is
    /// deterministic.
    pub state: BTreeMap<String, serde_json::Value>,

    /// Names of the code modules the agent needs; resolved lazily on the
    /// destination against the agent's class site.
    pub code_modules: Vec<String>,
}

impl AgentSnapshot {
    /// Encodes the snapshot to its wire form.
    pub fn encode(&self) -> Result<Vec<u8>, MobilityError> {
        serde_json::to_vec(self).map_err(|e| MobilityError::Serialization {
            detail: e.to_string(),
        })
    }

    /// Decodes a snapshot from its wire form, rejecting unknown versions.
    pub fn decode(bytes: &[u8]) -> Result<Self, MobilityError> {
        let snapshot: AgentSnapshot =
            serde_json::from_slice(bytes).map_err(|e| MobilityError::Serialization {
                detail: e.to_string(),
            })?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(MobilityError::Serialization {
                detail: format!(
                    "unsupported snapshot version {} (expected {})",
                    snapshot.version, SNAPSHOT_VERSION
                ),
            });
        }
        Ok(snapshot)
    }
}

// =============================================================================
// Tests
// =============================================================================
