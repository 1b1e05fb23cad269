//! Mobility authorization.
//!
//! The policy is consulted on the source container after the agent is
//! acquired and before anything leaves the node; a denial aborts the
//! transaction with a full local rollback.

use caravan_id::{AgentName, ContainerName};
use caravan_wire::MobilityError;

/// Decides whether a relocation may proceed.
pub trait MobilityPolicy: Send + Sync {
    fn authorize_move(
        &self,
        agent: &AgentName,
        destination: &ContainerName,
    ) -> Result<(), MobilityError>;

    fn authorize_clone(
        &self,
        agent: &AgentName,
        destination: &ContainerName,
    ) -> Result<(), MobilityError>;
}

/// Default policy: everything is allowed.
pub struct AllowAll;

impl MobilityPolicy for AllowAll {
    fn authorize_move(
        &self,
        _agent: &AgentName,
        _destination: &ContainerName,
    ) -> Result<(), MobilityError> {
        Ok(())
    }

    fn authorize_clone(
        &self,
        _agent: &AgentName,
        _destination: &ContainerName,
    ) -> Result<(), MobilityError> {
        Ok(())
    }
}

/// Denies every relocation, with a fixed reason.
pub struct DenyAll {
    pub reason: String,
}

impl MobilityPolicy for DenyAll {
    fn authorize_move(
        &self,
        _agent: &AgentName,
        _destination: &ContainerName,
    ) -> Result<(), MobilityError> {
        Err(MobilityError::SecurityDenied {
            reason: self.reason.clone(),
        })
    }

    fn authorize_clone(
        &self,
        _agent: &AgentName,
        _destination: &ContainerName,
    ) -> Result<(), MobilityError> {
        Err(MobilityError::SecurityDenied {
            reason: self.reason.clone(),
        })
    }
}
