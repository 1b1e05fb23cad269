//! Request and reply envelopes - the framed units of a wire exchange.

use serde::{Deserialize, Serialize};

use caravan_id::{ContainerName, RequestId};

use crate::{Command, MobilityError, Reply};

/// One outbound request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id, echoed back in the reply.
    pub request_id: RequestId,

    /// The container issuing the request.
    pub origin: ContainerName,

    /// The operation to perform.
    pub command: Command,
}

impl Envelope {
    /// Wraps a command in a fresh envelope.
    pub fn new(origin: ContainerName, command: Command) -> Self {
        Self {
            request_id: RequestId::new(),
            origin,
            command,
        }
    }
}

/// One reply frame. Failures travel as typed taxonomy kinds, never as raw
/// transport errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    /// Correlation id of the request this answers.
    pub request_id: RequestId,

    /// The operation result.
    pub result: Result<Reply, MobilityError>,
}
