//! The `MessageTransport` trait: the contract between the engine and the
//! services its activities talk to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use auth::{AuthorizationCode, Principal, ServiceId};

use crate::{ProcessData, TransportError};

/// What an activity sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Receiving service.
    pub service: ServiceId,
    pub operation: String,
    #[serde(default)]
    pub content: Vec<ProcessData>,
}

/// The activity a message is sent for.
///
/// Built by the engine so receivers can address their replies without
/// depending on the engine crate.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub process_instance: i64,
    pub node_instance: i64,
    /// Id of the node in the process model.
    pub node_id: String,
    pub process_name: String,
    pub owner: Principal,
    /// Instance inputs plus the results of the node's predecessors.
    pub data: Vec<ProcessData>,
}

/// How far delivery got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSendingResult {
    /// Handed over; an acknowledgement may follow later.
    Sent,
    /// The receiver already confirmed it took the message.
    Acknowledged,
    /// The receiver refused the message.
    Failed(String),
}

#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Deliver `message` on behalf of `engine`, with the authorization code
    /// the receiver may exchange for a token.
    async fn send_message(
        &self,
        engine: &ServiceId,
        message: &OutboundMessage,
        context: &ActivityContext,
        auth: Option<&AuthorizationCode>,
    ) -> Result<MessageSendingResult, TransportError>;
}
