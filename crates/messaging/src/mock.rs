//! `MockTransport`: a test double for `MessageTransport`.
//!
//! Records every message it receives and answers with a programmer-specified
//! result.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use auth::{AuthorizationCode, ServiceId};

use crate::{ActivityContext, MessageSendingResult, MessageTransport, OutboundMessage, TransportError};

/// Behaviour injected into `MockTransport` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Answer every message with this result.
    Reply(MessageSendingResult),
    /// Fail every message with `TransportError::Unreachable`.
    Unreachable(String),
}

/// One message seen by the mock.
#[derive(Debug, Clone)]
pub struct RecordedMessage {
    pub engine: ServiceId,
    pub message: OutboundMessage,
    pub node_instance: i64,
    pub node_id: String,
    pub code: Option<AuthorizationCode>,
}

pub struct MockTransport {
    behaviour: Mutex<MockBehaviour>,
    /// All messages seen, in call order.
    pub calls: Arc<Mutex<Vec<RecordedMessage>>>,
}

impl MockTransport {
    pub fn new(behaviour: MockBehaviour) -> Self {
        Self { behaviour: Mutex::new(behaviour), calls: Arc::new(Mutex::new(Vec::new())) }
    }

    /// A receiver that only confirms hand-over.
    pub fn sending() -> Self {
        Self::new(MockBehaviour::Reply(MessageSendingResult::Sent))
    }

    pub fn acknowledging() -> Self {
        Self::new(MockBehaviour::Reply(MessageSendingResult::Acknowledged))
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self::new(MockBehaviour::Reply(MessageSendingResult::Failed(reason.into())))
    }

    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self::new(MockBehaviour::Unreachable(reason.into()))
    }

    /// Change how later messages are answered.
    pub fn set_behaviour(&self, behaviour: MockBehaviour) {
        *self.behaviour.lock().unwrap_or_else(PoisonError::into_inner) = behaviour;
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn recorded(&self) -> Vec<RecordedMessage> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Messages sent for the model node `node_id`.
    pub fn sent_for(&self, node_id: &str) -> Vec<RecordedMessage> {
        self.recorded().into_iter().filter(|m| m.node_id == node_id).collect()
    }
}

#[async_trait]
impl MessageTransport for MockTransport {
    async fn send_message(
        &self,
        engine: &ServiceId,
        message: &OutboundMessage,
        context: &ActivityContext,
        auth: Option<&AuthorizationCode>,
    ) -> Result<MessageSendingResult, TransportError> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(RecordedMessage {
            engine: engine.clone(),
            message: message.clone(),
            node_instance: context.node_instance,
            node_id: context.node_id.clone(),
            code: auth.cloned(),
        });

        let behaviour = self.behaviour.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match behaviour {
            MockBehaviour::Reply(result) => Ok(result),
            MockBehaviour::Unreachable(reason) => Err(TransportError::Unreachable(reason)),
        }
    }
}
