//! `messaging` crate — what the engine sends to the outside world and who
//! receives it.
//!
//! The engine only knows the [`MessageTransport`] trait. [`TaskList`] is the
//! in-process intermediary that turns activity messages into tasks a user
//! can accept; [`MockTransport`] records messages for tests.

pub mod data;
pub mod error;
pub mod transport;
pub mod tasklist;
pub mod mock;

pub use data::ProcessData;
pub use error::TransportError;
pub use transport::{ActivityContext, MessageSendingResult, MessageTransport, OutboundMessage};
pub use tasklist::{PostedTask, TaskList};
pub use mock::{MockBehaviour, MockTransport};
