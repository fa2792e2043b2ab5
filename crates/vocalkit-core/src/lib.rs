//! Event model, publish/subscribe bus and workflow-result state machine used
//! between vocalkit's background workers and the UI thread.

pub mod bus;
pub mod events;
pub mod workflow;

pub use bus::{EventBus, Subscriber, SubscriptionId};
pub use events::{Event, EventKind, EventValue};
pub use workflow::{Remedy, ResultGate, TerminalLatch, WorkflowResult};
