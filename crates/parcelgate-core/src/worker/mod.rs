//! Worker processes
//!
//! Long-running collection/delivery work happens in separate processes.
//! [`SubprocessChannel`] talks to one process; [`WorkerOrchestrator`] keeps
//! a logical worker alive across restarts and fans its output out to any
//! number of subscribers.

pub mod channel;
pub mod message;
pub mod orchestrator;

pub use channel::{SubprocessChannel, SubprocessEvent, SubprocessEvents, UNREGISTERED_EXIT_CODE};
pub use message::SubprocessMessage;
pub use orchestrator::{WorkerOrchestrator, WorkerSubscription, DEFAULT_SUBSCRIBER_CAPACITY};
