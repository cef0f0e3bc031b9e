//! Process-wide routing of pushed messages to subscribed consumers.

pub mod engine;

pub use engine::ConsumerMessageDispatcher;
