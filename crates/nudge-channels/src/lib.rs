//! # nudge-channels
//!
//! Outbound channel sinks. Each delivery mechanism implements the
//! `ChannelSink` trait from nudge-core; the dispatcher treats them as
//! interchangeable. The in-app sink lives with the connection registry in
//! the engine binary — it needs the registry handle.

pub mod email;
pub mod push;

pub use email::EmailSink;
pub use push::PushGatewaySink;
