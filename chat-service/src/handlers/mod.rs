//! HTTP handlers for the chat service.

pub mod chat;
pub mod conversations;
pub mod events;
pub mod feedback;
pub mod health;
pub mod metrics;
