//! Domain models for the chat service.

pub mod conversation;
pub mod feedback;
pub mod id_mapping;
pub mod message;
pub mod session;

pub use conversation::{Conversation, ConversationStatus};
pub use feedback::Feedback;
pub use id_mapping::IdMapping;
pub use message::{Message, Role};
pub use session::{Session, SessionOutcome, SessionRecord, SessionResolution};
