pub mod chat;
pub mod feedback;

pub use chat::ChatRequest;
pub use feedback::FeedbackRequest;
