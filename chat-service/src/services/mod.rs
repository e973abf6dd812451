pub mod assembler;
pub mod broadcast;
pub mod chat;
pub mod database;
pub mod dedup;
pub mod forwarder;
pub mod metrics;
pub mod providers;
pub mod reconciler;
pub mod response_cache;
pub mod session_store;
pub mod store;

pub use assembler::ConversationAssembler;
pub use broadcast::{ChatEvent, ChatEvents};
pub use chat::{ChatReply, ChatService, FeedbackReceipt, FeedbackSubmission, StreamEvent, TurnRequest};
pub use database::ChatDb;
pub use dedup::{ForwardLedger, MessageDeduplicator};
pub use forwarder::{AnalyticsForwarder, HttpAnalyticsForwarder};
pub use reconciler::{FeedbackTarget, IdReconciler};
pub use response_cache::{CacheKey, CachedReply, ResponseCache};
pub use session_store::SessionStore;
pub use store::{ChatStore, InMemoryChatStore};
