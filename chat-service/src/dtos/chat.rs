use crate::services::TurnRequest;
use serde::Deserialize;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// Client-held session token. Absent on first contact.
    #[serde(default, alias = "session_id")]
    #[validate(length(max = 128, message = "Session id is too long"))]
    pub session_id: Option<String>,

    #[validate(length(min = 1, max = 8000, message = "Message must be 1-8000 characters"))]
    pub message: String,

    #[validate(length(min = 2, max = 16, message = "Invalid language code"))]
    pub language: Option<String>,

    /// Attachment URLs passed through to the model.
    #[serde(default)]
    #[validate(length(max = 10, message = "At most 10 attachments"))]
    pub attachments: Vec<String>,
}

impl From<ChatRequest> for TurnRequest {
    fn from(req: ChatRequest) -> Self {
        TurnRequest {
            session_id: req.session_id,
            message: req.message,
            language: req.language,
            attachments: req.attachments,
        }
    }
}
