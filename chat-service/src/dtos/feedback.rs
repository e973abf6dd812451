use crate::services::FeedbackSubmission;
use serde::Deserialize;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRequest {
    /// Local or analytics-side id of the rated message.
    #[serde(alias = "message_id")]
    #[validate(length(min = 1, max = 256, message = "Message id is required"))]
    pub message_id: String,

    #[serde(alias = "is_positive")]
    pub is_positive: bool,

    #[validate(length(max = 4000, message = "Feedback text is too long"))]
    pub content: Option<String>,
}

impl From<FeedbackRequest> for FeedbackSubmission {
    fn from(req: FeedbackRequest) -> Self {
        FeedbackSubmission {
            message_id: req.message_id,
            is_positive: req.is_positive,
            content: req.content.filter(|c| !c.trim().is_empty()),
        }
    }
}
