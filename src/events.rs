use crate::chat::Message;
use serde::{Deserialize, Serialize};

/// Progress of one chat turn, as shown to the browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TurnEvent {
    /// The user's turn was appended to the session
    UserTurn(Message),

    /// Everything generated so far
    Partial(String),

    /// The assistant reply was appended and persisted
    Completed(Message),

    /// The turn could not be persisted
    Failed(String),
}

impl TurnEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TurnEvent::UserTurn(_) => "user_turn",
            TurnEvent::Partial(_) => "partial",
            TurnEvent::Completed(_) => "completed",
            TurnEvent::Failed(_) => "failed",
        }
    }
}
