use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{generate_id, IdPrefix};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id: user_id.into(),
            title: title.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Chat with a freshly generated `chat_` id.
    pub fn generated(user_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self::new(generate_id(IdPrefix::Chat), user_id, title)
    }
}

/// One generation attempt registered against a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRecord {
    pub id: String,
    pub chat_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

impl StreamRecord {
    pub fn generated(chat_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            id: generate_id(IdPrefix::Stream),
            chat_id: chat_id.into(),
            user_id: user_id.into(),
            created_at: Utc::now(),
        }
    }
}
