use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A published message. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub header: String,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl Announcement {
    pub fn new(header: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            message: message.into(),
            time: Utc::now(),
        }
    }
}
