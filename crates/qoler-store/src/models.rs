//! Row types returned by the store. Field names match the JSON the HTTP API
//! serves.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub is_deletable: bool,
    pub is_group: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    #[serde(rename = "channelId")]
    pub channel_id: i64,
    pub user: String,
    pub text: String,
    pub timestamp: String,
    #[serde(rename = "replyToId")]
    pub reply_to_id: Option<i64>,
    #[serde(rename = "repliedToUser")]
    pub replied_to_user: Option<String>,
    #[serde(rename = "repliedToText")]
    pub replied_to_text: Option<String>,
}

/// A user row ready for insertion, password already hashed.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
}

/// Outcome of a bulk user import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
}
