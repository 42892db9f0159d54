//! Broadcast envelopes pushed to realtime clients.
//!
//! Envelopes are immutable values. The wire shape is `{"type": "...", ...}`
//! with the payload under `data`, except deletions which carry the removed
//! row's `id` directly.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event delivered to WebSocket clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastEnvelope {
    NewMessage { data: Value },
    MessageDeleted { id: i64 },
    ChannelCreated { data: Value },
    ChannelUpdated { data: Value },
    ChannelDeleted { id: i64 },
    MembersUpdated { data: MembersChanged },
    /// Current presence set, sorted.
    UserListUpdate { data: Vec<String> },
    /// Tell the recipient its channel list is stale.
    RefetchChannels,
}

/// Payload of `members_updated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembersChanged {
    #[serde(rename = "channelId")]
    pub channel_id: i64,
}

impl BroadcastEnvelope {
    pub fn members_updated(channel_id: i64) -> Self {
        Self::MembersUpdated { data: MembersChanged { channel_id } }
    }

    /// The wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => "new_message",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::ChannelCreated { .. } => "channel_created",
            Self::ChannelUpdated { .. } => "channel_updated",
            Self::ChannelDeleted { .. } => "channel_deleted",
            Self::MembersUpdated { .. } => "members_updated",
            Self::UserListUpdate { .. } => "user_list_update",
            Self::RefetchChannels => "refetch_channels",
        }
    }

    /// Serialize once for fan-out.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
