use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Server-assigned or client-temporary message identifier.
///
/// Backend rows carry numeric IDs; optimistic local entries use a
/// client-generated string until the realtime echo arrives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum MessageId {
    /// Row ID assigned by the backend.
    Server(i64),
    /// Client-generated placeholder ID for not-yet-confirmed sends.
    Temp(String),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Server(id) => write!(f, "{id}"),
            MessageId::Temp(id) => write!(f, "{id}"),
        }
    }
}

/// Delivery status tracked on optimistic local entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Locally reflected, waiting for backend confirmation.
    Sending,
    /// Confirmed by the backend.
    Sent,
    /// Rejected or timed out; caller removes the entry.
    Failed,
}

/// Canonical chat message row shared by store, runtime, and adapters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub text: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Client-only marker carried by optimistic entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    /// Client-only delivery status; never round-trips to the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
}

impl Message {
    /// Whether this entry is an unconfirmed optimistic placeholder.
    pub fn is_placeholder(&self) -> bool {
        self.temp_id.is_some() && self.status == Some(MessageStatus::Sending)
    }
}

/// Insert payload for a new message row (IDs and timestamps are
/// backend-assigned).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMessage {
    pub text: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// Reaction row upserted on `(message_id, user_id, emoji)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionRow {
    pub message_id: MessageId,
    pub user_id: String,
    pub emoji: String,
}

/// Conflict target for reaction upserts; a duplicated request merges
/// instead of creating a second row.
pub const REACTION_CONFLICT_KEYS: &str = "message_id,user_id,emoji";

/// Row change pushed by the realtime change feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RowChange {
    Inserted(Message),
    Deleted { id: MessageId },
}

/// Presence channel notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PresenceEvent {
    /// Authoritative replacement of the online set.
    Synced { user_ids: Vec<String> },
    Joined { user_ids: Vec<String> },
    Left { user_ids: Vec<String> },
}

/// Ephemeral typing signal carried over the broadcast channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingSignal {
    pub user_id: String,
}

/// Zero-based item range for a paged, ordered select.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageRange {
    pub from: usize,
    pub to: usize,
}

impl PageRange {
    /// Range covering `page` with `page_size` items per page.
    pub fn for_page(page: u32, page_size: usize) -> Self {
        let page_size = page_size.max(1);
        let from = page as usize * page_size;
        Self {
            from,
            to: from + page_size - 1,
        }
    }
}

/// Runtime tuning knobs with production defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomTuning {
    /// Items per history page.
    pub page_size: usize,
    /// Typing indicator expiry without a refreshing signal.
    pub typing_ttl_ms: u64,
    /// Minimum gap between own-typing broadcasts.
    pub typing_rebroadcast_ms: u64,
    /// Cooldown suppressing repeated panic triggers.
    pub panic_cooldown_ms: u64,
}

impl Default for RoomTuning {
    fn default() -> Self {
        Self {
            page_size: 20,
            typing_ttl_ms: 3_000,
            typing_rebroadcast_ms: 2_000,
            panic_cooldown_ms: 2_000,
        }
    }
}

/// Command channel input accepted by the room runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RoomCommand {
    /// Load the newest history page, replacing the conversation.
    LoadInitial,
    /// Fetch the next (older) history page; no-op while one is in flight.
    FetchOlder,
    /// Send a text message, attached to the active reply target if any.
    SendText { body: String },
    /// Upload an image and send the resulting message.
    SendImage { data: Vec<u8>, content_type: String },
    /// Add an emoji reaction to a message.
    React { message_id: MessageId, emoji: String },
    /// Mark a message as the active reply target.
    SetReplyTarget { message_id: MessageId },
    /// Clear the active reply target.
    ClearReplyTarget,
    /// Composer input changed; may broadcast an own-typing signal.
    ComposerChanged,
    /// Horizontal pan began on a message bubble.
    PanStart { message_id: MessageId },
    /// Pan displacement update.
    PanMove { dx: f32, dy: f32 },
    /// Pan released with final horizontal displacement.
    PanEnd { dx: f32 },
    /// Pan cancelled by the gesture system.
    PanCancel,
    /// Long-press recognized on a message bubble.
    LongPress { message_id: MessageId },
    /// Reaction prompt dismissed.
    ReactionPromptClosed,
    /// Wipe conversation state and fire the distress side channel.
    Panic,
    /// Tear down subscriptions and timers, then exit.
    Shutdown,
}

/// Per-message horizontal swipe offset reported to the UI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SwipeOffset {
    pub message_id: MessageId,
    pub offset_px: f32,
}

/// Event channel output emitted by the room runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ChatEvent {
    /// Initial-load spinner state.
    Loading { active: bool },
    /// Older-page fetch spinner state.
    FetchingOlder { active: bool },
    /// Full render-ready conversation snapshot, newest first.
    ConversationUpdated { messages: Vec<Message> },
    /// Current set of users with a live typing indicator.
    TypingChanged { user_ids: Vec<String> },
    /// Current online set from the presence channel.
    OnlineChanged { user_ids: Vec<String> },
    /// Active reply target changed (None when cleared).
    ReplyTargetChanged { target: Option<Box<Message>> },
    /// Long-press fired; UI shows the reaction palette for this message.
    ReactionPromptOpened { message_id: MessageId },
    /// Swipe offsets changed for one or more messages.
    SwipeOffsetsChanged { offsets: Vec<SwipeOffset> },
    /// A history read failed; surfaced for display, no automatic retry.
    ReadFailed { error: ClientError },
    /// A user-visible send failed; optimistic state already rolled back.
    SendFailed { error: ClientError },
    /// Local panic wipe completed (independent of the side channel).
    PanicCompleted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_accepts_numeric_and_string_forms() {
        let numeric: MessageId = serde_json::from_str("42").expect("numeric id");
        assert_eq!(numeric, MessageId::Server(42));

        let temp: MessageId = serde_json::from_str("\"temp-abc\"").expect("temp id");
        assert_eq!(temp, MessageId::Temp("temp-abc".to_owned()));
    }

    #[test]
    fn message_row_deserializes_from_backend_shape() {
        let row = r#"{
            "id": 7,
            "created_at": "2024-06-01T12:00:00Z",
            "text": "hello",
            "user_id": "u1",
            "parent_message_id": 3
        }"#;

        let message: Message = serde_json::from_str(row).expect("row should parse");
        assert_eq!(message.id, MessageId::Server(7));
        assert_eq!(message.parent_message_id, Some(MessageId::Server(3)));
        assert_eq!(message.image_url, None);
        assert!(!message.is_placeholder());
    }

    #[test]
    fn client_only_fields_are_not_serialized_when_absent() {
        let message = Message {
            id: MessageId::Server(1),
            created_at: Utc::now(),
            text: "hi".to_owned(),
            user_id: "u1".to_owned(),
            parent_message_id: None,
            image_url: None,
            temp_id: None,
            status: None,
        };

        let encoded = serde_json::to_string(&message).expect("encode");
        assert!(!encoded.contains("temp_id"));
        assert!(!encoded.contains("status"));
    }

    #[test]
    fn page_ranges_tile_without_overlap() {
        let size = 20;
        assert_eq!(PageRange::for_page(0, size), PageRange { from: 0, to: 19 });
        assert_eq!(PageRange::for_page(1, size), PageRange { from: 20, to: 39 });
        assert_eq!(PageRange::for_page(3, size), PageRange { from: 60, to: 79 });
    }

    #[test]
    fn default_tuning_matches_production_values() {
        let tuning = RoomTuning::default();
        assert_eq!(tuning.page_size, 20);
        assert_eq!(tuning.typing_ttl_ms, 3_000);
        assert_eq!(tuning.panic_cooldown_ms, 2_000);
    }
}
