//! Client-side chat reconciliation core.
//!
//! This crate defines the room command/event protocol, the paged
//! conversation store with live-insert reconciliation, typing/presence
//! tracking, gesture arbitration, and the runtime that drives them over
//! a pluggable backend.

/// Backend capability trait, subscription feeds, and the in-memory
/// test backend.
pub mod backend;
/// Paged conversation state with live-insert reconciliation.
pub mod conversation;
/// Reaction gating, panic cooldown, and outgoing-send helpers.
pub mod dispatcher;
/// Stable client error types and HTTP classification helpers.
pub mod error;
/// Swipe-to-reply vs long-press-to-react arbitration.
pub mod gesture;
/// Typing indicator tracking and the online roster.
pub mod presence;
/// Backoff policy used by resubscribe loops.
pub mod retry;
/// The room runtime command loop.
pub mod runtime;
/// Frontend-facing protocol types (commands, events, rows).
pub mod types;

pub use backend::{ChangeFeed, ChatBackend, InMemoryBackend, PresenceFeed, SubscriptionGuard, TypingFeed};
pub use conversation::{ConversationStore, IMAGE_UPLOAD_PLACEHOLDER};
pub use dispatcher::{
    IMAGE_BUCKET, PanicLatch, REACTION_EMOJIS, ReactionGate, ReactionTicket, SENT_IMAGE_TEXT,
    is_supported_reaction, validate_outgoing_text,
};
pub use error::{ClientError, ClientErrorCategory, classify_http_status};
pub use gesture::{GestureArbiter, PanRelease, PanUpdate};
pub use presence::{OnlineRoster, TypingTracker};
pub use retry::RetryPolicy;
pub use runtime::{EventStream, PANIC_ALERT_FUNCTION, RoomClosed, RoomHandle, spawn_room};
pub use types::{
    ChatEvent, Message, MessageId, MessageStatus, NewMessage, PageRange, PresenceEvent,
    REACTION_CONFLICT_KEYS, ReactionRow, RoomCommand, RoomTuning, RowChange, SwipeOffset,
    TypingSignal,
};
