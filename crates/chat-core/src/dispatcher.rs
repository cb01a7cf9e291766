use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    conversation::IMAGE_UPLOAD_PLACEHOLDER,
    types::{Message, MessageId, MessageStatus},
};

/// Emoji palette offered by the reaction prompt.
pub const REACTION_EMOJIS: [&str; 6] = ["👍", "❤️", "😂", "🔥", "😢", "😊"];

/// Whether `emoji` belongs to the reaction palette.
///
/// The prompt only offers palette entries, so anything else reaching
/// the dispatcher is a forged or replayed command and is dropped.
pub fn is_supported_reaction(emoji: &str) -> bool {
    REACTION_EMOJIS.contains(&emoji)
}

/// Body stored for image messages.
pub const SENT_IMAGE_TEXT: &str = "Sent an image";

/// Storage bucket holding uploaded chat images.
pub const IMAGE_BUCKET: &str = "chat_images";

/// Per-message reaction in-flight gate.
///
/// At most one reaction request per message may be outstanding; repeat
/// taps while one is in flight are dropped instead of queued.
#[derive(Clone, Default)]
pub struct ReactionGate {
    in_flight: Arc<Mutex<HashSet<MessageId>>>,
}

impl ReactionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the message for a reaction request.
    ///
    /// Returns None while a request for the same message is outstanding.
    /// The returned ticket releases the claim on drop, so the gate
    /// reopens on success, failure, and panic alike.
    pub fn try_begin(&self, message_id: MessageId) -> Option<ReactionTicket> {
        let mut set = self.in_flight.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if !set.insert(message_id.clone()) {
            return None;
        }
        Some(ReactionTicket {
            gate: self.clone(),
            message_id,
        })
    }

    pub fn in_flight(&self, message_id: &MessageId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(message_id)
    }
}

/// RAII claim on a message's reaction slot.
pub struct ReactionTicket {
    gate: ReactionGate,
    message_id: MessageId,
}

impl Drop for ReactionTicket {
    fn drop(&mut self) {
        self.gate
            .in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&self.message_id);
    }
}

/// Cooldown latch suppressing repeated panic triggers.
pub struct PanicLatch {
    cooldown: Duration,
    last_fired: Option<Instant>,
}

impl PanicLatch {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_fired: None,
        }
    }

    /// Claim a panic trigger; false while the cooldown is running.
    pub fn try_begin(&mut self) -> bool {
        if let Some(at) = self.last_fired
            && at.elapsed() < self.cooldown
        {
            return false;
        }
        self.last_fired = Some(Instant::now());
        true
    }
}

/// Trim outgoing text; whitespace-only input sends nothing.
pub fn validate_outgoing_text(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

/// Optimistic placeholder shown while an image upload runs.
pub fn image_placeholder(
    user_id: &str,
    reply_to: Option<MessageId>,
    now: DateTime<Utc>,
) -> Message {
    let temp_id = format!("temp_{}", Uuid::new_v4());
    Message {
        id: MessageId::Temp(temp_id.clone()),
        created_at: now,
        text: IMAGE_UPLOAD_PLACEHOLDER.to_owned(),
        user_id: user_id.to_owned(),
        parent_message_id: reply_to,
        image_url: None,
        temp_id: Some(temp_id),
        status: Some(MessageStatus::Sending),
    }
}

/// Unique storage object name for an uploaded image.
pub fn image_object_name(user_id: &str, content_type: &str) -> String {
    let ext = match content_type {
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "jpg",
    };
    format!("{user_id}/{}.{ext}", Uuid::new_v4())
}

/// Request body for the distress side-channel function.
pub fn panic_alert_body(user_id: &str, now: DateTime<Utc>) -> serde_json::Value {
    serde_json::json!({
        "user_id": user_id,
        "triggered_at": now.to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_admits_one_request_per_message() {
        let gate = ReactionGate::new();
        let id = MessageId::Server(1);

        let ticket = gate.try_begin(id.clone()).expect("first claim");
        assert!(gate.in_flight(&id));
        assert!(gate.try_begin(id.clone()).is_none());

        drop(ticket);
        assert!(!gate.in_flight(&id));
        assert!(gate.try_begin(id).is_some());
    }

    #[test]
    fn gate_tracks_messages_independently() {
        let gate = ReactionGate::new();
        let _a = gate.try_begin(MessageId::Server(1)).expect("claim a");
        assert!(gate.try_begin(MessageId::Server(2)).is_some());
    }

    #[test]
    fn panic_latch_enforces_the_cooldown() {
        let mut latch = PanicLatch::new(Duration::from_secs(60));
        assert!(latch.try_begin());
        assert!(!latch.try_begin());
    }

    #[test]
    fn whitespace_only_text_is_rejected() {
        assert_eq!(validate_outgoing_text("  \n\t "), None);
        assert_eq!(
            validate_outgoing_text("  hello  "),
            Some("hello".to_owned())
        );
    }

    #[test]
    fn placeholders_carry_sending_status() {
        let placeholder = image_placeholder("u1", None, Utc::now());
        assert!(placeholder.is_placeholder());
        assert_eq!(placeholder.text, IMAGE_UPLOAD_PLACEHOLDER);
        assert!(placeholder.temp_id.as_deref().is_some_and(|t| t.starts_with("temp_")));
    }

    #[test]
    fn placeholders_keep_the_reply_parent() {
        let placeholder = image_placeholder("u1", Some(MessageId::Server(4)), Utc::now());
        assert_eq!(placeholder.parent_message_id, Some(MessageId::Server(4)));
    }

    #[test]
    fn only_palette_emojis_are_supported() {
        for emoji in REACTION_EMOJIS {
            assert!(is_supported_reaction(emoji));
        }
        assert!(!is_supported_reaction("🦀"));
        assert!(!is_supported_reaction(""));
    }

    #[test]
    fn object_names_keep_the_uploader_prefix() {
        let name = image_object_name("u1", "image/png");
        assert!(name.starts_with("u1/"));
        assert!(name.ends_with(".png"));

        let fallback = image_object_name("u1", "application/octet-stream");
        assert!(fallback.ends_with(".jpg"));
    }
}
