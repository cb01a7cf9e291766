use chrono::{DateTime, Utc};

use crate::types::{Message, MessageId, PageRange};

/// Placeholder body shown while an image upload is in flight.
pub const IMAGE_UPLOAD_PLACEHOLDER: &str = "Uploading image...";

/// How far apart an optimistic placeholder and its realtime echo may be
/// and still be treated as the same send.
const TEMP_MATCH_WINDOW_MS: i64 = 30_000;

/// Paged conversation state with live-insert reconciliation.
///
/// Messages are kept newest first. While an older-page fetch is in
/// flight, realtime inserts are parked in a pending buffer instead of
/// being spliced into the list, so the fetch result cannot shift them
/// out of position; the buffer is flushed when the fetch settles.
#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    messages: Vec<Message>,
    pending_new: Vec<Message>,
    is_loading: bool,
    is_fetching_more: bool,
    current_page: u32,
    page_size: usize,
    generation: u64,
    reply_target: Option<Message>,
}

impl ConversationStore {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            is_loading: true,
            ..Self::default()
        }
    }

    /// Render-ready snapshot, newest first.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn is_fetching_more(&self) -> bool {
        self.is_fetching_more
    }

    pub fn reply_target(&self) -> Option<&Message> {
        self.reply_target.as_ref()
    }

    /// Conversation epoch, bumped by wholesale replacement and reset.
    ///
    /// A read spawned under an older generation must be discarded on
    /// completion instead of applied; it belongs to a conversation that
    /// no longer exists.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Range for the next older page to request.
    pub fn next_page_range(&self) -> PageRange {
        PageRange::for_page(self.current_page, self.page_size)
    }

    /// Install the newest page, replacing any prior conversation.
    pub fn replace_with_initial_page(&mut self, page: Vec<Message>) {
        self.messages = page;
        self.pending_new.clear();
        self.current_page = 1;
        self.is_loading = false;
        self.is_fetching_more = false;
        self.generation += 1;
    }

    /// Mark an older-page fetch as in flight.
    ///
    /// Returns false when one is already running; the caller must not
    /// start a second select.
    pub fn begin_fetch_older(&mut self) -> bool {
        if self.is_fetching_more {
            return false;
        }
        self.is_fetching_more = true;
        true
    }

    /// Append a fetched older page and flush inserts parked meanwhile.
    pub fn complete_fetch_older(&mut self, page: Vec<Message>) {
        if !page.is_empty() {
            self.current_page += 1;
        }
        self.messages.extend(page);
        self.is_fetching_more = false;
        self.flush_pending();
    }

    /// Clear the in-flight flag after a failed fetch and flush parked
    /// inserts so they are not lost.
    pub fn abort_fetch_older(&mut self) {
        self.is_fetching_more = false;
        self.flush_pending();
    }

    /// Apply one realtime insert.
    ///
    /// A matching optimistic placeholder is replaced in place. Otherwise
    /// the row goes to the front of the list, or into the pending buffer
    /// while an older-page fetch is running.
    pub fn observe_insert(&mut self, message: Message) {
        if self.reconcile_placeholder(&message) {
            return;
        }
        if self.is_fetching_more {
            self.pending_new.push(message);
        } else {
            self.messages.insert(0, message);
        }
    }

    /// Remove a deleted row and every reply that pointed at it.
    ///
    /// Returns true when anything was removed.
    pub fn observe_delete(&mut self, id: &MessageId) -> bool {
        let keep = |row: &Message| row.id != *id && row.parent_message_id.as_ref() != Some(id);

        let before = self.messages.len() + self.pending_new.len();
        self.messages.retain(keep);
        self.pending_new.retain(keep);
        let removed = before != self.messages.len() + self.pending_new.len();

        if let Some(target) = &self.reply_target
            && !keep(target)
        {
            self.reply_target = None;
        }
        removed
    }

    /// Add an optimistic local entry at the front.
    pub fn add_optimistic(&mut self, placeholder: Message) {
        self.messages.insert(0, placeholder);
    }

    /// Remove an optimistic entry after a failed send.
    pub fn remove_temp(&mut self, temp_id: &str) {
        let keep = |row: &Message| row.temp_id.as_deref() != Some(temp_id);
        self.messages.retain(keep);
        self.pending_new.retain(keep);
    }

    pub fn set_reply_target(&mut self, target: Message) {
        self.reply_target = Some(target);
    }

    pub fn clear_reply_target(&mut self) {
        self.reply_target = None;
    }

    /// Find a message by ID across the live list and pending buffer.
    pub fn find(&self, id: &MessageId) -> Option<&Message> {
        self.messages
            .iter()
            .chain(self.pending_new.iter())
            .find(|row| row.id == *id)
    }

    /// Drop everything, including pagination and reply state.
    pub fn reset(&mut self) {
        *self = Self {
            page_size: self.page_size,
            generation: self.generation + 1,
            ..Self::default()
        };
    }

    /// Prepend parked inserts, preserving their arrival order.
    ///
    /// Idempotent: the buffer is drained, so a second call is a no-op.
    fn flush_pending(&mut self) {
        if self.pending_new.is_empty() {
            return;
        }
        let mut merged = std::mem::take(&mut self.pending_new);
        merged.append(&mut self.messages);
        self.messages = merged;
    }

    /// Replace a matching optimistic placeholder with its confirmed row.
    fn reconcile_placeholder(&mut self, incoming: &Message) -> bool {
        if incoming.temp_id.is_some() {
            return false;
        }
        let position = self
            .messages
            .iter()
            .position(|row| placeholder_matches(row, incoming));
        if let Some(position) = position {
            self.messages[position] = incoming.clone();
            return true;
        }
        false
    }
}

fn placeholder_matches(placeholder: &Message, incoming: &Message) -> bool {
    if !placeholder.is_placeholder() || placeholder.user_id != incoming.user_id {
        return false;
    }
    if !within_window(placeholder.created_at, incoming.created_at) {
        return false;
    }
    if incoming.image_url.is_some() {
        return placeholder.text == IMAGE_UPLOAD_PLACEHOLDER || placeholder.image_url.is_some();
    }
    placeholder.text.trim() == incoming.text.trim()
}

fn within_window(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (b - a).num_milliseconds().abs() <= TEMP_MATCH_WINDOW_MS
}
