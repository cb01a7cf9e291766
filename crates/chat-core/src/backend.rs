use std::future::Future;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    error::ClientError,
    types::{Message, NewMessage, PageRange, PresenceEvent, ReactionRow, RowChange, TypingSignal},
};

/// Handle tearing down one realtime subscription.
///
/// Unsubscribing twice is a no-op; dropping the guard does NOT cancel the
/// subscription so clones can be handed to pump tasks safely.
#[derive(Debug, Clone)]
pub struct SubscriptionGuard {
    token: CancellationToken,
}

impl SubscriptionGuard {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Stop the subscription. Idempotent.
    pub fn unsubscribe(&self) {
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

/// Row-change subscription: realtime INSERT/DELETE events plus its guard.
#[derive(Debug)]
pub struct ChangeFeed {
    pub events: mpsc::Receiver<RowChange>,
    pub guard: SubscriptionGuard,
}

/// Presence subscription: sync/join/leave events plus its guard.
#[derive(Debug)]
pub struct PresenceFeed {
    pub events: mpsc::Receiver<PresenceEvent>,
    pub guard: SubscriptionGuard,
}

/// Typing broadcast subscription (receive side) plus its guard.
///
/// Outbound typing signals go through [`ChatBackend::send_typing`].
#[derive(Debug)]
pub struct TypingFeed {
    pub events: mpsc::Receiver<TypingSignal>,
    pub guard: SubscriptionGuard,
}

/// The backend capability consumed by the room runtime.
///
/// Everything above the adapter layer is written against this trait; no
/// code outside an adapter may assume the concrete backend's shape.
pub trait ChatBackend: Send + Sync + 'static {
    /// Ranged, ordered read of message history (newest first).
    fn select_messages(
        &self,
        range: PageRange,
    ) -> impl Future<Output = Result<Vec<Message>, ClientError>> + Send;

    /// Insert a new message row.
    fn insert_message(
        &self,
        row: NewMessage,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// Idempotent reaction upsert keyed on `(message_id, user_id, emoji)`.
    fn upsert_reaction(
        &self,
        row: ReactionRow,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// Upload a blob and return its public URL.
    fn upload_blob(
        &self,
        bucket: &str,
        name: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> impl Future<Output = Result<String, ClientError>> + Send;

    /// Invoke a serverless remote function by name.
    fn invoke_remote_function(
        &self,
        name: &str,
        body: serde_json::Value,
    ) -> impl Future<Output = Result<serde_json::Value, ClientError>> + Send;

    /// Subscribe to message-row INSERT/DELETE change events.
    fn subscribe_changes(&self) -> impl Future<Output = Result<ChangeFeed, ClientError>> + Send;

    /// Subscribe to the presence channel, tracking under `presence_key`.
    fn subscribe_presence(
        &self,
        presence_key: &str,
    ) -> impl Future<Output = Result<PresenceFeed, ClientError>> + Send;

    /// Subscribe to the ephemeral typing broadcast channel.
    fn subscribe_typing(&self) -> impl Future<Output = Result<TypingFeed, ClientError>> + Send;

    /// Broadcast an own-typing signal (best-effort).
    fn send_typing(
        &self,
        signal: TypingSignal,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;
}

pub use in_memory::InMemoryBackend;

mod in_memory {
    use std::{
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, AtomicI64, Ordering},
        },
        time::Duration,
    };

    use chrono::Utc;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::{ChangeFeed, ChatBackend, PresenceFeed, SubscriptionGuard, TypingFeed};
    use crate::{
        error::{ClientError, ClientErrorCategory},
        types::{
            Message, MessageId, NewMessage, PageRange, PresenceEvent, ReactionRow, RowChange,
            TypingSignal,
        },
    };

    /// In-process backend used by runtime tests and local smoke runs.
    ///
    /// Inserted rows are echoed through the change feed the way a real
    /// realtime channel would echo a committed write. Selects can be
    /// artificially delayed to exercise fetch-vs-live interleavings.
    #[derive(Clone, Default)]
    pub struct InMemoryBackend {
        inner: Arc<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        rows: Mutex<Vec<Message>>,
        next_id: AtomicI64,
        select_delay: Mutex<Duration>,
        fail_inserts: AtomicBool,
        fail_uploads: AtomicBool,
        fail_upserts: AtomicBool,
        upserts: Mutex<Vec<ReactionRow>>,
        sent_typing: Mutex<Vec<TypingSignal>>,
        invoked: Mutex<Vec<String>>,
        change_tx: Mutex<Option<mpsc::Sender<RowChange>>>,
        presence_tx: Mutex<Option<mpsc::Sender<PresenceEvent>>>,
        typing_tx: Mutex<Option<mpsc::Sender<TypingSignal>>>,
    }

    impl InMemoryBackend {
        pub fn new() -> Self {
            Self::default()
        }

        /// Replace stored history with the given rows.
        pub fn seed_messages(&self, rows: Vec<Message>) {
            *self.inner.rows.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = rows;
        }

        /// Delay every select by `delay` to open a race window.
        pub fn set_select_delay(&self, delay: Duration) {
            *self.inner.select_delay.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = delay;
        }

        pub fn set_fail_inserts(&self, fail: bool) {
            self.inner.fail_inserts.store(fail, Ordering::SeqCst);
        }

        pub fn set_fail_uploads(&self, fail: bool) {
            self.inner.fail_uploads.store(fail, Ordering::SeqCst);
        }

        pub fn set_fail_upserts(&self, fail: bool) {
            self.inner.fail_upserts.store(fail, Ordering::SeqCst);
        }

        pub fn upsert_log(&self) -> Vec<ReactionRow> {
            self.inner.upserts.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
        }

        pub fn sent_typing(&self) -> Vec<TypingSignal> {
            self.inner.sent_typing.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
        }

        pub fn invoked_functions(&self) -> Vec<String> {
            self.inner.invoked.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
        }

        /// Push an insert through the change feed only.
        ///
        /// Stored history is left untouched so in-flight selects keep a
        /// stable view; tests control history through `seed_messages`.
        pub async fn push_insert(&self, message: Message) {
            self.push_change(RowChange::Inserted(message)).await;
        }

        /// Push a delete through the change feed.
        pub async fn push_delete(&self, id: MessageId) {
            self.inner
                .rows
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .retain(|row| row.id != id);
            self.push_change(RowChange::Deleted { id }).await;
        }

        pub async fn push_presence(&self, event: PresenceEvent) {
            let tx = self
                .inner
                .presence_tx
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone();
            if let Some(tx) = tx {
                let _ = tx.send(event).await;
            }
        }

        pub async fn push_typing(&self, signal: TypingSignal) {
            let tx = self.inner.typing_tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone();
            if let Some(tx) = tx {
                let _ = tx.send(signal).await;
            }
        }

        async fn push_change(&self, change: RowChange) {
            let tx = self.inner.change_tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone();
            if let Some(tx) = tx {
                let _ = tx.send(change).await;
            }
        }

        fn next_server_id(&self) -> i64 {
            self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1_000
        }
    }

    impl ChatBackend for InMemoryBackend {
        async fn select_messages(&self, range: PageRange) -> Result<Vec<Message>, ClientError> {
            // Snapshot at request time, as a server would; the delay only
            // postpones delivery of the response.
            let mut rows = self.inner.rows.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone();
            let delay = *self.inner.select_delay.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            if range.from >= rows.len() {
                return Ok(Vec::new());
            }
            let end = (range.to + 1).min(rows.len());
            Ok(rows[range.from..end].to_vec())
        }

        async fn insert_message(&self, row: NewMessage) -> Result<(), ClientError> {
            if self.inner.fail_inserts.load(Ordering::SeqCst) {
                return Err(ClientError::new(
                    ClientErrorCategory::Network,
                    "insert_failed",
                    "in-memory backend configured to fail inserts",
                ));
            }

            let message = Message {
                id: MessageId::Server(self.next_server_id()),
                created_at: Utc::now(),
                text: row.text,
                user_id: row.user_id,
                parent_message_id: row.parent_message_id,
                image_url: row.image_url,
                temp_id: None,
                status: None,
            };
            self.inner
                .rows
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(message.clone());
            self.push_change(RowChange::Inserted(message)).await;
            Ok(())
        }

        async fn upsert_reaction(&self, row: ReactionRow) -> Result<(), ClientError> {
            self.inner
                .upserts
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(row.clone());

            if self.inner.fail_upserts.load(Ordering::SeqCst) {
                return Err(ClientError::new(
                    ClientErrorCategory::Network,
                    "upsert_failed",
                    "in-memory backend configured to fail upserts",
                ));
            }
            Ok(())
        }

        async fn upload_blob(
            &self,
            bucket: &str,
            name: &str,
            _data: Vec<u8>,
            _content_type: &str,
        ) -> Result<String, ClientError> {
            if self.inner.fail_uploads.load(Ordering::SeqCst) {
                return Err(ClientError::new(
                    ClientErrorCategory::Storage,
                    "upload_failed",
                    "in-memory backend configured to fail uploads",
                ));
            }
            Ok(format!("memory://{bucket}/{name}"))
        }

        async fn invoke_remote_function(
            &self,
            name: &str,
            _body: serde_json::Value,
        ) -> Result<serde_json::Value, ClientError> {
            self.inner
                .invoked
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(name.to_owned());
            Ok(serde_json::json!({ "ok": true }))
        }

        async fn subscribe_changes(&self) -> Result<ChangeFeed, ClientError> {
            let (tx, rx) = mpsc::channel(64);
            *self.inner.change_tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(tx);
            Ok(ChangeFeed {
                events: rx,
                guard: SubscriptionGuard::new(CancellationToken::new()),
            })
        }

        async fn subscribe_presence(&self, _presence_key: &str) -> Result<PresenceFeed, ClientError> {
            let (tx, rx) = mpsc::channel(64);
            *self.inner.presence_tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(tx);
            Ok(PresenceFeed {
                events: rx,
                guard: SubscriptionGuard::new(CancellationToken::new()),
            })
        }

        async fn subscribe_typing(&self) -> Result<TypingFeed, ClientError> {
            let (tx, rx) = mpsc::channel(64);
            *self.inner.typing_tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(tx);
            Ok(TypingFeed {
                events: rx,
                guard: SubscriptionGuard::new(CancellationToken::new()),
            })
        }

        async fn send_typing(&self, signal: TypingSignal) -> Result<(), ClientError> {
            self.inner
                .sent_typing
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(signal);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::types::{MessageId, MessageStatus};

    fn row(id: i64, minute: u32) -> Message {
        Message {
            id: MessageId::Server(id),
            created_at: Utc.with_ymd_and_hms(2024, 6, 1, 12, minute, 0).unwrap(),
            text: format!("m{id}"),
            user_id: "u1".to_owned(),
            parent_message_id: None,
            image_url: None,
            temp_id: None,
            status: None,
        }
    }

    #[test]
    fn guard_tolerates_double_unsubscribe() {
        let guard = SubscriptionGuard::new(tokio_util::sync::CancellationToken::new());
        assert!(guard.is_active());
        guard.unsubscribe();
        guard.unsubscribe();
        assert!(!guard.is_active());
    }

    #[tokio::test]
    async fn in_memory_select_returns_ranged_descending_pages() {
        let backend = InMemoryBackend::new();
        backend.seed_messages(vec![row(1, 1), row(2, 2), row(3, 3)]);

        let first = backend
            .select_messages(PageRange { from: 0, to: 1 })
            .await
            .expect("select");
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id, MessageId::Server(3));
        assert_eq!(first[1].id, MessageId::Server(2));

        let rest = backend
            .select_messages(PageRange { from: 2, to: 3 })
            .await
            .expect("select");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, MessageId::Server(1));

        let past_end = backend
            .select_messages(PageRange { from: 10, to: 11 })
            .await
            .expect("select");
        assert!(past_end.is_empty());
    }

    #[tokio::test]
    async fn insert_echoes_through_change_feed() {
        let backend = InMemoryBackend::new();
        let mut feed = backend.subscribe_changes().await.expect("subscribe");

        backend
            .insert_message(NewMessage {
                text: "hello".to_owned(),
                user_id: "u1".to_owned(),
                parent_message_id: None,
                image_url: None,
            })
            .await
            .expect("insert");

        let change = tokio::time::timeout(Duration::from_secs(1), feed.events.recv())
            .await
            .expect("change timeout")
            .expect("change");
        match change {
            RowChange::Inserted(message) => {
                assert_eq!(message.text, "hello");
                assert_eq!(message.status, None::<MessageStatus>);
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }
}
