//! Supabase adapter for the chat core.
//!
//! REST reads/writes go through PostgREST, blobs through storage, the
//! distress alert through an edge function, and live traffic through
//! the Phoenix realtime protocol.

use std::sync::Arc;

use chat_core::{
    ChangeFeed, ChatBackend, ClientError, ClientErrorCategory, Message, NewMessage, PageRange,
    PresenceFeed, ReactionRow, SubscriptionGuard, TypingFeed, TypingSignal,
};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub mod config;
pub mod realtime;
pub mod rest;

pub use config::{ConfigError, SupabaseConfig};
pub use rest::RestClient;

use realtime::{ChannelEvent, ChannelKind, Frame};

/// Backend implementation over one Supabase project.
pub struct SupabaseBackend {
    config: Arc<SupabaseConfig>,
    rest: RestClient,
    /// Outbound frame sender for the typing channel, installed on
    /// subscribe.
    typing_out: Mutex<Option<mpsc::Sender<Frame>>>,
    typing_ref: std::sync::atomic::AtomicU64,
}

impl SupabaseBackend {
    pub fn new(config: SupabaseConfig) -> Self {
        let config = Arc::new(config);
        Self {
            rest: RestClient::new(config.clone()),
            config,
            typing_out: Mutex::new(None),
            typing_ref: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn spawn_channel<T: Send + 'static>(
        &self,
        kind: ChannelKind,
        map: fn(ChannelEvent) -> Option<T>,
    ) -> (mpsc::Receiver<T>, mpsc::Sender<Frame>, SubscriptionGuard) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (typed_tx, typed_rx) = mpsc::channel::<T>(64);
        let (out_tx, out_rx) = mpsc::channel::<Frame>(16);
        let stop = CancellationToken::new();

        tokio::spawn(realtime::run_channel(
            self.config.clone(),
            kind,
            event_tx,
            out_rx,
            stop.clone(),
        ));
        tokio::spawn(async move {
            let mut event_rx = event_rx;
            while let Some(event) = event_rx.recv().await {
                if let Some(typed) = map(event)
                    && typed_tx.send(typed).await.is_err()
                {
                    break;
                }
            }
        });

        (typed_rx, out_tx, SubscriptionGuard::new(stop))
    }
}

impl ChatBackend for SupabaseBackend {
    async fn select_messages(&self, range: PageRange) -> Result<Vec<Message>, ClientError> {
        self.rest.select_messages(range).await
    }

    async fn insert_message(&self, row: NewMessage) -> Result<(), ClientError> {
        self.rest.insert_message(row).await
    }

    async fn upsert_reaction(&self, row: ReactionRow) -> Result<(), ClientError> {
        self.rest.upsert_reaction(row).await
    }

    async fn upload_blob(
        &self,
        bucket: &str,
        name: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<String, ClientError> {
        self.rest.upload_blob(bucket, name, data, content_type).await
    }

    async fn invoke_remote_function(
        &self,
        name: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, ClientError> {
        self.rest.invoke_function(name, body).await
    }

    async fn subscribe_changes(&self) -> Result<ChangeFeed, ClientError> {
        let (events, _out, guard) = self.spawn_channel(ChannelKind::Changes, |event| match event {
            ChannelEvent::Change(change) => Some(change),
            _ => None,
        });
        debug!(room_id = %self.config.room_id, "subscribed to row changes");
        Ok(ChangeFeed { events, guard })
    }

    async fn subscribe_presence(&self, presence_key: &str) -> Result<PresenceFeed, ClientError> {
        let (events, _out, guard) = self.spawn_channel(
            ChannelKind::Presence {
                key: presence_key.to_owned(),
            },
            |event| match event {
                ChannelEvent::Presence(presence) => Some(presence),
                _ => None,
            },
        );
        debug!(room_id = %self.config.room_id, "subscribed to presence");
        Ok(PresenceFeed { events, guard })
    }

    async fn subscribe_typing(&self) -> Result<TypingFeed, ClientError> {
        let (events, out, guard) = self.spawn_channel(ChannelKind::Typing, |event| match event {
            ChannelEvent::Typing(signal) => Some(signal),
            _ => None,
        });
        *self.typing_out.lock().await = Some(out);
        debug!(room_id = %self.config.room_id, "subscribed to typing broadcasts");
        Ok(TypingFeed { events, guard })
    }

    async fn send_typing(&self, signal: TypingSignal) -> Result<(), ClientError> {
        let sender = self.typing_out.lock().await.clone();
        let Some(sender) = sender else {
            return Err(ClientError::new(
                ClientErrorCategory::Internal,
                "typing_not_subscribed",
                "typing channel is not subscribed",
            ));
        };

        let msg_ref = self
            .typing_ref
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        sender
            .send(realtime::typing_frame(
                &self.config.room_id,
                &signal.user_id,
                msg_ref,
            ))
            .await
            .map_err(|_| {
                ClientError::new(
                    ClientErrorCategory::Network,
                    "typing_channel_closed",
                    "typing channel task has stopped",
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chat_core::{ChatEvent, RoomCommand, RoomTuning, spawn_room};
    use url::Url;

    use super::*;

    #[tokio::test]
    async fn send_typing_requires_a_subscription() {
        let backend = SupabaseBackend::new(SupabaseConfig::new(
            Url::parse("https://abc.supabase.co").expect("url"),
            "anon",
            "lobby",
        ));

        let err = backend
            .send_typing(TypingSignal {
                user_id: "u1".to_owned(),
            })
            .await
            .expect_err("must fail without a subscription");
        assert_eq!(err.code, "typing_not_subscribed");
    }

    /// Requires a reachable project; run with
    /// `CALCVAULT_SUPABASE_URL=... CALCVAULT_SUPABASE_ANON_KEY=... cargo test -- --ignored`.
    #[tokio::test]
    #[ignore]
    async fn live_initial_load_round_trip() {
        let config = SupabaseConfig::from_env().expect("env config");
        let backend = Arc::new(SupabaseBackend::new(config));
        let handle = spawn_room(backend, "smoke-user", RoomTuning::default());
        let mut events = handle.subscribe();

        handle.send(RoomCommand::LoadInitial).await.expect("send");
        let settled = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = events.recv().await.expect("event");
                if matches!(event, ChatEvent::Loading { active: false }) {
                    break;
                }
            }
        })
        .await;
        assert!(settled.is_ok(), "initial load did not settle in time");
    }
}
