//! Supabase realtime channels over the Phoenix websocket protocol.
//!
//! One websocket per channel. Each channel task joins its topic, keeps
//! the socket alive with heartbeats, decodes inbound frames into typed
//! events, and reconnects with backoff until its stop token fires.

use std::{sync::Arc, time::Duration};

use chat_core::{Message, PresenceEvent, RetryPolicy, RowChange, TypingSignal};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// One Phoenix protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    pub payload: Value,
    #[serde(rename = "ref")]
    pub msg_ref: Option<String>,
}

/// Which channel a task serves.
#[derive(Debug, Clone)]
pub enum ChannelKind {
    /// Postgres row changes for the room's messages.
    Changes,
    /// Presence channel, tracking under the given key.
    Presence { key: String },
    /// Ephemeral typing broadcasts.
    Typing,
}

/// Typed event decoded from an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Change(RowChange),
    Presence(PresenceEvent),
    Typing(TypingSignal),
}

impl ChannelKind {
    fn topic(&self, room_id: &str) -> String {
        match self {
            ChannelKind::Changes => format!("realtime:chat_room:{room_id}"),
            ChannelKind::Presence { .. } => format!("realtime:presence:{room_id}"),
            ChannelKind::Typing => format!("realtime:typing:{room_id}"),
        }
    }

    fn join_payload(&self, room_id: &str) -> Value {
        match self {
            ChannelKind::Changes => json!({
                "config": {
                    "postgres_changes": [{
                        "event": "*",
                        "schema": "public",
                        "table": "messages",
                        "filter": format!("chat_room_id=eq.{room_id}"),
                    }],
                },
            }),
            ChannelKind::Presence { key } => json!({
                "config": { "presence": { "key": key } },
            }),
            ChannelKind::Typing => json!({
                "config": { "broadcast": { "self": false } },
            }),
        }
    }
}

pub fn join_frame(kind: &ChannelKind, room_id: &str, msg_ref: u64) -> Frame {
    Frame {
        topic: kind.topic(room_id),
        event: "phx_join".to_owned(),
        payload: kind.join_payload(room_id),
        msg_ref: Some(msg_ref.to_string()),
    }
}

pub fn heartbeat_frame(msg_ref: u64) -> Frame {
    Frame {
        topic: "phoenix".to_owned(),
        event: "heartbeat".to_owned(),
        payload: json!({}),
        msg_ref: Some(msg_ref.to_string()),
    }
}

/// Presence track announcement, sent after the presence join settles.
pub fn track_frame(room_id: &str, user_id: &str, msg_ref: u64) -> Frame {
    Frame {
        topic: ChannelKind::Presence {
            key: user_id.to_owned(),
        }
        .topic(room_id),
        event: "presence".to_owned(),
        payload: json!({
            "type": "presence",
            "event": "track",
            "payload": { "user_id": user_id },
        }),
        msg_ref: Some(msg_ref.to_string()),
    }
}

/// Outbound typing broadcast frame.
pub fn typing_frame(room_id: &str, user_id: &str, msg_ref: u64) -> Frame {
    Frame {
        topic: ChannelKind::Typing.topic(room_id),
        event: "broadcast".to_owned(),
        payload: json!({
            "type": "broadcast",
            "event": "typing",
            "payload": { "user_id": user_id },
        }),
        msg_ref: Some(msg_ref.to_string()),
    }
}

pub fn decode_frame(raw: &str) -> Option<Frame> {
    serde_json::from_str(raw).ok()
}

/// Decode a `postgres_changes` payload into a row change.
///
/// Updates are ignored; the product only inserts and deletes messages.
pub fn row_change_from_payload(payload: &Value) -> Option<RowChange> {
    let data = payload.get("data")?;
    match data.get("type")?.as_str()? {
        "INSERT" => {
            let record = data.get("record")?;
            let message: Message = serde_json::from_value(record.clone()).ok()?;
            Some(RowChange::Inserted(message))
        }
        "DELETE" => {
            let id = data.get("old_record")?.get("id")?;
            Some(RowChange::Deleted {
                id: serde_json::from_value(id.clone()).ok()?,
            })
        }
        _ => None,
    }
}

/// Presence keys currently tracked, from a `presence_state` payload.
pub fn presence_state_users(payload: &Value) -> Vec<String> {
    payload
        .as_object()
        .map(|state| state.keys().cloned().collect())
        .unwrap_or_default()
}

/// Join/leave events from a `presence_diff` payload.
pub fn presence_diff_events(payload: &Value) -> Vec<PresenceEvent> {
    let keys = |section: &str| -> Vec<String> {
        payload
            .get(section)
            .and_then(Value::as_object)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    };

    let mut events = Vec::new();
    let joins = keys("joins");
    if !joins.is_empty() {
        events.push(PresenceEvent::Joined { user_ids: joins });
    }
    let leaves = keys("leaves");
    if !leaves.is_empty() {
        events.push(PresenceEvent::Left { user_ids: leaves });
    }
    events
}

/// Typing signal from a broadcast payload, if it carries one.
pub fn typing_from_payload(payload: &Value) -> Option<TypingSignal> {
    if payload.get("event")?.as_str()? != "typing" {
        return None;
    }
    let user_id = payload.get("payload")?.get("user_id")?.as_str()?;
    Some(TypingSignal {
        user_id: user_id.to_owned(),
    })
}

fn decode_channel_event(kind: &ChannelKind, frame: &Frame) -> Vec<ChannelEvent> {
    match (kind, frame.event.as_str()) {
        (ChannelKind::Changes, "postgres_changes") => row_change_from_payload(&frame.payload)
            .map(ChannelEvent::Change)
            .into_iter()
            .collect(),
        (ChannelKind::Presence { .. }, "presence_state") => {
            vec![ChannelEvent::Presence(PresenceEvent::Synced {
                user_ids: presence_state_users(&frame.payload),
            })]
        }
        (ChannelKind::Presence { .. }, "presence_diff") => {
            presence_diff_events(&frame.payload)
                .into_iter()
                .map(ChannelEvent::Presence)
                .collect()
        }
        (ChannelKind::Typing, "broadcast") => typing_from_payload(&frame.payload)
            .map(ChannelEvent::Typing)
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}

/// Drive one channel until the stop token fires.
///
/// `outgoing` carries caller-built frames (typing broadcasts); other
/// channels simply never send on it.
pub async fn run_channel(
    config: Arc<crate::config::SupabaseConfig>,
    kind: ChannelKind,
    events: mpsc::Sender<ChannelEvent>,
    mut outgoing: mpsc::Receiver<Frame>,
    stop: CancellationToken,
) {
    let retry = RetryPolicy::default();
    let mut attempt: u32 = 0;
    let topic = kind.topic(&config.room_id);

    loop {
        if stop.is_cancelled() {
            break;
        }

        match connect_and_serve(&config, &kind, &events, &mut outgoing, &stop).await {
            Ok(()) => break,
            Err(err) => {
                if stop.is_cancelled() {
                    break;
                }
                let delay = retry.delay_for_attempt(attempt, None);
                warn!(%topic, attempt, "realtime channel dropped ({err}), reconnecting in {delay:?}");
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    debug!(%topic, "realtime channel stopped");
}

async fn connect_and_serve(
    config: &crate::config::SupabaseConfig,
    kind: &ChannelKind,
    events: &mpsc::Sender<ChannelEvent>,
    outgoing: &mut mpsc::Receiver<Frame>,
    stop: &CancellationToken,
) -> Result<(), tungstenite::Error> {
    let (ws, _) = connect_async(config.realtime_ws_url()).await?;
    let (mut sink, mut stream) = ws.split();
    let mut msg_ref: u64 = 0;
    let mut next_ref = || {
        msg_ref += 1;
        msg_ref
    };

    send_frame(&mut sink, &join_frame(kind, &config.room_id, next_ref())).await?;
    if let ChannelKind::Presence { key } = kind {
        send_frame(&mut sink, &track_frame(&config.room_id, key, next_ref())).await?;
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await;

    // Channels that never send outbound frames drop their sender; the
    // closed receiver must not keep this arm permanently ready.
    let mut outgoing_open = true;

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                let _ = sink.send(tungstenite::Message::Close(None)).await;
                return Ok(());
            }
            _ = heartbeat.tick() => {
                send_frame(&mut sink, &heartbeat_frame(next_ref())).await?;
            }
            frame = outgoing.recv(), if outgoing_open => {
                match frame {
                    Some(frame) => send_frame(&mut sink, &frame).await?,
                    None => outgoing_open = false,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(tungstenite::Message::Text(raw))) => {
                        let Some(frame) = decode_frame(&raw) else { continue };
                        for event in decode_channel_event(kind, &frame) {
                            if events.send(event).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Some(Ok(tungstenite::Message::Ping(data))) => {
                        sink.send(tungstenite::Message::Pong(data)).await?;
                    }
                    Some(Ok(tungstenite::Message::Close(_))) | None => {
                        return Err(tungstenite::Error::ConnectionClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err),
                }
            }
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), tungstenite::Error>
where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    let raw = serde_json::to_string(frame).map_err(|err| {
        tungstenite::Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    })?;
    sink.send(tungstenite::Message::Text(raw.into())).await
}

#[cfg(test)]
mod tests {
    use chat_core::MessageId;

    use super::*;

    #[test]
    fn decodes_an_insert_change() {
        let payload = json!({
            "data": {
                "type": "INSERT",
                "record": {
                    "id": 42,
                    "created_at": "2024-06-01T12:00:00Z",
                    "text": "hello",
                    "user_id": "u1",
                },
            },
            "ids": [1],
        });

        let change = row_change_from_payload(&payload).expect("insert should decode");
        match change {
            RowChange::Inserted(message) => {
                assert_eq!(message.id, MessageId::Server(42));
                assert_eq!(message.text, "hello");
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn decodes_a_delete_change() {
        let payload = json!({
            "data": {
                "type": "DELETE",
                "old_record": { "id": 7 },
            },
        });

        assert_eq!(
            row_change_from_payload(&payload),
            Some(RowChange::Deleted {
                id: MessageId::Server(7)
            })
        );
    }

    #[test]
    fn updates_are_ignored() {
        let payload = json!({
            "data": { "type": "UPDATE", "record": {} },
        });
        assert_eq!(row_change_from_payload(&payload), None);
    }

    #[test]
    fn presence_state_yields_all_tracked_keys() {
        let payload = json!({
            "alice": { "metas": [{}] },
            "bob": { "metas": [{}] },
        });
        let mut users = presence_state_users(&payload);
        users.sort();
        assert_eq!(users, vec!["alice".to_owned(), "bob".to_owned()]);
    }

    #[test]
    fn presence_diff_splits_joins_and_leaves() {
        let payload = json!({
            "joins": { "carol": { "metas": [{}] } },
            "leaves": { "bob": { "metas": [{}] } },
        });

        let events = presence_diff_events(&payload);
        assert_eq!(
            events,
            vec![
                PresenceEvent::Joined {
                    user_ids: vec!["carol".to_owned()]
                },
                PresenceEvent::Left {
                    user_ids: vec!["bob".to_owned()]
                },
            ]
        );
    }

    #[test]
    fn typing_broadcasts_decode_only_typing_events() {
        let typing = json!({
            "event": "typing",
            "payload": { "user_id": "dave" },
        });
        assert_eq!(
            typing_from_payload(&typing),
            Some(TypingSignal {
                user_id: "dave".to_owned()
            })
        );

        let other = json!({ "event": "reaction", "payload": {} });
        assert_eq!(typing_from_payload(&other), None);
    }

    #[test]
    fn frames_round_trip_with_the_ref_field() {
        let frame = heartbeat_frame(3);
        let raw = serde_json::to_string(&frame).expect("encode");
        assert!(raw.contains("\"ref\":\"3\""));
        assert_eq!(decode_frame(&raw), Some(frame));
    }

    #[test]
    fn join_frames_carry_the_room_filter() {
        let frame = join_frame(&ChannelKind::Changes, "lobby", 1);
        assert_eq!(frame.topic, "realtime:chat_room:lobby");
        let filter = frame.payload["config"]["postgres_changes"][0]["filter"]
            .as_str()
            .expect("filter");
        assert_eq!(filter, "chat_room_id=eq.lobby");
    }

    #[tokio::test]
    async fn channel_outlives_a_dropped_outgoing_sender() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(socket)
                .await
                .expect("handshake");

            // Wait for the join, then push one row change.
            loop {
                let msg = ws.next().await.expect("inbound frame").expect("frame ok");
                if let tungstenite::Message::Text(raw) = msg
                    && raw.contains("phx_join")
                {
                    break;
                }
            }
            let change = json!({
                "topic": "realtime:chat_room:lobby",
                "event": "postgres_changes",
                "payload": { "data": { "type": "DELETE", "old_record": { "id": 7 } } },
                "ref": null,
            });
            ws.send(tungstenite::Message::Text(change.to_string().into()))
                .await
                .expect("push change");

            // Hold the socket open until the client hangs up.
            while ws.next().await.is_some() {}
        });

        let config = Arc::new(
            crate::config::SupabaseConfig::from_lookup(|key| match key {
                "CALCVAULT_SUPABASE_URL" => Some(format!("http://{addr}")),
                "CALCVAULT_SUPABASE_ANON_KEY" => Some("anon".to_owned()),
                _ => None,
            })
            .expect("config"),
        );

        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (out_tx, out_rx) = mpsc::channel(8);
        let stop = CancellationToken::new();
        let task = tokio::spawn(run_channel(
            config,
            ChannelKind::Changes,
            event_tx,
            out_rx,
            stop.clone(),
        ));

        // This channel never sends outbound frames.
        drop(out_tx);

        let event = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
            .await
            .expect("event timeout")
            .expect("event");
        assert_eq!(
            event,
            ChannelEvent::Change(RowChange::Deleted {
                id: MessageId::Server(7)
            })
        );

        stop.cancel();
        let _ = task.await;
        let _ = server.await;
    }
}
