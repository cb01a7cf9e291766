use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    backend::{ChatBackend, SubscriptionGuard},
    conversation::ConversationStore,
    dispatcher::{
        IMAGE_BUCKET, PanicLatch, ReactionGate, SENT_IMAGE_TEXT, image_object_name,
        image_placeholder, is_supported_reaction, panic_alert_body, validate_outgoing_text,
    },
    error::ClientError,
    gesture::{GestureArbiter, PanRelease, PanUpdate},
    presence::{OnlineRoster, TypingTracker},
    types::{
        ChatEvent, Message, NewMessage, PresenceEvent, ReactionRow, RoomCommand, RoomTuning,
        RowChange, TypingSignal,
    },
};

/// Function name invoked on the distress side channel.
pub const PANIC_ALERT_FUNCTION: &str = "panic-alert";

const COMMAND_BUFFER: usize = 128;
const EVENT_BUFFER: usize = 512;

/// Broadcast event stream type used by UI subscribers.
pub type EventStream = broadcast::Receiver<ChatEvent>;

/// The runtime's command loop has exited and no longer accepts commands.
#[derive(Debug, Error)]
#[error("room runtime is no longer running")]
pub struct RoomClosed;

/// Handle to a spawned room runtime.
#[derive(Clone)]
pub struct RoomHandle {
    command_tx: mpsc::Sender<RoomCommand>,
    event_tx: broadcast::Sender<ChatEvent>,
}

impl RoomHandle {
    pub async fn send(&self, command: RoomCommand) -> Result<(), RoomClosed> {
        self.command_tx.send(command).await.map_err(|_| RoomClosed)
    }

    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }
}

/// Spawn a room runtime over the given backend.
pub fn spawn_room<B: ChatBackend>(
    backend: Arc<B>,
    user_id: impl Into<String>,
    tuning: RoomTuning,
) -> RoomHandle {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
    let (runtime, internal_rx) =
        RoomRuntime::new(backend, user_id.into(), tuning, event_tx.clone());
    tokio::spawn(async move {
        runtime.run(command_rx, internal_rx).await;
    });

    RoomHandle {
        command_tx,
        event_tx,
    }
}

/// Completion notices fed back into the command loop by spawned I/O.
#[derive(Debug)]
enum StoreUpdate {
    Change(RowChange),
    Presence(PresenceEvent),
    TypingSeen(TypingSignal),
    InitialLoaded {
        generation: u64,
        result: Result<Vec<Message>, ClientError>,
    },
    OlderLoaded {
        generation: u64,
        result: Result<Vec<Message>, ClientError>,
    },
    TextSendFinished(Result<(), ClientError>),
    ImageSendFinished {
        temp_id: String,
        result: Result<(), ClientError>,
    },
}

/// Single-owner room state machine.
///
/// All mutable state lives here; network I/O runs in spawned tasks that
/// report back through the internal update channel, so state changes
/// interleave only at command/update granularity.
struct RoomRuntime<B: ChatBackend> {
    backend: Arc<B>,
    user_id: String,
    tuning: RoomTuning,
    events: broadcast::Sender<ChatEvent>,
    internal_tx: mpsc::Sender<StoreUpdate>,
    store: ConversationStore,
    typing: TypingTracker,
    roster: OnlineRoster,
    gestures: GestureArbiter,
    reactions: ReactionGate,
    panic: PanicLatch,
    last_typing_sent: Option<Instant>,
    started_at: Instant,
    stop: CancellationToken,
    guards: Vec<SubscriptionGuard>,
    pumps: Vec<JoinHandle<()>>,
}

impl<B: ChatBackend> RoomRuntime<B> {
    fn new(
        backend: Arc<B>,
        user_id: String,
        tuning: RoomTuning,
        events: broadcast::Sender<ChatEvent>,
    ) -> (Self, mpsc::Receiver<StoreUpdate>) {
        let (internal_tx, internal_rx) = mpsc::channel(256);
        let typing = TypingTracker::new(
            Duration::from_millis(tuning.typing_ttl_ms),
            events.clone(),
        );
        let roster = OnlineRoster::new(events.clone());
        let store = ConversationStore::new(tuning.page_size);
        let panic = PanicLatch::new(Duration::from_millis(tuning.panic_cooldown_ms));

        let runtime = Self {
            backend,
            user_id,
            tuning,
            events,
            internal_tx,
            store,
            typing,
            roster,
            gestures: GestureArbiter::new(),
            reactions: ReactionGate::new(),
            panic,
            last_typing_sent: None,
            started_at: Instant::now(),
            stop: CancellationToken::new(),
            guards: Vec::new(),
            pumps: Vec::new(),
        };
        (runtime, internal_rx)
    }

    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<RoomCommand>,
        mut internal_rx: mpsc::Receiver<StoreUpdate>,
    ) {
        if let Err(err) = self.subscribe_feeds().await {
            warn!(code = %err.code, "realtime subscription failed: {err}");
            self.emit(ChatEvent::ReadFailed { error: err });
        }

        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(RoomCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                update = internal_rx.recv() => {
                    // Runtime holds a sender, so this arm never yields None
                    // before the loop breaks.
                    if let Some(update) = update {
                        self.apply_update(update);
                    }
                }
            }
        }

        self.teardown().await;
    }

    async fn subscribe_feeds(&mut self) -> Result<(), ClientError> {
        let changes = self.backend.subscribe_changes().await?;
        let presence = self.backend.subscribe_presence(&self.user_id).await?;
        let typing = self.backend.subscribe_typing().await?;

        self.guards.push(changes.guard);
        self.guards.push(presence.guard);
        self.guards.push(typing.guard);

        self.pumps.push(pump(
            changes.events,
            self.internal_tx.clone(),
            self.stop.clone(),
            StoreUpdate::Change,
        ));
        self.pumps.push(pump(
            presence.events,
            self.internal_tx.clone(),
            self.stop.clone(),
            StoreUpdate::Presence,
        ));
        self.pumps.push(pump(
            typing.events,
            self.internal_tx.clone(),
            self.stop.clone(),
            StoreUpdate::TypingSeen,
        ));
        Ok(())
    }

    async fn teardown(mut self) {
        for guard in &self.guards {
            guard.unsubscribe();
        }
        self.stop.cancel();
        self.typing.drain();
        for pump in self.pumps.drain(..) {
            let _ = pump.await;
        }
        debug!("room runtime stopped");
    }

    async fn handle_command(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::LoadInitial => self.handle_load_initial(),
            RoomCommand::FetchOlder => self.handle_fetch_older(),
            RoomCommand::SendText { body } => self.handle_send_text(body),
            RoomCommand::SendImage { data, content_type } => {
                self.handle_send_image(data, content_type);
            }
            RoomCommand::React { message_id, emoji } => self.handle_react(message_id, emoji),
            RoomCommand::SetReplyTarget { message_id } => {
                if let Some(target) = self.store.find(&message_id).cloned() {
                    self.store.set_reply_target(target.clone());
                    self.emit(ChatEvent::ReplyTargetChanged {
                        target: Some(Box::new(target)),
                    });
                }
            }
            RoomCommand::ClearReplyTarget => {
                self.store.clear_reply_target();
                self.emit(ChatEvent::ReplyTargetChanged { target: None });
            }
            RoomCommand::ComposerChanged => self.handle_composer_changed(),
            RoomCommand::PanStart { message_id } => {
                let now = self.now_ms();
                self.gestures.on_pan_start(message_id, now);
            }
            RoomCommand::PanMove { dx, dy } => match self.gestures.on_pan_move(dx, dy) {
                PanUpdate::Ignored => {}
                // An empty offset list puts every bubble back at rest.
                PanUpdate::Cancelled => self.emit_offsets_reset(),
                PanUpdate::Offset(offset) => self.emit(ChatEvent::SwipeOffsetsChanged {
                    offsets: vec![offset],
                }),
            },
            RoomCommand::PanEnd { dx } => match self.gestures.on_pan_end(dx) {
                PanRelease::Ignored => {}
                PanRelease::Reset { .. } => self.emit_offsets_reset(),
                PanRelease::ReplyTriggered { message_id } => {
                    self.emit_offsets_reset();
                    if let Some(target) = self.store.find(&message_id).cloned() {
                        self.store.set_reply_target(target.clone());
                        self.emit(ChatEvent::ReplyTargetChanged {
                            target: Some(Box::new(target)),
                        });
                    }
                }
            },
            RoomCommand::PanCancel => {
                if !matches!(self.gestures.on_pan_cancel(), PanRelease::Ignored) {
                    self.emit_offsets_reset();
                }
            }
            RoomCommand::LongPress { message_id } => {
                let now = self.now_ms();
                if self.gestures.on_long_press(message_id.clone(), now) {
                    self.emit(ChatEvent::ReactionPromptOpened { message_id });
                }
            }
            RoomCommand::ReactionPromptClosed => self.gestures.clear_long_press(),
            RoomCommand::Panic => self.handle_panic(),
            // Consumed by the run loop.
            RoomCommand::Shutdown => {}
        }
    }

    fn handle_load_initial(&mut self) {
        self.emit(ChatEvent::Loading { active: true });

        let backend = self.backend.clone();
        let range = crate::types::PageRange::for_page(0, self.tuning.page_size);
        let generation = self.store.generation();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = backend.select_messages(range).await;
            let _ = tx
                .send(StoreUpdate::InitialLoaded { generation, result })
                .await;
        });
    }

    fn handle_fetch_older(&mut self) {
        if !self.store.begin_fetch_older() {
            return;
        }
        self.emit(ChatEvent::FetchingOlder { active: true });

        let backend = self.backend.clone();
        let range = self.store.next_page_range();
        let generation = self.store.generation();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = backend.select_messages(range).await;
            let _ = tx
                .send(StoreUpdate::OlderLoaded { generation, result })
                .await;
        });
    }

    fn handle_send_text(&mut self, body: String) {
        let Some(text) = validate_outgoing_text(&body) else {
            return;
        };

        let row = NewMessage {
            text,
            user_id: self.user_id.clone(),
            parent_message_id: self.store.reply_target().map(|target| target.id.clone()),
            image_url: None,
        };

        let backend = self.backend.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = backend.insert_message(row).await;
            let _ = tx.send(StoreUpdate::TextSendFinished(result)).await;
        });
    }

    fn handle_send_image(&mut self, data: Vec<u8>, content_type: String) {
        let reply_to = self.store.reply_target().map(|target| target.id.clone());
        let placeholder = image_placeholder(&self.user_id, reply_to.clone(), Utc::now());
        let temp_id = placeholder
            .temp_id
            .clone()
            .unwrap_or_else(|| placeholder.id.to_string());
        self.store.add_optimistic(placeholder);
        self.emit_conversation();

        let backend = self.backend.clone();
        let tx = self.internal_tx.clone();
        let user_id = self.user_id.clone();
        let object_name = image_object_name(&self.user_id, &content_type);
        tokio::spawn(async move {
            let result = async {
                let url = backend
                    .upload_blob(IMAGE_BUCKET, &object_name, data, &content_type)
                    .await?;
                backend
                    .insert_message(NewMessage {
                        text: SENT_IMAGE_TEXT.to_owned(),
                        user_id,
                        parent_message_id: reply_to,
                        image_url: Some(url),
                    })
                    .await
            }
            .await;
            let _ = tx
                .send(StoreUpdate::ImageSendFinished { temp_id, result })
                .await;
        });
    }

    fn handle_react(&mut self, message_id: crate::types::MessageId, emoji: String) {
        if !is_supported_reaction(&emoji) {
            debug!(%emoji, "reaction outside the palette, dropping");
            return;
        }
        let Some(ticket) = self.reactions.try_begin(message_id.clone()) else {
            debug!(message_id = %message_id, "reaction already in flight, dropping");
            return;
        };

        let row = ReactionRow {
            message_id,
            user_id: self.user_id.clone(),
            emoji,
        };
        let backend = self.backend.clone();
        tokio::spawn(async move {
            // Reaction failures are silent by product decision; the gate
            // reopens when the ticket drops.
            if let Err(err) = backend.upsert_reaction(row).await {
                warn!(code = %err.code, "reaction upsert failed: {err}");
            }
            drop(ticket);
        });
    }

    fn handle_composer_changed(&mut self) {
        let throttle = Duration::from_millis(self.tuning.typing_rebroadcast_ms);
        if let Some(last) = self.last_typing_sent
            && last.elapsed() < throttle
        {
            return;
        }
        self.last_typing_sent = Some(Instant::now());

        let backend = self.backend.clone();
        let signal = TypingSignal {
            user_id: self.user_id.clone(),
        };
        tokio::spawn(async move {
            if let Err(err) = backend.send_typing(signal).await {
                warn!(code = %err.code, "typing broadcast failed: {err}");
            }
        });
    }

    fn handle_panic(&mut self) {
        if !self.panic.try_begin() {
            return;
        }

        self.store.reset();
        self.typing.drain();
        self.gestures.reset();

        self.emit_conversation();
        self.emit(ChatEvent::TypingChanged {
            user_ids: Vec::new(),
        });
        self.emit(ChatEvent::ReplyTargetChanged { target: None });
        self.emit_offsets_reset();
        self.emit(ChatEvent::PanicCompleted);

        // The local wipe never waits on the network; the alert is
        // best-effort and its failure is invisible to the user.
        let backend = self.backend.clone();
        let body = panic_alert_body(&self.user_id, Utc::now());
        tokio::spawn(async move {
            if let Err(err) = backend.invoke_remote_function(PANIC_ALERT_FUNCTION, body).await {
                warn!(code = %err.code, "panic alert failed: {err}");
            }
        });
    }

    fn apply_update(&mut self, update: StoreUpdate) {
        match update {
            StoreUpdate::Change(RowChange::Inserted(message)) => {
                // A delivered message ends its author's typing indicator.
                self.typing.remove(&message.user_id);
                self.store.observe_insert(message);
                if !self.store.is_fetching_more() {
                    self.emit_conversation();
                }
            }
            StoreUpdate::Change(RowChange::Deleted { id }) => {
                let had_target = self.store.reply_target().is_some();
                if self.store.observe_delete(&id) {
                    self.emit_conversation();
                    if had_target && self.store.reply_target().is_none() {
                        self.emit(ChatEvent::ReplyTargetChanged { target: None });
                    }
                }
            }
            StoreUpdate::Presence(event) => match event {
                PresenceEvent::Synced { user_ids } => self.roster.replace(user_ids),
                PresenceEvent::Joined { user_ids } => self.roster.join(&user_ids),
                PresenceEvent::Left { user_ids } => {
                    for user_id in &user_ids {
                        self.typing.remove(user_id);
                    }
                    self.roster.leave(&user_ids);
                }
            },
            StoreUpdate::TypingSeen(signal) => {
                if signal.user_id != self.user_id {
                    self.typing.add(&signal.user_id);
                }
            }
            StoreUpdate::InitialLoaded { generation, result } => {
                // A page requested before a wipe or wholesale reload must
                // not resurrect rows; the spinner still settles.
                if generation != self.store.generation() {
                    debug!("discarding initial page for a replaced conversation");
                } else {
                    match result {
                        Ok(page) => {
                            self.store.replace_with_initial_page(page);
                            self.emit_conversation();
                        }
                        Err(error) => {
                            warn!(code = %error.code, "initial load failed: {error}");
                            self.emit(ChatEvent::ReadFailed { error });
                        }
                    }
                }
                self.emit(ChatEvent::Loading { active: false });
            }
            StoreUpdate::OlderLoaded { generation, result } => {
                if generation != self.store.generation() {
                    debug!("discarding older page for a replaced conversation");
                } else {
                    match result {
                        Ok(page) => {
                            self.store.complete_fetch_older(page);
                            self.emit_conversation();
                        }
                        Err(error) => {
                            warn!(code = %error.code, "older page fetch failed: {error}");
                            self.store.abort_fetch_older();
                            self.emit_conversation();
                            self.emit(ChatEvent::ReadFailed { error });
                        }
                    }
                }
                self.emit(ChatEvent::FetchingOlder { active: false });
            }
            StoreUpdate::TextSendFinished(result) => match result {
                Ok(()) => {
                    if self.store.reply_target().is_some() {
                        self.store.clear_reply_target();
                        self.emit(ChatEvent::ReplyTargetChanged { target: None });
                    }
                }
                Err(error) => self.emit(ChatEvent::SendFailed { error }),
            },
            StoreUpdate::ImageSendFinished { temp_id, result } => match result {
                Ok(()) => {
                    if self.store.reply_target().is_some() {
                        self.store.clear_reply_target();
                        self.emit(ChatEvent::ReplyTargetChanged { target: None });
                    }
                }
                Err(error) => {
                    self.store.remove_temp(&temp_id);
                    self.emit_conversation();
                    self.emit(ChatEvent::SendFailed { error });
                }
            },
        }
    }

    /// Emit an event to all subscribers. Best-effort; lagged subscribers
    /// are handled by `broadcast`.
    fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }

    fn emit_conversation(&self) {
        self.emit(ChatEvent::ConversationUpdated {
            messages: self.store.messages().to_vec(),
        });
    }

    fn emit_offsets_reset(&self) {
        self.emit(ChatEvent::SwipeOffsetsChanged {
            offsets: Vec::new(),
        });
    }

    fn now_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

fn pump<T: Send + 'static>(
    mut events: mpsc::Receiver<T>,
    tx: mpsc::Sender<StoreUpdate>,
    stop: CancellationToken,
    wrap: fn(T) -> StoreUpdate,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if tx.send(wrap(event)).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}
