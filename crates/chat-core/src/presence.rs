use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{sync::broadcast, task::JoinHandle};
use tracing::trace;

use crate::types::ChatEvent;

/// Tracks which remote users currently show a typing indicator.
///
/// Every observed signal arms (or re-arms) a per-user expiry timer; a
/// user with no refreshing signal within the TTL is dropped. Presence
/// leaves remove the user immediately so a closed app cannot leave a
/// stuck indicator behind.
#[derive(Clone)]
pub struct TypingTracker {
    inner: Arc<std::sync::Mutex<TypingInner>>,
    ttl: Duration,
    events: broadcast::Sender<ChatEvent>,
}

struct TypingInner {
    users: Vec<String>,
    timers: HashMap<String, JoinHandle<()>>,
}

impl TypingTracker {
    pub fn new(ttl: Duration, events: broadcast::Sender<ChatEvent>) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(TypingInner {
                users: Vec::new(),
                timers: HashMap::new(),
            })),
            ttl,
            events,
        }
    }

    /// Record a typing signal for `user_id` and re-arm its expiry timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add(&self, user_id: &str) {
        let mut changed = false;
        {
            let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(timer) = inner.timers.remove(user_id) {
                timer.abort();
            }
            if !inner.users.iter().any(|u| u == user_id) {
                inner.users.push(user_id.to_owned());
                changed = true;
            }

            let tracker = self.clone();
            let ttl = self.ttl;
            let expiring = user_id.to_owned();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                trace!(user_id = %expiring, "typing indicator expired");
                tracker.remove(&expiring);
            });
            inner.timers.insert(user_id.to_owned(), timer);
        }
        if changed {
            self.emit();
        }
    }

    /// Drop `user_id` from the typing set immediately. Idempotent.
    pub fn remove(&self, user_id: &str) {
        let changed = {
            let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(timer) = inner.timers.remove(user_id) {
                timer.abort();
            }
            let before = inner.users.len();
            inner.users.retain(|u| u != user_id);
            before != inner.users.len()
        };
        if changed {
            self.emit();
        }
    }

    /// Abort all timers and clear the set without emitting.
    pub fn drain(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for (_, timer) in inner.timers.drain() {
            timer.abort();
        }
        inner.users.clear();
    }

    pub fn typing_users(&self) -> Vec<String> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).users.clone()
    }

    fn emit(&self) {
        let user_ids = self.typing_users();
        let _ = self.events.send(ChatEvent::TypingChanged { user_ids });
    }
}

/// Current online set derived from the presence channel.
///
/// Sync events replace the whole roster; join/leave adjust it.
pub struct OnlineRoster {
    users: Vec<String>,
    events: broadcast::Sender<ChatEvent>,
}

impl OnlineRoster {
    pub fn new(events: broadcast::Sender<ChatEvent>) -> Self {
        Self {
            users: Vec::new(),
            events,
        }
    }

    pub fn replace(&mut self, user_ids: Vec<String>) {
        self.users = user_ids;
        self.users.sort();
        self.users.dedup();
        self.emit();
    }

    pub fn join(&mut self, user_ids: &[String]) {
        for user in user_ids {
            if !self.users.contains(user) {
                self.users.push(user.clone());
            }
        }
        self.users.sort();
        self.emit();
    }

    pub fn leave(&mut self, user_ids: &[String]) {
        self.users.retain(|u| !user_ids.contains(u));
        self.emit();
    }

    pub fn online_users(&self) -> &[String] {
        &self.users
    }

    fn emit(&self) {
        let _ = self.events.send(ChatEvent::OnlineChanged {
            user_ids: self.users.clone(),
        });
    }
}
