// Copyright 2025 The murmur-sdk Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Ephemeral typing presence.
//!
//! Typing state is held in memory only, keyed by [`ChatId`] — for pairwise
//! chats that key *is* the peer's identity key, so conversation id and peer
//! key resolve to the same entry by construction.
//!
//! Outbound notifications are throttled; inbound presence runs on a
//! cancellable expiry timer that is always cancelled before being
//! superseded, so a presence flag can never be cleared by a stale timer.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use eyeball::{SharedObservable, Subscriber};
use murmur_sdk_common::{
    executor::{AbortOnDrop, JoinHandleExt, spawn},
    sleep::sleep,
};
use tokio::time::Instant;
use tracing::{instrument, trace};

use crate::{
    Result,
    config::SyncConfig,
    identifiers::{ChatId, IdentityKey},
    rumor::TypingContent,
    transport::{DynTransport, Transport as _},
    utils::unix_timestamp,
};

struct TypingEntry {
    observable: SharedObservable<bool>,
    /// Timestamp of the most recent inbound "start" signal; the race guard
    /// in [`TypingManager::clear_on_message`] compares against this.
    last_signal_at: u64,
    /// Expiry timer for the current presence, aborted on supersession.
    expiry: Option<AbortOnDrop<()>>,
}

impl TypingEntry {
    fn new() -> Self {
        Self { observable: SharedObservable::new(false), last_signal_at: 0, expiry: None }
    }
}

/// Manager of ephemeral typing state, inbound and outbound.
#[derive(Clone)]
pub struct TypingManager {
    own_key: IdentityKey,
    config: SyncConfig,
    transport: DynTransport,
    entries: Arc<Mutex<HashMap<ChatId, TypingEntry>>>,
    /// Last outbound notification per chat, for the throttle window.
    last_sent: Arc<Mutex<HashMap<ChatId, Instant>>>,
}

impl std::fmt::Debug for TypingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypingManager").finish_non_exhaustive()
    }
}

impl TypingManager {
    pub(crate) fn new(own_key: IdentityKey, config: SyncConfig, transport: DynTransport) -> Self {
        Self {
            own_key,
            config,
            transport,
            entries: Default::default(),
            last_sent: Default::default(),
        }
    }

    /// Subscribe to the typing flag of a chat.
    pub fn subscribe(&self, chat: &ChatId) -> Subscriber<bool> {
        let mut entries = self.entries.lock().unwrap();
        entries.entry(chat.clone()).or_insert_with(TypingEntry::new).observable.subscribe()
    }

    /// Whether the peer (or anyone, in a group) is currently typing.
    pub fn is_typing(&self, chat: &ChatId) -> bool {
        let entries = self.entries.lock().unwrap();
        entries.get(chat).map(|e| e.observable.get()).unwrap_or(false)
    }

    /// Notify the chat that the local user is typing.
    ///
    /// Throttled: a repeat call within the throttle window is suppressed,
    /// so this can be called on every keystroke.
    #[instrument(skip(self), fields(chat = %chat))]
    pub async fn notify_typing(&self, chat: &ChatId) -> Result<()> {
        {
            let mut last_sent = self.last_sent.lock().unwrap();
            if let Some(at) = last_sent.get(chat) {
                if at.elapsed() < self.config.typing_throttle {
                    trace!("typing notification throttled");
                    return Ok(());
                }
            }
            last_sent.insert(chat.clone(), Instant::now());
        }

        let expires_at = unix_timestamp() + self.config.typing_expiry.as_secs();
        self.send_signal(chat, true, Some(expires_at)).await
    }

    /// Notify the chat that the local user stopped typing.
    ///
    /// Not throttled: the stop signal goes out immediately, tagged with an
    /// already-reached expiration so late deliveries are still understood
    /// as a stop, and the local throttle state is reset.
    pub async fn notify_typing_stopped(&self, chat: &ChatId) -> Result<()> {
        self.last_sent.lock().unwrap().remove(chat);

        self.send_signal(chat, false, Some(unix_timestamp())).await
    }

    async fn send_signal(&self, chat: &ChatId, active: bool, expires_at: Option<u64>) -> Result<()> {
        match chat {
            ChatId::Direct(peer) => {
                self.transport.send_typing(peer, active, expires_at).await?;
            }
            ChatId::Group(group_id) => {
                self.transport.group_send_typing(group_id, active, expires_at).await?;
            }
        }
        Ok(())
    }

    /// Handle an inbound typing rumor that has been routed to this chat.
    #[instrument(skip(self, content), fields(chat = %chat))]
    pub(crate) fn handle_inbound(
        &self,
        chat: &ChatId,
        sender: &IdentityKey,
        content: &TypingContent,
        created_at: u64,
    ) {
        // Our own typing, echoed via multi-device sync, is not presence.
        if *sender == self.own_key {
            return;
        }

        let now = unix_timestamp();
        let stop =
            !content.active || content.expires_at.is_some_and(|at| at <= now);

        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(chat.clone()).or_insert_with(TypingEntry::new);

        if stop {
            // Stops clear unconditionally, no matter how they compare to
            // previous signals.
            entry.expiry = None;
            entry.observable.set_if_not_eq(false);
            return;
        }

        entry.last_signal_at = entry.last_signal_at.max(created_at);
        entry.observable.set_if_not_eq(true);

        // Arm the expiry, cancelling any previous timer first.
        let observable = entry.observable.clone();
        let expiry = self.config.typing_expiry;
        entry.expiry = Some(
            spawn(async move {
                sleep(expiry).await;
                observable.set_if_not_eq(false);
            })
            .abort_on_drop(),
        );
    }

    /// Clear presence because a genuine chat message arrived.
    ///
    /// Only clears when the message is not older than the last typing
    /// signal: a replayed or delayed message must not wipe an indicator
    /// that was refreshed more recently.
    pub(crate) fn clear_on_message(&self, chat: &ChatId, message_timestamp: u64) {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(chat) else {
            return;
        };

        if message_timestamp >= entry.last_signal_at {
            entry.expiry = None;
            entry.observable.set_if_not_eq(false);
        } else {
            trace!("stale message, keeping typing presence");
        }
    }

    /// Cancel all pending expiry timers. Called on engine shutdown.
    pub(crate) fn shutdown(&self) {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.values_mut() {
            entry.expiry = None;
        }
    }
}
