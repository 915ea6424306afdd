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

//! Message lifecycle management.
//!
//! The [`MessageTimeline`] is the single authoritative mutator of message
//! timelines, for pairwise conversations and groups alike: optimistic local
//! echoes, deduplication by rumor id, monotonic status advancement,
//! reaction aggregation and reply linking all go through it.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, instrument, trace, warn};

use crate::{
    Error, Result,
    config::SyncConfig,
    identifiers::{ChatId, IdentityKey, OuterEventId, RumorId, TransactionId},
    rumor::{ChatContent, ReceiptContent, ReceiptStatus, Tag},
    store::{Conversation, DynStateStore, LastMessage, StateStore as _},
    transport::{DynTransport, Transport as _},
    utils::{preview, unix_timestamp},
};

/// Whether a message was sent by us or received from a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Delivery status of a message.
///
/// Statuses form a lattice ordered by rank; see [`DeliveryStatus::advance`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Optimistically inserted, not yet handed to the transport.
    Pending,
    /// The transport could not deliver the message. Only reachable from
    /// `Pending`; a successful retry moves it on to `Sent`.
    Failed,
    /// Handed off to the event bus.
    Sent,
    /// The peer's device acknowledged delivery.
    Delivered,
    /// The peer has seen the message.
    Seen,
}

impl DeliveryStatus {
    fn rank(self) -> u8 {
        match self {
            DeliveryStatus::Pending => 0,
            DeliveryStatus::Failed => 1,
            DeliveryStatus::Sent => 2,
            DeliveryStatus::Delivered => 3,
            DeliveryStatus::Seen => 4,
        }
    }

    /// Advance to `proposed` only if it outranks the current status.
    ///
    /// Receipts are replayed by relays and arrive out of order across
    /// connections; ranking makes applying them commutative, so any arrival
    /// order converges on the same final status and a replayed "delivered"
    /// after "seen" is a no-op.
    #[must_use]
    pub fn advance(self, proposed: DeliveryStatus) -> DeliveryStatus {
        if proposed.rank() > self.rank() { proposed } else { self }
    }
}

/// A single message in a conversation or group timeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimelineMessage {
    /// Local id, assigned at insertion time. Stable for the lifetime of
    /// the record, unlike the rumor id which is only known once the
    /// transport has derived it.
    pub transaction_id: TransactionId,
    /// Content-derived protocol id. Uniqueness within a chat is enforced
    /// on this id, never on the outer event id.
    pub rumor_id: Option<RumorId>,
    pub chat: ChatId,
    pub sender: IdentityKey,
    pub text: String,
    /// Sender-claimed creation time, unix seconds.
    pub timestamp: u64,
    pub direction: Direction,
    pub status: DeliveryStatus,
    /// Transport envelope id, backfilled asynchronously (e.g. from a
    /// self-echo observed after the original send).
    #[serde(default)]
    pub outer_event_id: Option<OuterEventId>,
    #[serde(default)]
    pub reply_to: Option<RumorId>,
    /// Absolute expiration in unix seconds, for ephemeral messages.
    #[serde(default)]
    pub expires_at: Option<u64>,
    /// Reactions by emoji, each holding the identities that placed it, in
    /// arrival order.
    #[serde(default)]
    pub reactions: IndexMap<String, Vec<IdentityKey>>,
}

impl TimelineMessage {
    /// Whether the message's expiration timestamp has passed.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Apply a reaction, keeping at most one active reaction per identity:
    /// the actor is removed from every emoji bucket before being added to
    /// the new one. Last write wins by arrival order.
    pub fn apply_reaction(&mut self, actor: &IdentityKey, key: &str) {
        for bucket in self.reactions.values_mut() {
            bucket.retain(|k| k != actor);
        }
        self.reactions.retain(|_, bucket| !bucket.is_empty());

        self.reactions.entry(key.to_owned()).or_default().push(actor.clone());
    }

    fn matches_reference(&self, reference: &RumorId) -> bool {
        self.rumor_id.as_ref() == Some(reference)
            || self.outer_event_id.as_ref().is_some_and(|id| id.as_str() == reference.as_str())
            || self.transaction_id.as_str() == reference.as_str()
    }
}

/// Updates published by the timeline, consumed by the UI layer.
#[derive(Clone, Debug)]
pub enum TimelineUpdate {
    /// A message was appended to a timeline, either as an optimistic local
    /// echo or from an inbound rumor.
    NewMessage(TimelineMessage),
    /// An existing message changed (status, reactions, backfilled ids).
    MessageUpdated(TimelineMessage),
    /// A message was removed by user action or the expiry sweep.
    MessageRemoved { chat: ChatId, transaction_id: TransactionId },
    /// A chat's derived fields (preview, unread count) were recomputed.
    ChatRefreshed(ChatId),
}

/// The single authoritative mutator of message timelines.
#[derive(Clone, Debug)]
pub struct MessageTimeline {
    own_key: IdentityKey,
    config: SyncConfig,
    store: DynStateStore,
    transport: DynTransport,
    updates: broadcast::Sender<TimelineUpdate>,
}

impl MessageTimeline {
    pub(crate) fn new(
        own_key: IdentityKey,
        config: SyncConfig,
        store: DynStateStore,
        transport: DynTransport,
    ) -> Self {
        let (updates, _) = broadcast::channel(256);
        Self { own_key, config, store, transport, updates }
    }

    /// Subscribe to timeline updates.
    pub fn subscribe(&self) -> broadcast::Receiver<TimelineUpdate> {
        self.updates.subscribe()
    }

    fn send_update(&self, update: TimelineUpdate) {
        // An error just means there are no subscribers right now.
        let _ = self.updates.send(update);
    }

    /// Get or create the conversation for the given peer.
    ///
    /// Idempotent: repeated calls for the same peer return the same record.
    pub async fn ensure_conversation(
        &self,
        peer: &IdentityKey,
        initiated_by_us: bool,
    ) -> Result<Conversation> {
        if let Some(existing) = self.store.conversation(peer).await? {
            return Ok(existing);
        }

        let conversation = Conversation::new(peer.clone(), unix_timestamp(), initiated_by_us);
        self.store.upsert_conversation(conversation.clone()).await?;
        debug!(%peer, "created conversation");

        Ok(conversation)
    }

    /// Set the message time-to-live of a chat. New outgoing messages get an
    /// absolute expiration of send-time plus this value.
    pub async fn set_message_ttl(&self, chat: &ChatId, ttl: Option<u64>) -> Result<()> {
        match chat {
            ChatId::Direct(peer) => {
                let mut conversation = self.ensure_conversation(peer, true).await?;
                conversation.message_ttl = ttl;
                self.store.upsert_conversation(conversation).await?;
            }
            ChatId::Group(group_id) => {
                let mut group = self
                    .store
                    .group(group_id)
                    .await?
                    .ok_or_else(|| Error::UnknownGroup(group_id.clone()))?;
                group.message_ttl = ttl;
                self.store.upsert_group(group).await?;
            }
        }
        Ok(())
    }

    async fn message_ttl(&self, chat: &ChatId) -> Option<u64> {
        match chat {
            ChatId::Direct(peer) => {
                self.store.conversation(peer).await.ok().flatten().and_then(|c| c.message_ttl)
            }
            ChatId::Group(group_id) => {
                self.store.group(group_id).await.ok().flatten().and_then(|g| g.message_ttl)
            }
        }
    }

    /// Send a chat message, optionally as a reply.
    ///
    /// The message is inserted optimistically with status `Pending`. On a
    /// successful hand-off it advances to `Sent` and records the rumor id,
    /// outer event id and (if the chat has a TTL) its absolute expiration.
    /// On failure it advances to `Failed` and the error is propagated, so
    /// the offline queue can take over.
    pub async fn send_message(
        &self,
        chat: &ChatId,
        text: &str,
        reply_to: Option<RumorId>,
    ) -> Result<TimelineMessage> {
        let (message, error) = self.send_message_impl(chat, text, reply_to).await?;
        match error {
            None => Ok(message),
            Some(err) => Err(err),
        }
    }

    /// Like [`Self::send_message`], but hands back the optimistic local
    /// echo even when delivery failed, so the engine can enqueue it for
    /// retry.
    #[instrument(skip(self, text), fields(chat = %chat))]
    pub(crate) async fn send_message_impl(
        &self,
        chat: &ChatId,
        text: &str,
        reply_to: Option<RumorId>,
    ) -> Result<(TimelineMessage, Option<Error>)> {
        let now = unix_timestamp();

        if let ChatId::Direct(peer) = chat {
            self.ensure_conversation(peer, true).await?;
        }

        let mut message = TimelineMessage {
            transaction_id: TransactionId::new(),
            rumor_id: None,
            chat: chat.clone(),
            sender: self.own_key.clone(),
            text: text.to_owned(),
            timestamp: now,
            direction: Direction::Outgoing,
            status: DeliveryStatus::Pending,
            outer_event_id: None,
            reply_to: reply_to.clone(),
            expires_at: None,
            reactions: Default::default(),
        };

        self.persist_message(&message).await;
        self.bump_chat_record(&message).await;
        self.send_update(TimelineUpdate::NewMessage(message.clone()));

        match self.deliver(chat, text, reply_to).await {
            Ok(sent) => {
                message.rumor_id = Some(sent.rumor_id);
                message.outer_event_id = sent.outer_event_ids.into_iter().next();
                message.status = message.status.advance(DeliveryStatus::Sent);
                if let Some(ttl) = self.message_ttl(chat).await {
                    message.expires_at = Some(now + ttl);
                }

                self.persist_message(&message).await;
                self.send_update(TimelineUpdate::MessageUpdated(message.clone()));

                Ok((message, None))
            }
            Err(err) => {
                message.status = message.status.advance(DeliveryStatus::Failed);
                self.persist_message(&message).await;
                self.send_update(TimelineUpdate::MessageUpdated(message.clone()));

                Ok((message, Some(err)))
            }
        }
    }

    /// Retry the delivery of a previously failed send, driven by the
    /// offline queue. Backfills the same fields as a first-attempt success.
    pub(crate) async fn retry_send(
        &self,
        chat: &ChatId,
        transaction_id: &TransactionId,
        text: &str,
        reply_to: Option<RumorId>,
    ) -> Result<()> {
        let sent = self.deliver(chat, text, reply_to).await?;

        let Some(mut message) =
            self.store.message_by_transaction_id(chat, transaction_id).await?
        else {
            // The user deleted the message while it was queued; the send
            // went through, there is just nothing left to update.
            return Ok(());
        };

        message.rumor_id = Some(sent.rumor_id);
        message.outer_event_id = sent.outer_event_ids.into_iter().next();
        message.status = message.status.advance(DeliveryStatus::Sent);
        if let Some(ttl) = self.message_ttl(chat).await {
            message.expires_at = Some(unix_timestamp() + ttl);
        }

        self.persist_message(&message).await;
        self.send_update(TimelineUpdate::MessageUpdated(message));

        Ok(())
    }

    async fn deliver(
        &self,
        chat: &ChatId,
        text: &str,
        reply_to: Option<RumorId>,
    ) -> Result<crate::transport::SentRumor> {
        let mut tags = Vec::new();
        if let Some(parent) = &reply_to {
            tags.push(Tag::event(parent, Some("reply")));
        }

        match chat {
            ChatId::Direct(peer) => Ok(self.transport.send_chat(peer, text, tags).await?),
            ChatId::Group(group_id) => {
                let group = self
                    .store
                    .group(group_id)
                    .await?
                    .ok_or_else(|| Error::UnknownGroup(group_id.clone()))?;
                // Keep the provider's membership and key-distribution state
                // in sync with our record before anything goes out.
                self.transport.group_upsert(&group).await?;
                Ok(self.transport.group_send_chat(group_id, text, tags).await?)
            }
        }
    }

    /// Send a reaction to a message in this chat and apply it locally.
    pub async fn send_reaction(&self, chat: &ChatId, target: &RumorId, key: &str) -> Result<()> {
        let Some(mut message) = self.find_by_reference(chat, target).await? else {
            return Err(Error::UnknownMessage(target.clone()));
        };

        match chat {
            ChatId::Direct(peer) => {
                self.transport.send_reaction(peer, target, key).await?;
            }
            ChatId::Group(group_id) => {
                self.transport.group_send_reaction(group_id, target, key).await?;
            }
        }

        message.apply_reaction(&self.own_key, key);
        self.persist_message(&message).await;
        self.send_update(TimelineUpdate::MessageUpdated(message));

        Ok(())
    }

    /// Handle an inbound chat rumor that has already been decoded and
    /// routed to this chat.
    ///
    /// Returns the inserted message, or `None` when the rumor was a
    /// duplicate or already expired.
    #[instrument(skip(self, content), fields(chat = %chat, rumor_id = %rumor_id))]
    pub(crate) async fn handle_incoming_chat(
        &self,
        chat: &ChatId,
        sender: &IdentityKey,
        rumor_id: &RumorId,
        content: ChatContent,
        outer_event_id: Option<OuterEventId>,
        timestamp: u64,
    ) -> Result<Option<TimelineMessage>> {
        let now = unix_timestamp();

        // Expired-on-arrival messages are never surfaced nor persisted.
        if content.expires_at.is_some_and(|at| at <= now) {
            trace!("dropping expired inbound message");
            return Ok(None);
        }

        // Dedup by rumor id. Redeliveries are no-ops, except that a
        // self-echo may carry an outer event id we haven't recorded yet;
        // backfill it so reactions referencing transport ids still resolve.
        if let Some(mut existing) = self.store.message_by_rumor_id(chat, rumor_id).await? {
            if existing.outer_event_id.is_none() {
                if let Some(outer) = outer_event_id {
                    existing.outer_event_id = Some(outer);
                    self.persist_message(&existing).await;
                    self.send_update(TimelineUpdate::MessageUpdated(existing));
                }
            }
            trace!("duplicate rumor, ignoring");
            return Ok(None);
        }

        let is_self = *sender == self.own_key;
        let message = TimelineMessage {
            transaction_id: TransactionId::new(),
            rumor_id: Some(rumor_id.clone()),
            chat: chat.clone(),
            sender: sender.clone(),
            text: content.text,
            timestamp,
            direction: if is_self { Direction::Outgoing } else { Direction::Incoming },
            // Our own rumor echoed back from another device was evidently
            // sent; a peer's message is by definition delivered to us.
            status: if is_self { DeliveryStatus::Sent } else { DeliveryStatus::Delivered },
            outer_event_id,
            reply_to: content.reply_to,
            expires_at: content.expires_at,
            reactions: Default::default(),
        };

        if let ChatId::Direct(peer) = chat {
            self.ensure_conversation(peer, is_self).await?;
        }

        self.persist_message(&message).await;
        self.bump_chat_record(&message).await;
        self.send_update(TimelineUpdate::NewMessage(message.clone()));

        if !is_self && self.config.auto_delivery_receipts {
            // Best effort; a lost receipt only delays the sender's UI.
            if let Err(err) = self
                .transport
                .send_receipt(sender, ReceiptStatus::Delivered, vec![rumor_id.clone()])
                .await
            {
                warn!("failed to send automatic delivery receipt: {err}");
            }
        }

        Ok(Some(message))
    }

    /// Apply an inbound receipt to the outgoing messages it references.
    ///
    /// Ids that don't match any known message are skipped: the message may
    /// not be persisted yet, or belongs to another device.
    #[instrument(skip(self, receipt), fields(chat = %chat))]
    pub(crate) async fn apply_receipt(&self, chat: &ChatId, receipt: &ReceiptContent) {
        let proposed = match receipt.status {
            ReceiptStatus::Delivered => DeliveryStatus::Delivered,
            ReceiptStatus::Seen => DeliveryStatus::Seen,
        };

        for rumor_id in &receipt.rumor_ids {
            let found = match self.lookup_for_receipt(chat, rumor_id).await {
                Ok(found) => found,
                Err(err) => {
                    warn!("receipt lookup failed: {err}");
                    continue;
                }
            };

            let Some(mut message) = found else {
                trace!(%rumor_id, "receipt for unknown message, ignoring");
                continue;
            };

            if message.direction != Direction::Outgoing {
                continue;
            }

            let advanced = message.status.advance(proposed);
            if advanced != message.status {
                message.status = advanced;
                self.persist_message(&message).await;
                self.send_update(TimelineUpdate::MessageUpdated(message));
            }
        }
    }

    async fn lookup_for_receipt(
        &self,
        chat: &ChatId,
        rumor_id: &RumorId,
    ) -> Result<Option<TimelineMessage>> {
        if let Some(found) = self.store.message_by_rumor_id(chat, rumor_id).await? {
            return Ok(Some(found));
        }
        // Fallback: some senders reference our local message id.
        let as_transaction = TransactionId::from(rumor_id.as_str());
        Ok(self.store.message_by_transaction_id(chat, &as_transaction).await?)
    }

    /// Find a message by rumor id, outer event id or transaction id.
    async fn find_by_reference(
        &self,
        chat: &ChatId,
        reference: &RumorId,
    ) -> Result<Option<TimelineMessage>> {
        let messages = self.store.messages(chat).await?;
        Ok(messages.into_iter().find(|m| m.matches_reference(reference)))
    }

    /// Apply an inbound reaction. Returns whether a target was found.
    pub(crate) async fn apply_inbound_reaction(
        &self,
        chat: &ChatId,
        actor: &IdentityKey,
        target: &RumorId,
        key: &str,
    ) -> Result<bool> {
        let Some(mut message) = self.find_by_reference(chat, target).await? else {
            trace!(%target, "reaction for unknown message, ignoring");
            return Ok(false);
        };

        message.apply_reaction(actor, key);
        self.persist_message(&message).await;
        self.send_update(TimelineUpdate::MessageUpdated(message));

        Ok(true)
    }

    /// Mark a chat as read: local incoming messages advance to `Seen`, the
    /// unread count resets, and (for pairwise chats) a "seen" receipt is
    /// sent for the newly seen messages.
    pub async fn mark_seen(&self, chat: &ChatId) -> Result<()> {
        let mut seen_ids = Vec::new();

        for mut message in self.store.messages(chat).await? {
            if message.direction == Direction::Incoming
                && message.status != DeliveryStatus::Seen
            {
                message.status = message.status.advance(DeliveryStatus::Seen);
                if let Some(rumor_id) = &message.rumor_id {
                    seen_ids.push(rumor_id.clone());
                }
                self.persist_message(&message).await;
                self.send_update(TimelineUpdate::MessageUpdated(message));
            }
        }

        self.recompute_derived(chat).await?;

        if let (ChatId::Direct(peer), false) = (chat, seen_ids.is_empty()) {
            if let Err(err) =
                self.transport.send_receipt(peer, ReceiptStatus::Seen, seen_ids).await
            {
                warn!("failed to send seen receipt: {err}");
            }
        }

        Ok(())
    }

    /// Remove a message on explicit user action.
    pub async fn delete_message(&self, chat: &ChatId, transaction_id: &TransactionId) -> Result<()> {
        self.store.remove_message(chat, transaction_id).await?;
        self.send_update(TimelineUpdate::MessageRemoved {
            chat: chat.clone(),
            transaction_id: transaction_id.clone(),
        });
        self.recompute_derived(chat).await?;
        Ok(())
    }

    /// Drop every message whose TTL has expired and refresh the affected
    /// chats' derived fields.
    pub async fn sweep_expired(&self) -> Result<Vec<ChatId>> {
        let affected = self.store.remove_expired_messages(unix_timestamp()).await?;

        for chat in &affected {
            self.recompute_derived(chat).await?;
        }

        Ok(affected)
    }

    /// Rebuild a chat's last-message preview and unread count from its
    /// remaining messages.
    async fn recompute_derived(&self, chat: &ChatId) -> Result<()> {
        let messages = self.store.messages(chat).await?;

        let last_message = messages
            .iter()
            .max_by_key(|m| m.timestamp)
            .map(|m| LastMessage { preview: preview(&m.text), at: m.timestamp });
        let unread_count = messages
            .iter()
            .filter(|m| {
                m.direction == Direction::Incoming && m.status != DeliveryStatus::Seen
            })
            .count() as u64;

        match chat {
            ChatId::Direct(peer) => {
                if let Some(mut conversation) = self.store.conversation(peer).await? {
                    conversation.last_message = last_message;
                    conversation.unread_count = unread_count;
                    self.store.upsert_conversation(conversation).await?;
                }
            }
            ChatId::Group(group_id) => {
                if let Some(mut group) = self.store.group(group_id).await? {
                    group.last_message = last_message;
                    group.unread_count = unread_count;
                    self.store.upsert_group(group).await?;
                }
            }
        }

        self.send_update(TimelineUpdate::ChatRefreshed(chat.clone()));
        Ok(())
    }

    /// Update the chat record after a message insertion: newest-message
    /// preview, plus an unread increment for genuine incoming messages.
    async fn bump_chat_record(&self, message: &TimelineMessage) {
        let incoming = message.direction == Direction::Incoming;
        let last = LastMessage { preview: preview(&message.text), at: message.timestamp };

        let result = match &message.chat {
            ChatId::Direct(peer) => match self.store.conversation(peer).await {
                Ok(Some(mut conversation)) => {
                    if conversation.last_message.as_ref().is_none_or(|l| l.at <= last.at) {
                        conversation.last_message = Some(last);
                    }
                    if incoming {
                        conversation.unread_count += 1;
                    }
                    self.store.upsert_conversation(conversation).await
                }
                Ok(None) => Ok(()),
                Err(err) => Err(err),
            },
            ChatId::Group(group_id) => match self.store.group(group_id).await {
                Ok(Some(mut group)) => {
                    if group.last_message.as_ref().is_none_or(|l| l.at <= last.at) {
                        group.last_message = Some(last);
                    }
                    if incoming {
                        group.unread_count += 1;
                    }
                    self.store.upsert_group(group).await
                }
                Ok(None) => Ok(()),
                Err(err) => Err(err),
            },
        };

        if let Err(err) = result {
            warn!(chat = %message.chat, "failed to update chat record: {err}");
        }
    }

    /// Persist a message, logging and swallowing storage failures so the
    /// reactive state never stalls on disk I/O.
    async fn persist_message(&self, message: &TimelineMessage) {
        if let Err(err) = self.store.save_message(message.clone()).await {
            warn!(chat = %message.chat, "failed to persist message: {err}");
        }
    }
}
