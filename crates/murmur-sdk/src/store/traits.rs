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

use std::{fmt, sync::Arc};

use async_trait::async_trait;

use super::{Conversation, Group, QueuedSend, Result};
use crate::{
    identifiers::{ChatId, GroupId, IdentityKey, RumorId, TransactionId},
    timeline::TimelineMessage,
};

/// An abstract timeline store trait that can be used to implement different
/// stores for the SDK.
#[async_trait]
pub trait StateStore: fmt::Debug + Send + Sync {
    /// Get the conversation for the given peer, if one exists.
    async fn conversation(&self, peer: &IdentityKey) -> Result<Option<Conversation>>;

    /// Get all known conversations.
    async fn conversations(&self) -> Result<Vec<Conversation>>;

    /// Insert or replace a conversation record.
    async fn upsert_conversation(&self, conversation: Conversation) -> Result<()>;

    /// Get a group by its id.
    async fn group(&self, group_id: &GroupId) -> Result<Option<Group>>;

    /// Get all known groups.
    async fn groups(&self) -> Result<Vec<Group>>;

    /// Insert or replace a group record.
    async fn upsert_group(&self, group: Group) -> Result<()>;

    /// Delete a group and its timeline.
    async fn remove_group(&self, group_id: &GroupId) -> Result<()>;

    /// Get a message by the stable rumor id.
    async fn message_by_rumor_id(
        &self,
        chat: &ChatId,
        rumor_id: &RumorId,
    ) -> Result<Option<TimelineMessage>>;

    /// Get a message by its local transaction id.
    async fn message_by_transaction_id(
        &self,
        chat: &ChatId,
        transaction_id: &TransactionId,
    ) -> Result<Option<TimelineMessage>>;

    /// All messages of a conversation or group, in arrival order.
    async fn messages(&self, chat: &ChatId) -> Result<Vec<TimelineMessage>>;

    /// Insert or replace a message, keyed by its transaction id.
    async fn save_message(&self, message: TimelineMessage) -> Result<()>;

    /// Remove a single message.
    async fn remove_message(&self, chat: &ChatId, transaction_id: &TransactionId) -> Result<()>;

    /// Remove every message whose expiration timestamp is at or before
    /// `now`, returning the affected chats.
    async fn remove_expired_messages(&self, now: u64) -> Result<Vec<ChatId>>;

    /// Persist a queued send.
    async fn save_queued_send(&self, entry: QueuedSend) -> Result<()>;

    /// All queued sends, oldest first.
    async fn queued_sends(&self) -> Result<Vec<QueuedSend>>;

    /// Record a delivery attempt for a queued send.
    async fn update_queued_send_attempt(
        &self,
        transaction_id: &TransactionId,
        attempts: u8,
        last_attempt_at: u64,
    ) -> Result<()>;

    /// Remove a queued send after confirmed hand-off to the event bus.
    async fn remove_queued_send(&self, transaction_id: &TransactionId) -> Result<()>;
}

/// Shareable, type-erased state store.
pub type DynStateStore = Arc<dyn StateStore>;
