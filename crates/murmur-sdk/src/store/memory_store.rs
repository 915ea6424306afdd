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

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;

use super::{Conversation, Group, QueuedSend, Result, StateStore};
use crate::{
    identifiers::{ChatId, GroupId, IdentityKey, RumorId, TransactionId},
    timeline::TimelineMessage,
};

/// In-memory, non-persistent implementation of the [`StateStore`].
///
/// Default if no other is configured at startup.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    conversations: BTreeMap<IdentityKey, Conversation>,
    groups: BTreeMap<GroupId, Group>,
    /// Messages per chat, in arrival order.
    messages: BTreeMap<ChatId, Vec<TimelineMessage>>,
    /// Queued sends, oldest first.
    queued_sends: Vec<QueuedSend>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn conversation(&self, peer: &IdentityKey) -> Result<Option<Conversation>> {
        Ok(self.inner.read().unwrap().conversations.get(peer).cloned())
    }

    async fn conversations(&self) -> Result<Vec<Conversation>> {
        Ok(self.inner.read().unwrap().conversations.values().cloned().collect())
    }

    async fn upsert_conversation(&self, conversation: Conversation) -> Result<()> {
        self.inner.write().unwrap().conversations.insert(conversation.peer.clone(), conversation);
        Ok(())
    }

    async fn group(&self, group_id: &GroupId) -> Result<Option<Group>> {
        Ok(self.inner.read().unwrap().groups.get(group_id).cloned())
    }

    async fn groups(&self) -> Result<Vec<Group>> {
        Ok(self.inner.read().unwrap().groups.values().cloned().collect())
    }

    async fn upsert_group(&self, group: Group) -> Result<()> {
        self.inner.write().unwrap().groups.insert(group.id.clone(), group);
        Ok(())
    }

    async fn remove_group(&self, group_id: &GroupId) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.groups.remove(group_id);
        inner.messages.remove(&ChatId::Group(group_id.clone()));
        Ok(())
    }

    async fn message_by_rumor_id(
        &self,
        chat: &ChatId,
        rumor_id: &RumorId,
    ) -> Result<Option<TimelineMessage>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .messages
            .get(chat)
            .and_then(|msgs| msgs.iter().find(|m| m.rumor_id.as_ref() == Some(rumor_id)))
            .cloned())
    }

    async fn message_by_transaction_id(
        &self,
        chat: &ChatId,
        transaction_id: &TransactionId,
    ) -> Result<Option<TimelineMessage>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .messages
            .get(chat)
            .and_then(|msgs| msgs.iter().find(|m| &m.transaction_id == transaction_id))
            .cloned())
    }

    async fn messages(&self, chat: &ChatId) -> Result<Vec<TimelineMessage>> {
        Ok(self.inner.read().unwrap().messages.get(chat).cloned().unwrap_or_default())
    }

    async fn save_message(&self, message: TimelineMessage) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let timeline = inner.messages.entry(message.chat.clone()).or_default();

        if let Some(existing) =
            timeline.iter_mut().find(|m| m.transaction_id == message.transaction_id)
        {
            *existing = message;
        } else {
            timeline.push(message);
        }

        Ok(())
    }

    async fn remove_message(&self, chat: &ChatId, transaction_id: &TransactionId) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if let Some(timeline) = inner.messages.get_mut(chat) {
            timeline.retain(|m| &m.transaction_id != transaction_id);
        }
        Ok(())
    }

    async fn remove_expired_messages(&self, now: u64) -> Result<Vec<ChatId>> {
        let mut inner = self.inner.write().unwrap();
        let mut affected = Vec::new();

        for (chat, timeline) in inner.messages.iter_mut() {
            let before = timeline.len();
            timeline.retain(|m| !m.is_expired(now));
            if timeline.len() != before {
                affected.push(chat.clone());
            }
        }

        Ok(affected)
    }

    async fn save_queued_send(&self, entry: QueuedSend) -> Result<()> {
        let mut inner = self.inner.write().unwrap();

        if let Some(existing) =
            inner.queued_sends.iter_mut().find(|e| e.transaction_id == entry.transaction_id)
        {
            *existing = entry;
        } else {
            inner.queued_sends.push(entry);
        }

        Ok(())
    }

    async fn queued_sends(&self) -> Result<Vec<QueuedSend>> {
        Ok(self.inner.read().unwrap().queued_sends.clone())
    }

    async fn update_queued_send_attempt(
        &self,
        transaction_id: &TransactionId,
        attempts: u8,
        last_attempt_at: u64,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();

        if let Some(entry) =
            inner.queued_sends.iter_mut().find(|e| &e.transaction_id == transaction_id)
        {
            entry.attempts = attempts;
            entry.last_attempt_at = Some(last_attempt_at);
        }

        Ok(())
    }

    async fn remove_queued_send(&self, transaction_id: &TransactionId) -> Result<()> {
        self.inner.write().unwrap().queued_sends.retain(|e| &e.transaction_id != transaction_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::{DeliveryStatus, Direction};

    fn message(chat: ChatId, text: &str, expires_at: Option<u64>) -> TimelineMessage {
        TimelineMessage {
            transaction_id: TransactionId::new(),
            rumor_id: Some(RumorId::from(text)),
            chat,
            sender: IdentityKey::from("sender"),
            text: text.to_owned(),
            timestamp: 1_700_000_000,
            direction: Direction::Incoming,
            status: DeliveryStatus::Delivered,
            outer_event_id: None,
            reply_to: None,
            expires_at,
            reactions: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_save_message_replaces_by_transaction_id() {
        let store = MemoryStore::new();
        let chat = ChatId::Direct(IdentityKey::from("peer"));

        let mut msg = message(chat.clone(), "one", None);
        store.save_message(msg.clone()).await.unwrap();

        msg.text = "edited".to_owned();
        store.save_message(msg.clone()).await.unwrap();

        let timeline = store.messages(&chat).await.unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].text, "edited");
    }

    #[tokio::test]
    async fn test_remove_expired_messages_reports_affected_chats() {
        let store = MemoryStore::new();
        let chat = ChatId::Direct(IdentityKey::from("peer"));
        let other = ChatId::Direct(IdentityKey::from("other"));

        store.save_message(message(chat.clone(), "stale", Some(100))).await.unwrap();
        store.save_message(message(chat.clone(), "fresh", Some(10_000))).await.unwrap();
        store.save_message(message(other.clone(), "keep", None)).await.unwrap();

        let affected = store.remove_expired_messages(500).await.unwrap();
        assert_eq!(affected, vec![chat.clone()]);

        assert_eq!(store.messages(&chat).await.unwrap().len(), 1);
        assert_eq!(store.messages(&other).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_queued_sends_stay_fifo() {
        let store = MemoryStore::new();
        let chat = ChatId::Direct(IdentityKey::from("peer"));

        for text in ["first", "second", "third"] {
            store
                .save_queued_send(QueuedSend {
                    transaction_id: TransactionId::new(),
                    chat: chat.clone(),
                    text: text.to_owned(),
                    reply_to: None,
                    created_at: 1,
                    attempts: 0,
                    last_attempt_at: None,
                })
                .await
                .unwrap();
        }

        let queued = store.queued_sends().await.unwrap();
        let texts: Vec<_> = queued.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, ["first", "second", "third"]);
    }
}
