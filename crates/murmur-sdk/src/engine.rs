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

//! The conversation synchronization engine.
//!
//! This is the composition root wiring decoder, identity resolution and
//! the per-domain managers together. It consumes the transport's stream of
//! decrypted envelopes and turns it — out-of-order, duplicated and
//! partially garbage as it is — into consistent per-conversation state.
//!
//! Handler failures are isolated per event: one malformed rumor never
//! halts the stream.

use std::sync::Arc;

use futures_core::Stream;
use futures_util::StreamExt;
use tracing::{debug, instrument, trace, warn};

use crate::{
    Error, Result,
    bus::Connectivity,
    config::SyncConfig,
    group::{GroupManager, GroupUpdate, PendingGroupEvent},
    identifiers::{ChatId, GroupId, IdentityKey, RumorId, TransactionId},
    identity::IdentityResolver,
    rumor::{ChatContent, Rumor, RumorKind},
    send_queue::SendQueue,
    store::{DynStateStore, MemoryStore, StateStore as _},
    timeline::{MessageTimeline, TimelineMessage, TimelineUpdate},
    transport::{DecryptedEnvelope, DynTransport},
    typing::TypingManager,
    utils::unix_timestamp,
};

/// Builder for a [`SyncEngine`].
#[derive(Debug)]
pub struct SyncEngineBuilder {
    own_key: IdentityKey,
    transport: DynTransport,
    store: Option<DynStateStore>,
    connectivity: Option<Connectivity>,
    config: SyncConfig,
}

impl SyncEngineBuilder {
    /// Use the given state store instead of the in-memory default.
    #[must_use]
    pub fn store(mut self, store: DynStateStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Use the given connectivity handle, driven by the event bus.
    #[must_use]
    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Use the given configuration.
    #[must_use]
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the engine and spawn its background machinery.
    pub fn build(self) -> SyncEngine {
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let connectivity = self.connectivity.unwrap_or_default();

        let timeline = MessageTimeline::new(
            self.own_key.clone(),
            self.config.clone(),
            store.clone(),
            self.transport.clone(),
        );
        let groups = GroupManager::new(
            self.own_key.clone(),
            self.config.clone(),
            store.clone(),
            self.transport.clone(),
        );
        let typing =
            TypingManager::new(self.own_key.clone(), self.config.clone(), self.transport.clone());
        let send_queue = SendQueue::new(
            store.clone(),
            timeline.clone(),
            connectivity.clone(),
            self.config.clone(),
        );
        let resolver = IdentityResolver::new(self.own_key.clone(), store.clone());

        SyncEngine {
            inner: Arc::new(EngineInner {
                own_key: self.own_key,
                store,
                connectivity,
                timeline,
                groups,
                typing,
                send_queue,
                resolver,
            }),
        }
    }
}

struct EngineInner {
    own_key: IdentityKey,
    store: DynStateStore,
    connectivity: Connectivity,
    timeline: MessageTimeline,
    groups: GroupManager,
    typing: TypingManager,
    send_queue: SendQueue,
    resolver: IdentityResolver,
}

/// The conversation synchronization engine.
///
/// This is cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine").field("own_key", &self.inner.own_key).finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Start building an engine for the given identity, on top of the
    /// given transport crypto provider.
    pub fn builder(own_key: IdentityKey, transport: DynTransport) -> SyncEngineBuilder {
        SyncEngineBuilder {
            own_key,
            transport,
            store: None,
            connectivity: None,
            config: SyncConfig::new(),
        }
    }

    /// The local user's identity key.
    pub fn own_key(&self) -> &IdentityKey {
        &self.inner.own_key
    }

    /// The underlying state store.
    pub fn store(&self) -> &DynStateStore {
        &self.inner.store
    }

    /// The event bus connectivity handle.
    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.connectivity
    }

    /// The message timeline manager.
    pub fn timeline(&self) -> &MessageTimeline {
        &self.inner.timeline
    }

    /// The group reconciliation manager.
    pub fn groups(&self) -> &GroupManager {
        &self.inner.groups
    }

    /// The typing presence manager.
    pub fn typing(&self) -> &TypingManager {
        &self.inner.typing
    }

    /// The offline delivery queue.
    pub fn send_queue(&self) -> &SendQueue {
        &self.inner.send_queue
    }

    /// Subscribe to timeline updates.
    pub fn subscribe_timeline(&self) -> tokio::sync::broadcast::Receiver<TimelineUpdate> {
        self.inner.timeline.subscribe()
    }

    /// Subscribe to group record updates.
    pub fn subscribe_groups(&self) -> tokio::sync::broadcast::Receiver<GroupUpdate> {
        self.inner.groups.subscribe()
    }

    /// Send a chat message.
    ///
    /// The optimistic local echo is returned in all cases. When delivery
    /// fails with a retryable error the send is handed to the offline
    /// queue, and the returned echo carries the `Failed` status until the
    /// queue gets it through; a non-retryable failure is returned as an
    /// error.
    pub async fn send_message(
        &self,
        chat: &ChatId,
        text: &str,
        reply_to: Option<RumorId>,
    ) -> Result<TimelineMessage> {
        let (message, error) =
            self.inner.timeline.send_message_impl(chat, text, reply_to.clone()).await?;

        match error {
            None => Ok(message),
            Some(err) if is_retryable(&err) => {
                debug!(chat = %chat, "send failed, handing over to the offline queue: {err}");
                self.inner
                    .send_queue
                    .enqueue(
                        chat.clone(),
                        message.transaction_id.clone(),
                        text.to_owned(),
                        reply_to,
                    )
                    .await?;
                Ok(message)
            }
            Some(err) => Err(err),
        }
    }

    /// Consume a stream of decrypted envelopes until it ends.
    ///
    /// Per-envelope failures are logged and swallowed so a single bad
    /// event cannot take the whole stream down.
    pub async fn run(&self, stream: impl Stream<Item = DecryptedEnvelope>) {
        futures_util::pin_mut!(stream);

        while let Some(envelope) = stream.next().await {
            if let Err(err) = self.handle_decrypted(envelope).await {
                warn!("failed to handle decrypted event: {err}");
            }
        }

        debug!("decrypted event stream ended");
    }

    /// Handle a single decrypted envelope.
    #[instrument(skip_all, fields(sender = %envelope.sender))]
    pub async fn handle_decrypted(&self, envelope: DecryptedEnvelope) -> Result<()> {
        let DecryptedEnvelope { sender, payload, outer_event_id, created_at } = envelope;

        let Some(rumor) = Rumor::from_payload(&payload) else {
            // Not rumor JSON: the legacy plain-text path. Such senders
            // predate multi-relay delivery, so the envelope id is a usable
            // stand-in for the missing rumor id.
            trace!("payload is not a rumor, falling back to legacy text");
            let rumor_id = outer_event_id
                .as_ref()
                .map(|id| RumorId::from(id.as_str()))
                .unwrap_or_else(|| RumorId::new(TransactionId::new().as_str().to_owned()));

            let peer = self.inner.resolver.resolve_peer(&sender, &[]).await?;
            let chat = ChatId::Direct(peer);
            let content =
                ChatContent { text: payload, reply_to: None, expires_at: None };
            let timestamp = created_at.unwrap_or_else(unix_timestamp);

            if let Some(message) = self
                .inner
                .timeline
                .handle_incoming_chat(&chat, &sender, &rumor_id, content, outer_event_id, timestamp)
                .await?
            {
                self.clear_typing_for(&message);
            }
            return Ok(());
        };

        match rumor.group_id() {
            Some(group_id) => self.handle_group_rumor(group_id, rumor, outer_event_id).await,
            None => self.handle_direct_rumor(rumor, outer_event_id).await,
        }
    }

    async fn handle_direct_rumor(
        &self,
        rumor: Rumor,
        outer_event_id: Option<crate::identifiers::OuterEventId>,
    ) -> Result<()> {
        let peer = self.inner.resolver.resolve_peer(&rumor.pubkey, &rumor.peer_refs()).await?;
        let chat = ChatId::Direct(peer);

        match rumor.decode() {
            RumorKind::ChatText(content) => {
                if let Some(message) = self
                    .inner
                    .timeline
                    .handle_incoming_chat(
                        &chat,
                        &rumor.pubkey,
                        &rumor.id,
                        content,
                        outer_event_id,
                        rumor.created_at,
                    )
                    .await?
                {
                    self.clear_typing_for(&message);
                }
            }

            RumorKind::Receipt(receipt) => {
                self.inner.timeline.apply_receipt(&chat, &receipt).await;
            }

            RumorKind::Typing(content) => {
                self.inner.typing.handle_inbound(&chat, &rumor.pubkey, &content, rumor.created_at);
            }

            RumorKind::Reaction(reaction) => {
                self.inner
                    .timeline
                    .apply_inbound_reaction(&chat, &rumor.pubkey, &reaction.target, &reaction.key)
                    .await?;
            }

            RumorKind::GroupMetadata(_) | RumorKind::Unknown => {
                trace!(kind = rumor.kind, "ignoring rumor");
            }
        }

        Ok(())
    }

    async fn handle_group_rumor(
        &self,
        group_id: GroupId,
        rumor: Rumor,
        outer_event_id: Option<crate::identifiers::OuterEventId>,
    ) -> Result<()> {
        // Group rumors are deduplicated up front through the bounded
        // recency set; relays redeliver generously.
        if !self.inner.groups.note_seen(&rumor.id) {
            trace!(rumor_id = %rumor.id, "duplicate group rumor, ignoring");
            return Ok(());
        }

        if let RumorKind::GroupMetadata(metadata) = rumor.decode() {
            let flushed = self
                .inner
                .groups
                .handle_metadata(&group_id, &rumor.pubkey, metadata, rumor.created_at)
                .await?;

            for event in flushed {
                if let Err(err) =
                    self.route_group_content(&group_id, event.rumor, event.outer_event_id).await
                {
                    warn!("failed to replay pending group event: {err}");
                }
            }
            return Ok(());
        }

        if self.inner.store.group(&group_id).await?.is_none() {
            // The group is unknown so far; park the rumor until its
            // metadata shows up.
            trace!(group = %group_id, "parking rumor for unknown group");
            self.inner.groups.park(
                &group_id,
                PendingGroupEvent {
                    rumor,
                    received_at: unix_timestamp(),
                    outer_event_id,
                },
            );
            return Ok(());
        }

        self.route_group_content(&group_id, rumor, outer_event_id).await
    }

    /// Dispatch a non-metadata rumor of a known group.
    async fn route_group_content(
        &self,
        group_id: &GroupId,
        rumor: Rumor,
        outer_event_id: Option<crate::identifiers::OuterEventId>,
    ) -> Result<()> {
        let chat = ChatId::Group(group_id.clone());

        match rumor.decode() {
            RumorKind::ChatText(content) => {
                if let Some(message) = self
                    .inner
                    .timeline
                    .handle_incoming_chat(
                        &chat,
                        &rumor.pubkey,
                        &rumor.id,
                        content,
                        outer_event_id,
                        rumor.created_at,
                    )
                    .await?
                {
                    self.clear_typing_for(&message);
                }
            }

            RumorKind::Receipt(receipt) => {
                self.inner.timeline.apply_receipt(&chat, &receipt).await;
            }

            RumorKind::Typing(content) => {
                self.inner.typing.handle_inbound(&chat, &rumor.pubkey, &content, rumor.created_at);
            }

            RumorKind::Reaction(reaction) => {
                self.inner
                    .timeline
                    .apply_inbound_reaction(&chat, &rumor.pubkey, &reaction.target, &reaction.key)
                    .await?;
            }

            RumorKind::GroupMetadata(_) | RumorKind::Unknown => {
                trace!(kind = rumor.kind, "ignoring group rumor");
            }
        }

        Ok(())
    }

    fn clear_typing_for(&self, message: &TimelineMessage) {
        use crate::timeline::Direction;

        // Only a genuine peer message clears presence; our own echoes say
        // nothing about the peer's keyboard.
        if message.direction == Direction::Incoming {
            self.inner.typing.clear_on_message(&message.chat, message.timestamp);
        }
    }

    /// Shut the engine down: cancel all typing timers and stop the offline
    /// queue before the underlying resources go away.
    pub fn shutdown(&self) {
        debug!("shutting down the sync engine");
        self.inner.typing.shutdown();
        self.inner.send_queue.shutdown();
    }
}

fn is_retryable(error: &Error) -> bool {
    matches!(error, Error::Transport(err) if err.is_retryable())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches2::assert_matches;

    use super::SyncEngine;
    use crate::{
        config::SyncConfig,
        identifiers::{ChatId, GroupId, IdentityKey, OuterEventId, RumorId},
        rumor::{
            GroupMetadata, KIND_CHAT, KIND_GROUP_METADATA, KIND_REACTION, KIND_RECEIPT,
            KIND_TYPING, Rumor, Tag,
        },
        store::StateStore,
        test_utils::MockTransport,
        timeline::{DeliveryStatus, Direction},
        transport::DecryptedEnvelope,
        utils::unix_timestamp,
    };

    fn own() -> IdentityKey {
        IdentityKey::from("own")
    }

    fn alice() -> IdentityKey {
        IdentityKey::from("alice")
    }

    fn engine_with(config: SyncConfig) -> (SyncEngine, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let engine = SyncEngine::builder(own(), transport.clone()).config(config).build();
        (engine, transport)
    }

    fn engine() -> (SyncEngine, Arc<MockTransport>) {
        engine_with(SyncConfig::new())
    }

    fn chat_rumor(sender: &IdentityKey, id: &str, text: &str, tags: Vec<Tag>) -> Rumor {
        Rumor {
            id: RumorId::from(id),
            pubkey: sender.clone(),
            created_at: unix_timestamp(),
            kind: KIND_CHAT,
            tags,
            content: text.to_owned(),
        }
    }

    fn envelope(rumor: &Rumor, outer: Option<&str>) -> DecryptedEnvelope {
        DecryptedEnvelope {
            sender: rumor.pubkey.clone(),
            payload: serde_json::to_string(rumor).unwrap(),
            outer_event_id: outer.map(OuterEventId::from),
            created_at: Some(rumor.created_at),
        }
    }

    #[tokio::test]
    async fn test_redelivered_rumors_insert_exactly_one_message() {
        let (engine, _) = engine();
        let rumor = chat_rumor(&alice(), "r1", "hi there", vec![Tag::peer(&own())]);

        // Multi-relay delivery: same rumor, three different outer ids.
        for outer in ["outer-a", "outer-b", "outer-c"] {
            engine.handle_decrypted(envelope(&rumor, Some(outer))).await.unwrap();
        }

        let chat = ChatId::Direct(alice());
        let messages = engine.store().messages(&chat).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].rumor_id, Some(RumorId::from("r1")));
    }

    #[tokio::test]
    async fn test_self_echo_creates_no_duplicate_and_backfills_outer_id() {
        let (engine, _) = engine();
        let bob = IdentityKey::from("bob");

        // Our own rumor, synced from another device, without an outer id.
        let rumor = chat_rumor(&own(), "r-self", "from my phone", vec![Tag::peer(&bob)]);
        engine.handle_decrypted(envelope(&rumor, None)).await.unwrap();

        let chat = ChatId::Direct(bob.clone());
        let messages = engine.store().messages(&chat).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].direction, Direction::Outgoing);
        assert_eq!(messages[0].status, DeliveryStatus::Sent);
        assert_eq!(messages[0].outer_event_id, None);

        // The second device's copy carries the transport id.
        engine.handle_decrypted(envelope(&rumor, Some("outer-9"))).await.unwrap();

        let messages = engine.store().messages(&chat).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].outer_event_id, Some(OuterEventId::from("outer-9")));
    }

    #[tokio::test]
    async fn test_expired_inbound_messages_are_never_surfaced() {
        let (engine, _) = engine();

        let mut rumor = chat_rumor(&alice(), "r1", "too late", vec![Tag::peer(&own())]);
        rumor.tags.push(Tag::expiration(1));

        engine.handle_decrypted(envelope(&rumor, None)).await.unwrap();

        let chat = ChatId::Direct(alice());
        assert!(engine.store().messages(&chat).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_receipts_advance_status_and_never_regress() {
        let (engine, _) = engine();
        let chat = ChatId::Direct(alice());

        let sent = engine.send_message(&chat, "hello", None).await.unwrap();
        let rumor_id = sent.rumor_id.clone().unwrap();

        let mut seen = Rumor {
            id: RumorId::from("receipt-1"),
            pubkey: alice(),
            created_at: unix_timestamp(),
            kind: KIND_RECEIPT,
            tags: vec![Tag::event(&rumor_id, None)],
            content: "seen".to_owned(),
        };
        engine.handle_decrypted(envelope(&seen, None)).await.unwrap();

        let message = &engine.store().messages(&chat).await.unwrap()[0];
        assert_eq!(message.status, DeliveryStatus::Seen);

        // A replayed "delivered" receipt must not walk the status back.
        seen.id = RumorId::from("receipt-2");
        seen.content = "delivered".to_owned();
        engine.handle_decrypted(envelope(&seen, None)).await.unwrap();

        let message = &engine.store().messages(&chat).await.unwrap()[0];
        assert_eq!(message.status, DeliveryStatus::Seen);
    }

    #[tokio::test]
    async fn test_genuine_inbound_messages_get_a_delivery_receipt() {
        let (engine, transport) = engine();

        let rumor = chat_rumor(&alice(), "r1", "hi", vec![Tag::peer(&own())]);
        engine.handle_decrypted(envelope(&rumor, None)).await.unwrap();

        let receipts = transport.receipts();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].0, alice());
        assert_eq!(receipts[0].2, vec![RumorId::from("r1")]);

        // A self-echo is not "received from a peer": no receipt.
        let echo = chat_rumor(&own(), "r2", "mine", vec![Tag::peer(&alice())]);
        engine.handle_decrypted(envelope(&echo, None)).await.unwrap();
        assert_eq!(transport.receipts().len(), 1);
    }

    #[tokio::test]
    async fn test_auto_receipts_can_be_disabled() {
        let (engine, transport) = engine_with(SyncConfig::new().disable_auto_receipts());

        let rumor = chat_rumor(&alice(), "r1", "hi", vec![Tag::peer(&own())]);
        engine.handle_decrypted(envelope(&rumor, None)).await.unwrap();

        assert!(transport.receipts().is_empty());
    }

    #[tokio::test]
    async fn test_reactions_keep_one_emoji_per_identity() {
        let (engine, _) = engine();
        let chat = ChatId::Direct(alice());

        let message = chat_rumor(&alice(), "msg", "react to me", vec![Tag::peer(&own())]);
        engine.handle_decrypted(envelope(&message, None)).await.unwrap();

        let mut reaction = Rumor {
            id: RumorId::from("reaction-1"),
            pubkey: alice(),
            created_at: unix_timestamp(),
            kind: KIND_REACTION,
            tags: vec![Tag::event(&RumorId::from("msg"), None)],
            content: "👍".to_owned(),
        };
        engine.handle_decrypted(envelope(&reaction, None)).await.unwrap();

        // The same identity switches to a different emoji.
        reaction.id = RumorId::from("reaction-2");
        reaction.content = "❤️".to_owned();
        engine.handle_decrypted(envelope(&reaction, None)).await.unwrap();

        let stored = &engine.store().messages(&chat).await.unwrap()[0];
        assert!(!stored.reactions.contains_key("👍"));
        assert_eq!(stored.reactions["❤️"], vec![alice()]);
    }

    #[tokio::test]
    async fn test_legacy_plain_text_still_lands_in_the_timeline() {
        let (engine, _) = engine();

        engine
            .handle_decrypted(DecryptedEnvelope {
                sender: alice(),
                payload: "just plain text".to_owned(),
                outer_event_id: Some(OuterEventId::from("legacy-outer")),
                created_at: Some(1_700_000_000),
            })
            .await
            .unwrap();

        let chat = ChatId::Direct(alice());
        let messages = engine.store().messages(&chat).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "just plain text");
        assert_eq!(messages[0].rumor_id, Some(RumorId::from("legacy-outer")));
    }

    #[tokio::test]
    async fn test_group_rumors_wait_for_their_metadata() {
        let (engine, _) = engine();
        let group_id = GroupId::from("g1");
        let chat = ChatId::Group(group_id.clone());

        // A chat message outruns the group's metadata: parked, not dropped.
        let message = chat_rumor(&alice(), "g-msg", "early bird", vec![Tag::group(&group_id)]);
        engine.handle_decrypted(envelope(&message, None)).await.unwrap();
        assert!(engine.store().messages(&chat).await.unwrap().is_empty());

        // Metadata arrives; the parked message is replayed.
        let metadata = GroupMetadata {
            name: Some("late group".to_owned()),
            members: vec![alice(), own()],
            admins: vec![alice()],
            secret: Some("s".to_owned()),
            ..Default::default()
        };
        let metadata_rumor = Rumor {
            id: RumorId::from("g-meta"),
            pubkey: alice(),
            created_at: unix_timestamp(),
            kind: KIND_GROUP_METADATA,
            tags: vec![Tag::group(&group_id)],
            content: serde_json::to_string(&metadata).unwrap(),
        };
        engine.handle_decrypted(envelope(&metadata_rumor, None)).await.unwrap();

        let group = engine.store().group(&group_id).await.unwrap().unwrap();
        assert_eq!(group.name.as_deref(), Some("late group"));

        let messages = engine.store().messages(&chat).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "early bird");

        // A relay redelivering the original rumor hits the recency set.
        engine.handle_decrypted(envelope(&message, Some("other-relay"))).await.unwrap();
        assert_eq!(engine.store().messages(&chat).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_typing_is_only_cleared_by_messages_that_are_not_older() {
        let (engine, _) = engine();
        let chat = ChatId::Direct(alice());

        let now = unix_timestamp();
        let typing = Rumor {
            id: RumorId::from("typ-1"),
            pubkey: alice(),
            created_at: now,
            kind: KIND_TYPING,
            tags: vec![Tag::peer(&own()), Tag::expiration(now + 600)],
            content: "typing".to_owned(),
        };
        engine.handle_decrypted(envelope(&typing, None)).await.unwrap();
        assert!(engine.typing().is_typing(&chat));

        // A replayed message from before the typing signal: presence stays.
        let mut old_message = chat_rumor(&alice(), "old", "replayed", vec![Tag::peer(&own())]);
        old_message.created_at = now - 30;
        engine.handle_decrypted(envelope(&old_message, None)).await.unwrap();
        assert!(engine.typing().is_typing(&chat));

        // A current message clears it.
        let fresh = chat_rumor(&alice(), "fresh", "here", vec![Tag::peer(&own())]);
        engine.handle_decrypted(envelope(&fresh, None)).await.unwrap();
        assert!(!engine.typing().is_typing(&chat));
    }

    /// Delegates to a [`MemoryStore`], but conversation lookups for one
    /// poisoned peer fail. Lets the tests drive a handler error mid-stream.
    #[derive(Debug)]
    struct PoisonedStore {
        inner: crate::store::MemoryStore,
        poisoned: IdentityKey,
    }

    #[async_trait::async_trait]
    impl StateStore for PoisonedStore {
        async fn conversation(
            &self,
            peer: &IdentityKey,
        ) -> crate::store::Result<Option<crate::store::Conversation>> {
            if *peer == self.poisoned {
                return Err(crate::store::StoreError::Backend("poisoned row".into()));
            }
            self.inner.conversation(peer).await
        }

        async fn conversations(&self) -> crate::store::Result<Vec<crate::store::Conversation>> {
            self.inner.conversations().await
        }

        async fn upsert_conversation(
            &self,
            conversation: crate::store::Conversation,
        ) -> crate::store::Result<()> {
            self.inner.upsert_conversation(conversation).await
        }

        async fn group(
            &self,
            group_id: &GroupId,
        ) -> crate::store::Result<Option<crate::store::Group>> {
            self.inner.group(group_id).await
        }

        async fn groups(&self) -> crate::store::Result<Vec<crate::store::Group>> {
            self.inner.groups().await
        }

        async fn upsert_group(&self, group: crate::store::Group) -> crate::store::Result<()> {
            self.inner.upsert_group(group).await
        }

        async fn remove_group(&self, group_id: &GroupId) -> crate::store::Result<()> {
            self.inner.remove_group(group_id).await
        }

        async fn message_by_rumor_id(
            &self,
            chat: &ChatId,
            rumor_id: &RumorId,
        ) -> crate::store::Result<Option<crate::timeline::TimelineMessage>> {
            self.inner.message_by_rumor_id(chat, rumor_id).await
        }

        async fn message_by_transaction_id(
            &self,
            chat: &ChatId,
            transaction_id: &crate::identifiers::TransactionId,
        ) -> crate::store::Result<Option<crate::timeline::TimelineMessage>> {
            self.inner.message_by_transaction_id(chat, transaction_id).await
        }

        async fn messages(
            &self,
            chat: &ChatId,
        ) -> crate::store::Result<Vec<crate::timeline::TimelineMessage>> {
            self.inner.messages(chat).await
        }

        async fn save_message(
            &self,
            message: crate::timeline::TimelineMessage,
        ) -> crate::store::Result<()> {
            self.inner.save_message(message).await
        }

        async fn remove_message(
            &self,
            chat: &ChatId,
            transaction_id: &crate::identifiers::TransactionId,
        ) -> crate::store::Result<()> {
            self.inner.remove_message(chat, transaction_id).await
        }

        async fn remove_expired_messages(&self, now: u64) -> crate::store::Result<Vec<ChatId>> {
            self.inner.remove_expired_messages(now).await
        }

        async fn save_queued_send(
            &self,
            entry: crate::store::QueuedSend,
        ) -> crate::store::Result<()> {
            self.inner.save_queued_send(entry).await
        }

        async fn queued_sends(&self) -> crate::store::Result<Vec<crate::store::QueuedSend>> {
            self.inner.queued_sends().await
        }

        async fn update_queued_send_attempt(
            &self,
            transaction_id: &crate::identifiers::TransactionId,
            attempts: u8,
            last_attempt_at: u64,
        ) -> crate::store::Result<()> {
            self.inner.update_queued_send_attempt(transaction_id, attempts, last_attempt_at).await
        }

        async fn remove_queued_send(
            &self,
            transaction_id: &crate::identifiers::TransactionId,
        ) -> crate::store::Result<()> {
            self.inner.remove_queued_send(transaction_id).await
        }
    }

    #[tokio::test]
    async fn test_a_failing_event_does_not_stop_the_stream() {
        let transport = Arc::new(MockTransport::new());
        let evil = IdentityKey::from("evil");
        let store = Arc::new(PoisonedStore {
            inner: crate::store::MemoryStore::new(),
            poisoned: evil.clone(),
        });
        let engine =
            SyncEngine::builder(own(), transport).store(store).build();

        let stream = futures_util::stream::iter(vec![
            envelope(&chat_rumor(&evil, "bad", "kaboom", vec![Tag::peer(&own())]), None),
            envelope(&chat_rumor(&alice(), "ok", "still alive", vec![Tag::peer(&own())]), None),
        ]);

        // The first envelope fails on the poisoned store row; the second
        // must still be processed.
        engine.run(stream).await;

        let chat = ChatId::Direct(alice());
        let messages = engine.store().messages(&chat).await.unwrap();
        assert_matches!(messages.as_slice(), [message]);
        assert_eq!(message.text, "still alive");
    }

    #[tokio::test]
    async fn test_unknown_kinds_are_noops() {
        let (engine, _) = engine();

        let mut rumor = chat_rumor(&alice(), "weird", "???", vec![Tag::peer(&own())]);
        rumor.kind = 31337;

        engine.handle_decrypted(envelope(&rumor, None)).await.unwrap();

        let chat = ChatId::Direct(alice());
        assert!(engine.store().messages(&chat).await.unwrap().is_empty());
    }
}
