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

//! Resolution of the logical conversation peer for an inbound rumor.
//!
//! Which conversation an inbound rumor belongs to is not simply "the
//! sender": our own outgoing rumors are echoed back to us by our other
//! devices, and a peer's key context can change while the tagged
//! references still point at the conversation we already track.

use tracing::trace;

use crate::{
    identifiers::IdentityKey,
    store::{DynStateStore, Result, StateStore as _},
};

/// Resolves the logical peer of inbound pairwise rumors.
#[derive(Clone, Debug)]
pub struct IdentityResolver {
    own_key: IdentityKey,
    store: DynStateStore,
}

impl IdentityResolver {
    pub(crate) fn new(own_key: IdentityKey, store: DynStateStore) -> Self {
        Self { own_key, store }
    }

    /// Whether the rumor was authored by (a device of) the local owner.
    pub fn is_self(&self, sender: &IdentityKey) -> bool {
        *sender == self.own_key
    }

    /// Determine the conversation peer for a rumor from `sender` carrying
    /// the given peer reference tags.
    ///
    /// For a self-echo the partner is whoever we addressed, so tagged
    /// peers are preferred over the sender; for anything else the sender
    /// comes first. Among the candidates, one that already maps to an
    /// existing conversation wins, so a key-context change doesn't split
    /// one logical peer across two records.
    pub async fn resolve_peer(
        &self,
        sender: &IdentityKey,
        peer_refs: &[IdentityKey],
    ) -> Result<IdentityKey> {
        let tagged: Vec<&IdentityKey> =
            peer_refs.iter().filter(|key| **key != self.own_key).collect();

        let mut candidates: Vec<IdentityKey> = Vec::new();
        if self.is_self(sender) {
            candidates.extend(tagged.iter().map(|key| (*key).clone()));
            // All participants are us: a note-to-self conversation.
            candidates.push(self.own_key.clone());
        } else {
            candidates.push(sender.clone());
            candidates.extend(
                tagged.iter().filter(|key| ***key != *sender).map(|key| (*key).clone()),
            );
        }

        for candidate in &candidates {
            if self.store.conversation(candidate).await?.is_some() {
                trace!(peer = %candidate, "resolved rumor to existing conversation");
                return Ok(candidate.clone());
            }
        }

        // No candidate is known yet; the first one starts the conversation.
        Ok(candidates.into_iter().next().unwrap_or_else(|| sender.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::IdentityResolver;
    use crate::{
        identifiers::IdentityKey,
        store::{Conversation, MemoryStore, StateStore},
    };

    fn resolver_with_store() -> (IdentityResolver, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (IdentityResolver::new(IdentityKey::from("own"), store.clone()), store)
    }

    #[tokio::test]
    async fn test_peer_message_resolves_to_the_sender() {
        let (resolver, _) = resolver_with_store();

        let peer = resolver
            .resolve_peer(&IdentityKey::from("alice"), &[IdentityKey::from("own")])
            .await
            .unwrap();

        assert_eq!(peer, IdentityKey::from("alice"));
    }

    #[tokio::test]
    async fn test_self_echo_resolves_to_the_tagged_peer() {
        let (resolver, _) = resolver_with_store();

        // Our own rumor, echoed back by another device of ours.
        let peer = resolver
            .resolve_peer(&IdentityKey::from("own"), &[IdentityKey::from("bob")])
            .await
            .unwrap();

        assert_eq!(peer, IdentityKey::from("bob"));
    }

    #[tokio::test]
    async fn test_self_addressed_echo_is_a_note_to_self() {
        let (resolver, _) = resolver_with_store();

        let peer = resolver
            .resolve_peer(&IdentityKey::from("own"), &[IdentityKey::from("own")])
            .await
            .unwrap();

        assert_eq!(peer, IdentityKey::from("own"));
    }

    #[tokio::test]
    async fn test_existing_conversation_wins_over_a_new_sender_key() {
        let (resolver, store) = resolver_with_store();

        store
            .upsert_conversation(Conversation::new(IdentityKey::from("old-key"), 1, false))
            .await
            .unwrap();

        // The peer switched key context but still tags the conversation we
        // already track; don't split the logical peer in two.
        let peer = resolver
            .resolve_peer(&IdentityKey::from("new-key"), &[IdentityKey::from("old-key")])
            .await
            .unwrap();

        assert_eq!(peer, IdentityKey::from("old-key"));
    }
}
