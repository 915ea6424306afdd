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

//! The timeline store: durable per-conversation state.
//!
//! The SDK ships the [`StateStore`] trait plus an in-memory implementation
//! used as the default and by the test-suites. Persistent backends live
//! outside this crate and only need to implement the trait.
//!
//! Writes issued by the engine are best-effort: in-memory state is updated
//! and broadcast before the store write completes, and a failing write is
//! logged and swallowed so the reactive surface never stalls on storage.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identifiers::{ChatId, GroupId, IdentityKey, RumorId, TransactionId};

mod memory_store;
mod traits;

pub use memory_store::MemoryStore;
pub use traits::{DynStateStore, StateStore};

/// Store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// An error happened in the underlying database backend.
    #[error("the database returned an error: {0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),

    /// An error happened while serializing or deserializing a record.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Preview of the newest message in a conversation or group, denormalized
/// for the conversation list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    pub preview: String,
    pub at: u64,
}

/// A pairwise conversation record.
///
/// There is at most one conversation per distinct peer identity key;
/// [`StateStore::upsert_conversation`] callers go through the engine's
/// idempotent ensure path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub peer: IdentityKey,
    pub created_at: u64,
    /// Whether the local user initiated this conversation.
    pub initiated_by_us: bool,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub unread_count: u64,
    /// Per-conversation message time-to-live, in seconds. Outgoing messages
    /// get an absolute expiration of send-time plus this value.
    #[serde(default)]
    pub message_ttl: Option<u64>,
}

impl Conversation {
    pub fn new(peer: IdentityKey, created_at: u64, initiated_by_us: bool) -> Self {
        Self {
            peer,
            created_at,
            initiated_by_us,
            last_message: None,
            unread_count: 0,
            message_ttl: None,
        }
    }

    pub fn chat_id(&self) -> ChatId {
        ChatId::Direct(self.peer.clone())
    }
}

/// A group conversation record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub about: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
    pub members: Vec<IdentityKey>,
    pub admins: Vec<IdentityKey>,
    pub created_at: u64,
    /// Shared secret for the group's key distribution. Rotated whenever a
    /// member is removed.
    #[serde(default)]
    pub secret: Option<String>,
    /// Whether the local user has confirmed the invitation to this group.
    #[serde(default)]
    pub accepted: bool,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub unread_count: u64,
    #[serde(default)]
    pub message_ttl: Option<u64>,
}

impl Group {
    pub fn is_member(&self, key: &IdentityKey) -> bool {
        self.members.contains(key)
    }

    pub fn is_admin(&self, key: &IdentityKey) -> bool {
        self.admins.contains(key)
    }

    pub fn chat_id(&self) -> ChatId {
        ChatId::Group(self.id.clone())
    }
}

/// A send that couldn't reach the event bus, persisted so it survives a
/// process restart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedSend {
    /// Transaction id of the optimistic local echo this send belongs to.
    pub transaction_id: TransactionId,
    pub chat: ChatId,
    pub text: String,
    #[serde(default)]
    pub reply_to: Option<RumorId>,
    pub created_at: u64,
    /// How many delivery attempts were made so far.
    #[serde(default)]
    pub attempts: u8,
    #[serde(default)]
    pub last_attempt_at: Option<u64>,
}
