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

//! Identifier newtypes used throughout the SDK.
//!
//! Two distinct ids exist for every message: the *rumor id* is the stable,
//! content-derived identifier of the decrypted payload, while the *outer
//! event id* is the transport envelope's id and can differ between relays
//! for the same rumor. Deduplication and receipt correlation always use the
//! rumor id.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[doc = $doc:expr])* $name:ident) => {
        $(#[doc = $doc])*
        #[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id! {
    /// The hex-encoded public key identifying a peer (or ourselves).
    IdentityKey
}

string_id! {
    /// Identifier of a group conversation.
    GroupId
}

string_id! {
    /// The stable, content-derived id of a decrypted rumor.
    RumorId
}

string_id! {
    /// The transport-level envelope id. Varies across relays for the same
    /// rumor, so it is never used for deduplication.
    OuterEventId
}

/// The scope a message belongs to: a pairwise conversation, addressed by
/// the peer's identity key, or a group.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ChatId {
    Direct(IdentityKey),
    Group(GroupId),
}

impl ChatId {
    /// The peer key, for pairwise conversations.
    pub fn as_direct(&self) -> Option<&IdentityKey> {
        match self {
            ChatId::Direct(key) => Some(key),
            ChatId::Group(_) => None,
        }
    }

    /// The group id, for group conversations.
    pub fn as_group(&self) -> Option<&GroupId> {
        match self {
            ChatId::Direct(_) => None,
            ChatId::Group(id) => Some(id),
        }
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatId::Direct(key) => write!(f, "direct:{key}"),
            ChatId::Group(id) => write!(f, "group:{id}"),
        }
    }
}

impl From<IdentityKey> for ChatId {
    fn from(key: IdentityKey) -> Self {
        ChatId::Direct(key)
    }
}

impl From<GroupId> for ChatId {
    fn from(id: GroupId) -> Self {
        ChatId::Group(id)
    }
}

/// A locally generated id tying an optimistic local echo to the rumor the
/// transport eventually derives from it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    /// Creates a random transaction id.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}
