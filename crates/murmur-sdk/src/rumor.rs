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

//! Parsing of decrypted payloads into typed protocol events.
//!
//! A *rumor* is the decrypted, protocol-level event carried inside the
//! encrypted transport envelope. Rumors dispatch over an integer kind code;
//! a code this SDK doesn't recognize decodes to [`RumorKind::Unknown`] and
//! is a no-op for the engine, never an error.

use serde::{Deserialize, Serialize};

use crate::identifiers::{GroupId, IdentityKey, RumorId};

/// Kind code of a plain chat text message.
pub const KIND_CHAT: u32 = 14;
/// Kind code of a delivery/read receipt.
pub const KIND_RECEIPT: u32 = 15;
/// Kind code of an emoji reaction.
pub const KIND_REACTION: u32 = 7;
/// Kind code of a typing notification.
pub const KIND_TYPING: u32 = 25;
/// Kind code of a group metadata event.
pub const KIND_GROUP_METADATA: u32 = 41;

/// Content keyword meaning "typing has stopped" in a typing rumor.
pub const TYPING_STOP: &str = "stop";

/// A single tag on a rumor: a non-empty array of strings, the first being
/// the tag name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// A `p` tag referencing a peer.
    pub fn peer(key: &IdentityKey) -> Self {
        Self(vec!["p".to_owned(), key.as_str().to_owned()])
    }

    /// An `e` tag referencing another rumor, with an optional marker in
    /// fourth position (the second holds a relay hint we don't use).
    pub fn event(id: &RumorId, marker: Option<&str>) -> Self {
        let mut values = vec!["e".to_owned(), id.as_str().to_owned()];
        if let Some(marker) = marker {
            values.push(String::new());
            values.push(marker.to_owned());
        }
        Self(values)
    }

    /// An `expiration` tag carrying an absolute unix timestamp in seconds.
    pub fn expiration(at: u64) -> Self {
        Self(vec!["expiration".to_owned(), at.to_string()])
    }

    /// An `h` tag scoping a rumor to a group.
    pub fn group(id: &GroupId) -> Self {
        Self(vec!["h".to_owned(), id.as_str().to_owned()])
    }

    fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    fn marker(&self) -> Option<&str> {
        self.0.get(3).map(String::as_str)
    }
}

/// A decrypted protocol event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rumor {
    /// Content-derived id, stable across relays.
    pub id: RumorId,
    /// Sender's identity key.
    pub pubkey: IdentityKey,
    /// Sender-claimed creation time, unix seconds.
    pub created_at: u64,
    /// Integer kind code.
    pub kind: u32,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub content: String,
}

impl Rumor {
    /// Try to parse a decrypted payload as a structured rumor.
    ///
    /// Returns `None` when the payload isn't valid rumor JSON; the caller
    /// falls back to the legacy plain-text path in that case.
    pub fn from_payload(payload: &str) -> Option<Self> {
        serde_json::from_str(payload).ok()
    }

    fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags.iter().filter(move |t| t.name() == Some(name)).filter_map(Tag::value)
    }

    /// All peers referenced by `p` tags.
    pub fn peer_refs(&self) -> Vec<IdentityKey> {
        self.tag_values("p").map(IdentityKey::from).collect()
    }

    /// All rumors referenced by `e` tags, with their markers.
    pub fn event_refs(&self) -> Vec<(RumorId, Option<&str>)> {
        self.tags
            .iter()
            .filter(|t| t.name() == Some("e"))
            .filter_map(|t| t.value().map(|v| (RumorId::from(v), t.marker())))
            .collect()
    }

    /// The rumor this one replies to.
    ///
    /// The target is the reference explicitly marked `reply`. When no
    /// marker is present we fall back to the first generic reference, to
    /// interoperate with senders that omit the marker.
    pub fn reply_target(&self) -> Option<RumorId> {
        let refs = self.event_refs();
        refs.iter()
            .find(|(_, marker)| *marker == Some("reply"))
            .or_else(|| refs.iter().find(|(_, marker)| marker.is_none()))
            .map(|(id, _)| id.clone())
    }

    /// The absolute expiration timestamp carried by an `expiration` tag.
    pub fn expiration(&self) -> Option<u64> {
        self.tag_values("expiration").find_map(|v| v.parse().ok())
    }

    /// The group this rumor is scoped to, if any.
    pub fn group_id(&self) -> Option<GroupId> {
        self.tag_values("h").next().map(GroupId::from)
    }

    /// Decode this rumor into its typed representation.
    pub fn decode(&self) -> RumorKind {
        match self.kind {
            KIND_CHAT => {
                // Old clients sent reactions as JSON embedded in a chat
                // rumor; keep accepting those.
                if let Some(reaction) = LegacyReaction::parse(&self.content) {
                    return RumorKind::Reaction(ReactionContent {
                        target: reaction.target,
                        key: reaction.key,
                    });
                }

                RumorKind::ChatText(ChatContent {
                    text: self.content.clone(),
                    reply_to: self.reply_target(),
                    expires_at: self.expiration(),
                })
            }

            KIND_RECEIPT => {
                let status = match self.content.as_str() {
                    "delivered" => ReceiptStatus::Delivered,
                    "seen" => ReceiptStatus::Seen,
                    _ => return RumorKind::Unknown,
                };
                let rumor_ids = self.event_refs().into_iter().map(|(id, _)| id).collect();
                RumorKind::Receipt(ReceiptContent { status, rumor_ids })
            }

            KIND_TYPING => {
                // Anything that doesn't positively say "typing" means stop:
                // the explicit keyword, empty content, or arbitrary falsy
                // junk from older clients.
                let active = !self.content.is_empty() && self.content != TYPING_STOP;
                RumorKind::Typing(TypingContent { active, expires_at: self.expiration() })
            }

            KIND_REACTION => {
                // The target is the last referenced rumor.
                match self.event_refs().pop() {
                    Some((target, _)) => RumorKind::Reaction(ReactionContent {
                        target,
                        key: self.content.clone(),
                    }),
                    None => RumorKind::Unknown,
                }
            }

            KIND_GROUP_METADATA => match serde_json::from_str(&self.content) {
                Ok(meta) => RumorKind::GroupMetadata(meta),
                Err(_) => RumorKind::Unknown,
            },

            _ => RumorKind::Unknown,
        }
    }
}

/// Typed representation of a rumor, dispatching on its kind code.
#[derive(Clone, Debug, PartialEq)]
pub enum RumorKind {
    ChatText(ChatContent),
    Receipt(ReceiptContent),
    Typing(TypingContent),
    Reaction(ReactionContent),
    GroupMetadata(GroupMetadata),
    /// A kind code this SDK doesn't know. Handled as a no-op.
    Unknown,
}

/// A chat text message.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatContent {
    pub text: String,
    pub reply_to: Option<RumorId>,
    /// Absolute expiration in unix seconds, if the message is ephemeral.
    pub expires_at: Option<u64>,
}

/// Which status a receipt advances its referenced messages to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiptStatus {
    Delivered,
    Seen,
}

impl ReceiptStatus {
    /// The wire representation, used as receipt rumor content.
    pub fn as_str(self) -> &'static str {
        match self {
            ReceiptStatus::Delivered => "delivered",
            ReceiptStatus::Seen => "seen",
        }
    }
}

/// A delivery/read receipt for one or more rumors.
#[derive(Clone, Debug, PartialEq)]
pub struct ReceiptContent {
    pub status: ReceiptStatus,
    pub rumor_ids: Vec<RumorId>,
}

/// A typing notification.
#[derive(Clone, Debug, PartialEq)]
pub struct TypingContent {
    pub active: bool,
    /// Stop signals are tagged with an expiration; a start signal whose
    /// expiration already elapsed is treated as a stop by the presence
    /// manager.
    pub expires_at: Option<u64>,
}

/// An emoji reaction to a message.
#[derive(Clone, Debug, PartialEq)]
pub struct ReactionContent {
    pub target: RumorId,
    pub key: String,
}

/// Group metadata carried as JSON in the rumor content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub about: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
    #[serde(default)]
    pub members: Vec<IdentityKey>,
    #[serde(default)]
    pub admins: Vec<IdentityKey>,
    /// Shared group secret; omitted in the notice sent to a removed member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default)]
    pub created_at: Option<u64>,
}

/// The legacy JSON-in-text reaction shape.
#[derive(Deserialize)]
struct LegacyReaction {
    #[serde(rename = "type")]
    kind: String,
    target: RumorId,
    key: String,
}

impl LegacyReaction {
    fn parse(content: &str) -> Option<Self> {
        if !content.starts_with('{') {
            return None;
        }
        serde_json::from_str::<LegacyReaction>(content).ok().filter(|r| r.kind == "reaction")
    }
}
