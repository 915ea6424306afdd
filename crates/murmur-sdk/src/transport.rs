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

//! The seam towards the transport crypto provider.
//!
//! Session establishment, ratcheting and envelope encryption live in an
//! external, already-hardened native library. This SDK only consumes its
//! send primitives and its stream of decrypted envelopes; everything behind
//! [`Transport`] is opaque.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    identifiers::{GroupId, IdentityKey, OuterEventId, RumorId},
    rumor::{GroupMetadata, ReceiptStatus, Tag},
    store::Group,
};

/// Errors reported by the transport crypto provider.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The event bus could not be reached. Retryable; failed sends land in
    /// the offline queue.
    #[error("the event bus is unreachable")]
    Unreachable,

    /// No cryptographic session with the recipient has been established
    /// yet. Retryable after backoff.
    #[error("no established session with `{0}`")]
    SessionNotReady(IdentityKey),

    /// The provider failed to encrypt the payload. Not retryable.
    #[error("encryption failed: {0}")]
    Encryption(String),
}

impl TransportError {
    /// Whether retrying the same send later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Unreachable | TransportError::SessionNotReady(_))
    }
}

/// The ids resulting from handing a rumor to the transport: the stable
/// inner id and the envelope ids the relays got to see.
#[derive(Clone, Debug, PartialEq)]
pub struct SentRumor {
    pub rumor_id: RumorId,
    pub outer_event_ids: Vec<OuterEventId>,
}

/// A decrypted envelope as delivered by the transport's event stream.
#[derive(Clone, Debug)]
pub struct DecryptedEnvelope {
    /// Identity key of the envelope's sender.
    pub sender: IdentityKey,
    /// The decrypted payload, normally rumor JSON.
    pub payload: String,
    /// Transport-level id of the envelope this payload arrived in.
    pub outer_event_id: Option<OuterEventId>,
    /// Envelope creation time as claimed by the relay, unix seconds.
    pub created_at: Option<u64>,
}

/// Send primitives of the transport crypto provider.
#[async_trait]
pub trait Transport: fmt::Debug + Send + Sync {
    /// Encrypt a chat message for `recipient` and publish it.
    async fn send_chat(
        &self,
        recipient: &IdentityKey,
        content: &str,
        tags: Vec<Tag>,
    ) -> Result<SentRumor, TransportError>;

    /// Send a delivery/read receipt for the referenced rumors.
    async fn send_receipt(
        &self,
        recipient: &IdentityKey,
        status: ReceiptStatus,
        rumor_ids: Vec<RumorId>,
    ) -> Result<(), TransportError>;

    /// Send a typing signal. Stop signals carry an `expires_at` so stale
    /// replays are recognizable on the receiving side.
    async fn send_typing(
        &self,
        recipient: &IdentityKey,
        active: bool,
        expires_at: Option<u64>,
    ) -> Result<(), TransportError>;

    /// Send an emoji reaction to a previously received rumor.
    async fn send_reaction(
        &self,
        recipient: &IdentityKey,
        target: &RumorId,
        key: &str,
    ) -> Result<SentRumor, TransportError>;

    /// Synchronize the provider's membership and key-distribution state
    /// with the local group record. Called before every outbound group
    /// send.
    async fn group_upsert(&self, group: &Group) -> Result<(), TransportError>;

    /// Encrypt a chat message for all current group members and publish it.
    async fn group_send_chat(
        &self,
        group_id: &GroupId,
        content: &str,
        tags: Vec<Tag>,
    ) -> Result<SentRumor, TransportError>;

    /// Send a typing signal into a group.
    async fn group_send_typing(
        &self,
        group_id: &GroupId,
        active: bool,
        expires_at: Option<u64>,
    ) -> Result<(), TransportError>;

    /// Send an emoji reaction into a group.
    async fn group_send_reaction(
        &self,
        group_id: &GroupId,
        target: &RumorId,
        key: &str,
    ) -> Result<SentRumor, TransportError>;

    /// Push a metadata payload to an explicit set of recipients.
    ///
    /// Used both for regular metadata updates and for the secret-less
    /// notice sent to a removed member.
    async fn group_send_metadata(
        &self,
        group_id: &GroupId,
        recipients: &[IdentityKey],
        metadata: &GroupMetadata,
    ) -> Result<(), TransportError>;
}

/// Shareable, type-erased transport.
pub type DynTransport = Arc<dyn Transport>;
