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

//! Test helpers for the crate's unit tests.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::{
    identifiers::{GroupId, IdentityKey, OuterEventId, RumorId},
    rumor::{GroupMetadata, ReceiptStatus, Tag},
    store::Group,
    transport::{SentRumor, Transport, TransportError},
};

/// A recorded outbound chat message.
#[derive(Clone, Debug)]
pub(crate) struct SentChat {
    pub recipient: String,
    pub content: String,
    pub tags: Vec<Tag>,
    pub rumor_id: RumorId,
}

/// A recorded metadata push.
#[derive(Clone, Debug)]
pub(crate) struct MetadataPush {
    pub recipients: Vec<IdentityKey>,
    pub metadata: GroupMetadata,
}

#[derive(Debug, Default)]
struct MockState {
    online: bool,
    counter: u64,
    chats: Vec<SentChat>,
    receipts: Vec<(IdentityKey, ReceiptStatus, Vec<RumorId>)>,
    typing_signals: u64,
    reactions: Vec<(String, RumorId, String)>,
    upserts: Vec<Group>,
    metadata_pushes: Vec<MetadataPush>,
}

/// A scripted transport crypto provider: records every primitive call and
/// fails sends while "offline".
#[derive(Debug)]
pub(crate) struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self { state: Mutex::new(MockState { online: true, ..Default::default() }) }
    }

    pub fn offline() -> Self {
        Self { state: Mutex::new(MockState::default()) }
    }

    pub fn set_online(&self, online: bool) {
        self.state.lock().unwrap().online = online;
    }

    fn next_sent(state: &mut MockState) -> SentRumor {
        state.counter += 1;
        SentRumor {
            rumor_id: RumorId::new(format!("rumor-{}", state.counter)),
            outer_event_ids: vec![OuterEventId::new(format!("outer-{}", state.counter))],
        }
    }

    fn guard_online(state: &MockState) -> Result<(), TransportError> {
        if state.online { Ok(()) } else { Err(TransportError::Unreachable) }
    }

    pub fn sent_chats(&self) -> Vec<SentChat> {
        self.state.lock().unwrap().chats.clone()
    }

    pub fn receipts(&self) -> Vec<(IdentityKey, ReceiptStatus, Vec<RumorId>)> {
        self.state.lock().unwrap().receipts.clone()
    }

    pub fn typing_signals(&self) -> u64 {
        self.state.lock().unwrap().typing_signals
    }

    pub fn reactions(&self) -> Vec<(String, RumorId, String)> {
        self.state.lock().unwrap().reactions.clone()
    }

    pub fn upserts(&self) -> Vec<Group> {
        self.state.lock().unwrap().upserts.clone()
    }

    pub fn metadata_pushes(&self) -> Vec<MetadataPush> {
        self.state.lock().unwrap().metadata_pushes.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_chat(
        &self,
        recipient: &IdentityKey,
        content: &str,
        tags: Vec<Tag>,
    ) -> Result<SentRumor, TransportError> {
        let mut state = self.state.lock().unwrap();
        Self::guard_online(&state)?;
        let sent = Self::next_sent(&mut state);
        state.chats.push(SentChat {
            recipient: recipient.as_str().to_owned(),
            content: content.to_owned(),
            tags,
            rumor_id: sent.rumor_id.clone(),
        });
        Ok(sent)
    }

    async fn send_receipt(
        &self,
        recipient: &IdentityKey,
        status: ReceiptStatus,
        rumor_ids: Vec<RumorId>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        Self::guard_online(&state)?;
        state.receipts.push((recipient.clone(), status, rumor_ids));
        Ok(())
    }

    async fn send_typing(
        &self,
        _recipient: &IdentityKey,
        _active: bool,
        _expires_at: Option<u64>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        Self::guard_online(&state)?;
        state.typing_signals += 1;
        Ok(())
    }

    async fn send_reaction(
        &self,
        recipient: &IdentityKey,
        target: &RumorId,
        key: &str,
    ) -> Result<SentRumor, TransportError> {
        let mut state = self.state.lock().unwrap();
        Self::guard_online(&state)?;
        let sent = Self::next_sent(&mut state);
        state.reactions.push((recipient.as_str().to_owned(), target.clone(), key.to_owned()));
        Ok(sent)
    }

    async fn group_upsert(&self, group: &Group) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        Self::guard_online(&state)?;
        state.upserts.push(group.clone());
        Ok(())
    }

    async fn group_send_chat(
        &self,
        group_id: &GroupId,
        content: &str,
        tags: Vec<Tag>,
    ) -> Result<SentRumor, TransportError> {
        let mut state = self.state.lock().unwrap();
        Self::guard_online(&state)?;
        let sent = Self::next_sent(&mut state);
        state.chats.push(SentChat {
            recipient: group_id.as_str().to_owned(),
            content: content.to_owned(),
            tags,
            rumor_id: sent.rumor_id.clone(),
        });
        Ok(sent)
    }

    async fn group_send_typing(
        &self,
        _group_id: &GroupId,
        _active: bool,
        _expires_at: Option<u64>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        Self::guard_online(&state)?;
        state.typing_signals += 1;
        Ok(())
    }

    async fn group_send_reaction(
        &self,
        group_id: &GroupId,
        target: &RumorId,
        key: &str,
    ) -> Result<SentRumor, TransportError> {
        let mut state = self.state.lock().unwrap();
        Self::guard_online(&state)?;
        let sent = Self::next_sent(&mut state);
        state.reactions.push((group_id.as_str().to_owned(), target.clone(), key.to_owned()));
        Ok(sent)
    }

    async fn group_send_metadata(
        &self,
        _group_id: &GroupId,
        recipients: &[IdentityKey],
        metadata: &GroupMetadata,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        Self::guard_online(&state)?;
        state
            .metadata_pushes
            .push(MetadataPush { recipients: recipients.to_vec(), metadata: metadata.clone() });
        Ok(())
    }
}
