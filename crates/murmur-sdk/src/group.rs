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

//! Group metadata reconciliation.
//!
//! Group membership and key distribution ride on metadata rumors that
//! arrive independently of message content, so a group-tagged rumor can
//! show up before we know its group exists. Such rumors are parked in a
//! bounded, time-boxed buffer and replayed once the metadata lands,
//! instead of being dropped.
//!
//! Group rumors are deduplicated through a bounded recency set: an
//! approximation that trades perfect dedup for bounded memory, which is
//! acceptable because redelivery storms are short-lived.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use murmur_sdk_common::RingBuffer;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use crate::{
    Error, Result,
    config::SyncConfig,
    identifiers::{GroupId, IdentityKey, OuterEventId, RumorId},
    rumor::{GroupMetadata, Rumor},
    store::{DynStateStore, Group, StateStore as _},
    transport::{DynTransport, Transport as _},
    utils::unix_timestamp,
};

/// A group-tagged rumor received before its group's metadata was known.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingGroupEvent {
    pub rumor: Rumor,
    pub received_at: u64,
    pub outer_event_id: Option<OuterEventId>,
}

/// Updates about group records, consumed by the UI layer.
#[derive(Clone, Debug)]
pub enum GroupUpdate {
    /// A group became known locally.
    Created(Group),
    /// Name, membership, secret or acceptance changed.
    Updated(Group),
    /// The local user was removed; the group is gone.
    Removed(GroupId),
}

/// Owner of group records, their validation/merge logic and the
/// pending-event buffer.
#[derive(Clone)]
pub struct GroupManager {
    own_key: IdentityKey,
    config: SyncConfig,
    store: DynStateStore,
    transport: DynTransport,
    /// Recently processed group rumor ids; see the module docs for why
    /// this is bounded.
    seen: Arc<Mutex<RingBuffer<RumorId>>>,
    /// Parked rumors per unknown group.
    pending: Arc<Mutex<HashMap<GroupId, RingBuffer<PendingGroupEvent>>>>,
    updates: broadcast::Sender<GroupUpdate>,
}

impl std::fmt::Debug for GroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupManager").finish_non_exhaustive()
    }
}

impl GroupManager {
    pub(crate) fn new(
        own_key: IdentityKey,
        config: SyncConfig,
        store: DynStateStore,
        transport: DynTransport,
    ) -> Self {
        let (updates, _) = broadcast::channel(64);
        let seen = Arc::new(Mutex::new(RingBuffer::new(config.seen_rumor_capacity)));

        Self { own_key, config, store, transport, seen, pending: Default::default(), updates }
    }

    /// Subscribe to group record updates.
    pub fn subscribe(&self) -> broadcast::Receiver<GroupUpdate> {
        self.updates.subscribe()
    }

    fn send_update(&self, update: GroupUpdate) {
        let _ = self.updates.send(update);
    }

    /// Record a group rumor id, returning `false` if it was processed
    /// recently.
    pub(crate) fn note_seen(&self, rumor_id: &RumorId) -> bool {
        let mut seen = self.seen.lock().unwrap();
        if seen.contains(rumor_id) {
            return false;
        }
        seen.push(rumor_id.clone());
        true
    }

    /// Park a rumor for a group we don't know yet. The buffer is bounded;
    /// the oldest entry is dropped at capacity.
    pub(crate) fn park(&self, group_id: &GroupId, event: PendingGroupEvent) {
        let mut pending = self.pending.lock().unwrap();
        let buffer = pending
            .entry(group_id.clone())
            .or_insert_with(|| RingBuffer::new(self.config.pending_group_events));

        if let Some(dropped) = buffer.push(event) {
            debug!(
                group = %group_id,
                rumor_id = %dropped.rumor.id,
                "pending buffer full, dropping oldest entry"
            );
        }
    }

    /// Drain the parked rumors of a group, in arrival order, discarding
    /// entries older than the staleness window.
    fn flush_pending(&self, group_id: &GroupId) -> Vec<PendingGroupEvent> {
        let Some(mut buffer) = self.pending.lock().unwrap().remove(group_id) else {
            return Vec::new();
        };

        let now = unix_timestamp();
        let max_age = self.config.pending_group_event_max_age.as_secs();

        buffer
            .drain_all()
            .filter(|event| {
                let fresh = event.received_at + max_age > now;
                if !fresh {
                    trace!(rumor_id = %event.rumor.id, "discarding stale pending group event");
                }
                fresh
            })
            .collect()
    }

    /// Handle an inbound group metadata rumor.
    ///
    /// Creates, updates or deletes the local record depending on what the
    /// payload says about the local user. Returns the parked rumors that
    /// became processable, in arrival order; the engine replays them
    /// through its normal routing.
    #[instrument(skip(self, metadata), fields(group = %group_id, sender = %sender))]
    pub(crate) async fn handle_metadata(
        &self,
        group_id: &GroupId,
        sender: &IdentityKey,
        metadata: GroupMetadata,
        created_at: u64,
    ) -> Result<Vec<PendingGroupEvent>> {
        match self.store.group(group_id).await? {
            None => {
                // The local user must be listed and the sender must be an
                // admin of the group it announces, else the rumor is not
                // for us to act on.
                if !metadata.members.contains(&self.own_key) {
                    trace!("metadata doesn't list us as a member, ignoring");
                    return Ok(Vec::new());
                }
                if !metadata.admins.contains(sender) {
                    trace!("metadata sender is not an admin, ignoring");
                    return Ok(Vec::new());
                }

                let group = Group {
                    id: group_id.clone(),
                    name: metadata.name,
                    about: metadata.about,
                    picture: metadata.picture,
                    members: metadata.members,
                    admins: metadata.admins,
                    created_at: metadata.created_at.unwrap_or(created_at),
                    secret: metadata.secret,
                    // Our own create, echoed back, needs no confirmation.
                    accepted: *sender == self.own_key,
                    last_message: None,
                    unread_count: 0,
                    message_ttl: None,
                };

                self.store.upsert_group(group.clone()).await?;
                debug!("created group from metadata");
                self.send_update(GroupUpdate::Created(group));

                Ok(self.flush_pending(group_id))
            }

            Some(mut group) => {
                if !group.is_admin(sender) {
                    trace!("metadata update from non-admin, ignoring");
                    return Ok(Vec::new());
                }

                if !metadata.members.contains(&self.own_key) {
                    // We've been removed; drop the group and its timeline.
                    self.store.remove_group(group_id).await?;
                    debug!("local user removed from group, deleting record");
                    self.send_update(GroupUpdate::Removed(group_id.clone()));
                    return Ok(Vec::new());
                }

                if metadata.name.is_some() {
                    group.name = metadata.name;
                }
                if metadata.about.is_some() {
                    group.about = metadata.about;
                }
                if metadata.picture.is_some() {
                    group.picture = metadata.picture;
                }
                group.members = metadata.members;
                group.admins = metadata.admins;
                if metadata.secret.is_some() {
                    group.secret = metadata.secret;
                }

                self.store.upsert_group(group.clone()).await?;
                self.send_update(GroupUpdate::Updated(group));

                Ok(self.flush_pending(group_id))
            }
        }
    }

    /// Create a new group with the local user as admin and push its
    /// metadata to all members.
    pub async fn create_group(
        &self,
        name: &str,
        about: Option<String>,
        members: Vec<IdentityKey>,
    ) -> Result<Group> {
        let mut all_members = members;
        if !all_members.contains(&self.own_key) {
            all_members.push(self.own_key.clone());
        }

        let group = Group {
            id: GroupId::new(Uuid::new_v4().to_string()),
            name: Some(name.to_owned()),
            about,
            picture: None,
            members: all_members,
            admins: vec![self.own_key.clone()],
            created_at: unix_timestamp(),
            secret: Some(fresh_secret()),
            accepted: true,
            last_message: None,
            unread_count: 0,
            message_ttl: None,
        };

        self.store.upsert_group(group.clone()).await?;
        self.push_metadata(&group, &group.members).await?;
        self.send_update(GroupUpdate::Created(group.clone()));

        Ok(group)
    }

    /// Confirm an invitation: mark the group as accepted by the local
    /// user.
    pub async fn accept_invitation(&self, group_id: &GroupId) -> Result<Group> {
        let mut group = self
            .store
            .group(group_id)
            .await?
            .ok_or_else(|| Error::UnknownGroup(group_id.clone()))?;

        if !group.accepted {
            group.accepted = true;
            self.store.upsert_group(group.clone()).await?;
            self.send_update(GroupUpdate::Updated(group.clone()));
        }

        Ok(group)
    }

    /// Update a group's descriptive metadata and push it to all members.
    pub async fn update_group_info(
        &self,
        group_id: &GroupId,
        name: Option<String>,
        about: Option<String>,
        picture: Option<String>,
    ) -> Result<Group> {
        let mut group = self
            .store
            .group(group_id)
            .await?
            .ok_or_else(|| Error::UnknownGroup(group_id.clone()))?;

        if !group.is_admin(&self.own_key) {
            return Err(Error::NotAGroupAdmin(group_id.clone()));
        }

        if name.is_some() {
            group.name = name;
        }
        if about.is_some() {
            group.about = about;
        }
        if picture.is_some() {
            group.picture = picture;
        }

        self.store.upsert_group(group.clone()).await?;
        self.push_metadata(&group, &group.members).await?;
        self.send_update(GroupUpdate::Updated(group.clone()));

        Ok(group)
    }

    /// Remove a member from a group.
    ///
    /// Rotates the shared secret and sends two distinct payloads: the full
    /// metadata (with the new secret) to the remaining members, and a
    /// secret-less notice to the removed member so their client learns
    /// about the removal without the new key material.
    #[instrument(skip(self), fields(group = %group_id, member = %member))]
    pub async fn remove_member(&self, group_id: &GroupId, member: &IdentityKey) -> Result<Group> {
        let mut group = self
            .store
            .group(group_id)
            .await?
            .ok_or_else(|| Error::UnknownGroup(group_id.clone()))?;

        if !group.is_admin(&self.own_key) {
            return Err(Error::NotAGroupAdmin(group_id.clone()));
        }

        group.members.retain(|k| k != member);
        group.admins.retain(|k| k != member);
        if group.admins.is_empty() {
            // Removing the last admin must not orphan the group.
            group.admins.push(self.own_key.clone());
        }

        group.secret = Some(fresh_secret());

        self.store.upsert_group(group.clone()).await?;

        self.push_metadata(&group, &group.members).await?;

        let notice = GroupMetadata { secret: None, ..metadata_of(&group) };
        if let Err(err) = self
            .transport
            .group_send_metadata(group_id, std::slice::from_ref(member), &notice)
            .await
        {
            // The removed member can no longer decrypt group traffic either
            // way; the notice is a courtesy.
            warn!("failed to notify removed member: {err}");
        }

        self.send_update(GroupUpdate::Updated(group.clone()));

        Ok(group)
    }

    /// Push a group's current metadata to the given recipients, upserting
    /// the provider's membership state first.
    async fn push_metadata(&self, group: &Group, recipients: &[IdentityKey]) -> Result<()> {
        self.transport.group_upsert(group).await?;
        self.transport.group_send_metadata(&group.id, recipients, &metadata_of(group)).await?;
        Ok(())
    }
}

fn fresh_secret() -> String {
    Uuid::new_v4().simple().to_string()
}

fn metadata_of(group: &Group) -> GroupMetadata {
    GroupMetadata {
        name: group.name.clone(),
        about: group.about.clone(),
        picture: group.picture.clone(),
        members: group.members.clone(),
        admins: group.admins.clone(),
        secret: group.secret.clone(),
        created_at: Some(group.created_at),
    }
}
