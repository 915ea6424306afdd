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

use std::{num::NonZeroUsize, time::Duration};

/// Configuration for the conversation synchronization engine.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use murmur_sdk::config::SyncConfig;
///
/// let config = SyncConfig::new()
///     .disable_auto_receipts()
///     .typing_expiry(Duration::from_secs(5));
/// ```
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Whether accepting a genuine inbound chat message automatically emits
    /// a "delivered" receipt back to the sender.
    pub(crate) auto_delivery_receipts: bool,

    /// Minimum interval between two outbound typing notifications for the
    /// same conversation.
    pub(crate) typing_throttle: Duration,

    /// How long an inbound typing signal stays active without a refresh.
    pub(crate) typing_expiry: Duration,

    /// Maximum number of rumors parked per group while its metadata is
    /// unknown. Oldest entries are dropped beyond this.
    pub(crate) pending_group_events: NonZeroUsize,

    /// Parked rumors older than this are discarded when the buffer is
    /// flushed.
    pub(crate) pending_group_event_max_age: Duration,

    /// Capacity of the bounded recency set used to deduplicate group
    /// rumors.
    pub(crate) seen_rumor_capacity: NonZeroUsize,

    /// How many delivery attempts a queued send gets before it is parked
    /// for manual retry.
    pub(crate) max_send_attempts: u8,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_delivery_receipts: true,
            typing_throttle: Duration::from_secs(4),
            typing_expiry: Duration::from_secs(10),
            pending_group_events: NonZeroUsize::new(128).unwrap(),
            pending_group_event_max_age: Duration::from_secs(3600),
            seen_rumor_capacity: NonZeroUsize::new(256).unwrap(),
            max_send_attempts: 3,
        }
    }
}

impl SyncConfig {
    /// Create a new default `SyncConfig`.
    #[must_use]
    pub fn new() -> Self {
        Default::default()
    }

    /// Don't emit automatic "delivered" receipts for accepted inbound
    /// messages.
    #[must_use]
    pub fn disable_auto_receipts(mut self) -> Self {
        self.auto_delivery_receipts = false;
        self
    }

    /// Set the outbound typing notification throttle window.
    #[must_use]
    pub fn typing_throttle(mut self, window: Duration) -> Self {
        self.typing_throttle = window;
        self
    }

    /// Set how long inbound typing presence lasts without a refresh.
    #[must_use]
    pub fn typing_expiry(mut self, expiry: Duration) -> Self {
        self.typing_expiry = expiry;
        self
    }

    /// Set the per-group bound on rumors parked while the group's metadata
    /// is unknown.
    #[must_use]
    pub fn pending_group_events(mut self, capacity: NonZeroUsize) -> Self {
        self.pending_group_events = capacity;
        self
    }

    /// Set the staleness window applied when parked group rumors are
    /// flushed.
    #[must_use]
    pub fn pending_group_event_max_age(mut self, max_age: Duration) -> Self {
        self.pending_group_event_max_age = max_age;
        self
    }

    /// Set the number of delivery attempts a queued send gets before being
    /// parked for manual retry.
    #[must_use]
    pub fn max_send_attempts(mut self, attempts: u8) -> Self {
        self.max_send_attempts = attempts;
        self
    }
}
