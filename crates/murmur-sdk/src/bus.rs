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

//! Connectivity state of the event bus.
//!
//! Connection and subscription mechanics live in the event bus
//! collaborator; the only thing this SDK observes from it is whether the
//! relay pool is currently reachable, which drives the offline queue.

use eyeball::{SharedObservable, Subscriber};

/// Whether the event bus currently has a usable relay connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectivityState {
    Online,
    #[default]
    Offline,
}

impl ConnectivityState {
    pub fn is_online(self) -> bool {
        matches!(self, ConnectivityState::Online)
    }
}

/// Observable connectivity, driven by the event bus implementation and
/// watched by the offline queue.
#[derive(Clone, Debug, Default)]
pub struct Connectivity {
    inner: SharedObservable<ConnectivityState>,
}

impl Connectivity {
    /// New connectivity handle, starting offline.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current state.
    pub fn get(&self) -> ConnectivityState {
        self.inner.get()
    }

    /// Report a state change. No-op observers are not notified when the
    /// state doesn't actually change.
    pub fn set(&self, state: ConnectivityState) {
        self.inner.set_if_not_eq(state);
    }

    /// Subscribe to connectivity transitions.
    pub fn subscribe(&self) -> Subscriber<ConnectivityState> {
        self.inner.subscribe()
    }
}
