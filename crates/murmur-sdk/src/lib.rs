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

//! The conversation synchronization engine of a relay-based encrypted
//! chat client.
//!
//! The transport crypto provider hands this crate a stream of decrypted,
//! unordered, duplicate-prone protocol events ("rumors"); the
//! [`SyncEngine`] turns them into consistent, persisted per-conversation
//! timelines — for pairwise conversations and groups — and exposes them as
//! reactive state:
//!
//! - the [`timeline`] module owns message lifecycles: optimistic local
//!   echoes, dedup by rumor id, monotonic delivery status, reactions and
//!   replies,
//! - the [`typing`] module owns ephemeral typing presence,
//! - the [`group`] module reconciles group metadata and parks rumors that
//!   outran their group's metadata,
//! - the [`send_queue`] module retries sends issued while the event bus
//!   was unreachable.
//!
//! Wire cryptography and relay mechanics are out of scope; they live
//! behind the [`transport::Transport`] seam and the [`bus::Connectivity`]
//! handle.

#![warn(missing_debug_implementations)]

pub mod bridge;
pub mod bus;
pub mod config;
mod engine;
mod error;
pub mod group;
pub mod identifiers;
pub mod identity;
pub mod rumor;
pub mod send_queue;
pub mod store;
#[cfg(test)]
pub(crate) mod test_utils;
pub mod timeline;
pub mod transport;
pub mod typing;
mod utils;

pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{Error, Result};
