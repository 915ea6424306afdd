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

//! Error conditions.

use thiserror::Error;

use crate::{
    identifiers::{GroupId, RumorId},
    store::StoreError,
    transport::TransportError,
};

/// Result type of the murmur-sdk.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Internal representation of errors.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// An error forwarded from the transport crypto provider. Transport
    /// failures are retryable; a failed send lands in the offline queue.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A generic error returned when the state store fails not due to
    /// IO or (de)serialization.
    #[error(transparent)]
    StateStore(#[from] StoreError),

    /// A group operation referenced a group we have no record of.
    #[error("unknown group `{0}`")]
    UnknownGroup(GroupId),

    /// A group operation required admin rights the local user doesn't have.
    #[error("the local user is not an admin of group `{0}`")]
    NotAGroupAdmin(GroupId),

    /// An operation referenced a message that isn't in the timeline.
    #[error("no message with rumor id `{0}` in this timeline")]
    UnknownMessage(RumorId),

    /// There was a [`serde_json`] deserialization error.
    #[error(transparent)]
    DeserializationError(#[from] serde_json::error::Error),
}
