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

use std::{
    collections::{VecDeque, vec_deque::Iter},
    num::NonZeroUsize,
};

use serde::{Deserialize, Serialize};

/// A simple fixed-size ring buffer implementation.
///
/// A size is provided on creation, and the ring buffer reserves that much
/// space, and never reallocates. Pushing onto a full buffer evicts the
/// oldest element.
///
/// This is the building block for the SDK's bounded recency sets (seen
/// rumor ids) and for the per-group pending event buffers.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct RingBuffer<T> {
    inner: VecDeque<T>,
}

impl<T> RingBuffer<T> {
    /// Create a ring buffer with the supplied capacity, reserving it so we
    /// never need to reallocate.
    pub fn new(size: NonZeroUsize) -> Self {
        Self { inner: VecDeque::with_capacity(size.into()) }
    }

    /// Returns the number of items that are stored in this ring buffer,
    /// not the fixed capacity.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if the ring buffer contains no elements.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Appends an element to the back of the ring buffer, evicting the
    /// oldest element if the buffer is at capacity.
    ///
    /// Returns the evicted element, if any.
    pub fn push(&mut self, value: T) -> Option<T> {
        let evicted =
            if self.inner.len() == self.inner.capacity() { self.inner.pop_front() } else { None };

        self.inner.push_back(value);

        evicted
    }

    /// Removes the oldest element and returns it, or `None` if the ring
    /// buffer is empty.
    pub fn pop(&mut self) -> Option<T> {
        self.inner.pop_front()
    }

    /// Returns an iterator that provides elements in oldest-to-newest
    /// order, i.e. the same order you would get if you repeatedly called
    /// pop().
    pub fn iter(&self) -> Iter<'_, T> {
        self.inner.iter()
    }

    /// Drains all elements, oldest first.
    pub fn drain_all(&mut self) -> impl Iterator<Item = T> + '_ {
        self.inner.drain(..)
    }

    /// Clears the ring buffer, removing all values. This does not affect
    /// the capacity.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Returns the total number of elements the `RingBuffer` can hold.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

impl<T: PartialEq> RingBuffer<T> {
    /// Whether the given value is currently held by the buffer.
    ///
    /// Linear scan; the buffers in this workspace are small enough (a few
    /// hundred entries) that this beats maintaining a side index.
    pub fn contains(&self, value: &T) -> bool {
        self.inner.contains(value)
    }
}
