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

//! Small abstraction over task spawning so the rest of the workspace never
//! imports tokio's task module directly, plus helpers to tie a task's
//! lifetime to a value owning it.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

pub use tokio::task::{AbortHandle, JoinError, JoinHandle, spawn};

/// A type ensuring a task is aborted on drop.
///
/// Used for all the cancellable timers in the SDK (typing expiry, throttle
/// windows): dropping the previous timer is what guarantees it can never
/// fire after being superseded.
#[derive(Debug)]
pub struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> AbortOnDrop<T> {
    pub fn new(join_handle: JoinHandle<T>) -> Self {
        Self(join_handle)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<T: 'static> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(context)
    }
}

/// Trait to create an [`AbortOnDrop`] from a [`JoinHandle`].
pub trait JoinHandleExt<T> {
    fn abort_on_drop(self) -> AbortOnDrop<T>;
}

impl<T> JoinHandleExt<T> for JoinHandle<T> {
    fn abort_on_drop(self) -> AbortOnDrop<T> {
        AbortOnDrop::new(self)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{JoinHandleExt, spawn};

    #[tokio::test]
    async fn test_spawn() {
        let future = async { 42 };
        let join_handle = spawn(future);

        assert_matches!(join_handle.await, Ok(42));
    }

    #[tokio::test]
    async fn test_abort() {
        let future = async { 42 };
        let join_handle = spawn(future);

        join_handle.abort();

        assert!(join_handle.await.is_err());
    }

    #[tokio::test]
    async fn test_abort_on_drop_cancels_the_task() {
        let (mut tx, rx) = tokio::sync::oneshot::channel::<()>();

        let guard = spawn(async move {
            let _ = rx.await;
        })
        .abort_on_drop();

        drop(guard);

        // The receiver side goes away once the task has been aborted.
        tokio::time::timeout(std::time::Duration::from_secs(1), tx.closed())
            .await
            .expect("the task should have been aborted");
    }
}
