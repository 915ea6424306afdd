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

//! The offline delivery queue.
//!
//! Sends issued while the event bus is unreachable are persisted and
//! retried by a background task. The task drains the queue in FIFO order on
//! every wake-up: a new enqueue, a manual retry, or a connectivity
//! transition to online. A failed entry stays queued; after the configured
//! number of attempts it stops being auto-retried and is surfaced over the
//! error channel for manual retry — never silently dropped.
//!
//! An entry is removed only after confirmed hand-off to the event bus;
//! beyond that boundary the transport's own best-effort semantics apply.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use murmur_sdk_common::executor::{JoinHandle, spawn};
use tokio::sync::{Notify, broadcast};
use tracing::{debug, instrument, trace, warn};

use crate::{
    Error, Result,
    bus::Connectivity,
    config::SyncConfig,
    identifiers::{ChatId, RumorId, TransactionId},
    store::{DynStateStore, QueuedSend, StateStore as _},
    timeline::MessageTimeline,
    utils::unix_timestamp,
};

/// A queued send ran out of automatic attempts, or failed one.
#[derive(Clone, Debug)]
pub struct QueuedSendError {
    pub transaction_id: TransactionId,
    pub chat: ChatId,
    pub error: Arc<Error>,
    /// `false` once the entry is parked for manual retry.
    pub is_recoverable: bool,
}

/// Durable retry queue for outbound sends.
///
/// This is cheap to clone.
#[derive(Clone)]
pub struct SendQueue {
    inner: Arc<SendQueueInner>,
}

impl std::fmt::Debug for SendQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendQueue").finish_non_exhaustive()
    }
}

struct SendQueueInner {
    store: DynStateStore,
    connectivity: Connectivity,
    notifier: Arc<Notify>,
    enabled: Arc<AtomicBool>,
    is_dropping: Arc<AtomicBool>,
    error_sender: broadcast::Sender<QueuedSendError>,
    task: JoinHandle<()>,
}

impl Drop for SendQueueInner {
    fn drop(&mut self) {
        self.is_dropping.store(true, Ordering::SeqCst);
        self.notifier.notify_one();
        self.task.abort();
    }
}

impl SendQueue {
    pub(crate) fn new(
        store: DynStateStore,
        timeline: MessageTimeline,
        connectivity: Connectivity,
        config: SyncConfig,
    ) -> Self {
        let notifier = Arc::new(Notify::new());
        let enabled = Arc::new(AtomicBool::new(true));
        let is_dropping = Arc::new(AtomicBool::new(false));
        let (error_sender, _) = broadcast::channel(32);

        let task = spawn(Self::sending_task(
            store.clone(),
            timeline,
            connectivity.clone(),
            config,
            notifier.clone(),
            enabled.clone(),
            is_dropping.clone(),
            error_sender.clone(),
        ));

        Self {
            inner: Arc::new(SendQueueInner {
                store,
                connectivity,
                notifier,
                enabled,
                is_dropping,
                error_sender,
                task,
            }),
        }
    }

    /// Persist a send for later delivery and, if we're currently online,
    /// kick off a drain immediately.
    pub(crate) async fn enqueue(
        &self,
        chat: ChatId,
        transaction_id: TransactionId,
        text: String,
        reply_to: Option<RumorId>,
    ) -> Result<()> {
        let entry = QueuedSend {
            transaction_id,
            chat,
            text,
            reply_to,
            created_at: unix_timestamp(),
            attempts: 0,
            last_attempt_at: None,
        };

        // Unlike message persistence this write is not best-effort: the
        // durable entry *is* the delivery guarantee.
        self.inner.store.save_queued_send(entry).await?;

        if self.inner.connectivity.get().is_online() {
            self.inner.notifier.notify_one();
        }

        Ok(())
    }

    /// All currently queued sends, oldest first.
    pub async fn queued(&self) -> Result<Vec<QueuedSend>> {
        Ok(self.inner.store.queued_sends().await?)
    }

    /// Re-arm a parked entry and kick off a drain.
    pub async fn retry(&self, transaction_id: &TransactionId) -> Result<()> {
        self.inner.store.update_queued_send_attempt(transaction_id, 0, unix_timestamp()).await?;
        self.inner.notifier.notify_one();
        Ok(())
    }

    /// Enable or disable automatic draining.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
        if enabled {
            self.inner.notifier.notify_one();
        }
    }

    /// Whether automatic draining is enabled.
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Subscribe to delivery failures.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<QueuedSendError> {
        self.inner.error_sender.subscribe()
    }

    /// Stop the background task. Called on engine shutdown, before the
    /// underlying resources are released.
    pub(crate) fn shutdown(&self) {
        self.inner.is_dropping.store(true, Ordering::SeqCst);
        self.inner.notifier.notify_one();
        self.inner.task.abort();
    }

    /// The background task: drains the queue on every wake-up while online
    /// and enabled, then goes back to waiting.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all)]
    async fn sending_task(
        store: DynStateStore,
        timeline: MessageTimeline,
        connectivity: Connectivity,
        config: SyncConfig,
        notifier: Arc<Notify>,
        enabled: Arc<AtomicBool>,
        is_dropping: Arc<AtomicBool>,
        error_sender: broadcast::Sender<QueuedSendError>,
    ) {
        trace!("spawned the sending task");

        let mut connectivity_updates = connectivity.subscribe();

        loop {
            if is_dropping.load(Ordering::SeqCst) {
                trace!("shutting down!");
                break;
            }

            if enabled.load(Ordering::SeqCst) && connectivity.get().is_online() {
                Self::drain_once(&store, &timeline, &config, &is_dropping, &error_sender).await;
            }

            // Wait for a new entry, a manual kick, or a connectivity
            // transition.
            tokio::select! {
                _ = notifier.notified() => {}
                Some(state) = connectivity_updates.next() => {
                    trace!(?state, "connectivity changed");
                }
            }
        }
    }

    /// One FIFO pass over the queue. Every entry with remaining attempts
    /// is tried exactly once; failures stay queued for the next pass.
    async fn drain_once(
        store: &DynStateStore,
        timeline: &MessageTimeline,
        config: &SyncConfig,
        is_dropping: &AtomicBool,
        error_sender: &broadcast::Sender<QueuedSendError>,
    ) {
        let entries = match store.queued_sends().await {
            Ok(entries) => entries,
            Err(err) => {
                warn!("error when loading queued sends: {err}");
                return;
            }
        };

        for entry in entries {
            if is_dropping.load(Ordering::SeqCst) {
                return;
            }

            if entry.attempts >= config.max_send_attempts {
                // Parked for manual retry.
                continue;
            }

            trace!(transaction_id = %entry.transaction_id, "attempting queued send");

            match timeline
                .retry_send(&entry.chat, &entry.transaction_id, &entry.text, entry.reply_to.clone())
                .await
            {
                Ok(()) => {
                    debug!(transaction_id = %entry.transaction_id, "queued send delivered");
                    if let Err(err) = store.remove_queued_send(&entry.transaction_id).await {
                        warn!("failed to remove delivered queued send: {err}");
                    }
                }

                Err(err) => {
                    let attempts = entry.attempts + 1;
                    debug!(
                        transaction_id = %entry.transaction_id,
                        attempts,
                        "queued send failed: {err}"
                    );

                    if let Err(err) = store
                        .update_queued_send_attempt(
                            &entry.transaction_id,
                            attempts,
                            unix_timestamp(),
                        )
                        .await
                    {
                        warn!("failed to record delivery attempt: {err}");
                    }

                    let _ = error_sender.send(QueuedSendError {
                        transaction_id: entry.transaction_id.clone(),
                        chat: entry.chat.clone(),
                        error: Arc::new(err),
                        is_recoverable: attempts < config.max_send_attempts,
                    });
                }
            }
        }
    }
}
