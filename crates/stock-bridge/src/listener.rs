//! The single long-lived `LISTEN` loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stock_core::check_channel_name;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::decoder::decode;
use crate::error::ListenerError;
use crate::hub::BroadcastHub;
use crate::source::NotificationSource;

pub struct ChannelListener;

#[derive(Default)]
struct ListenerStats {
    received: AtomicU64,
    decoded: AtomicU64,
    skipped: AtomicU64,
    delivered: AtomicU64,
}

/// Point-in-time copy of the listener counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerSnapshot {
    pub received: u64,
    pub decoded: u64,
    pub skipped: u64,
    /// Subscriber deliveries, summed over all events.
    pub delivered: u64,
}

impl ListenerStats {
    fn snapshot(&self) -> ListenerSnapshot {
        ListenerSnapshot {
            received: self.received.load(Ordering::Relaxed),
            decoded: self.decoded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
        }
    }
}

/// Reject names that `LISTEN` cannot use.
pub fn validate_channel(channel: &str) -> Result<(), ListenerError> {
    check_channel_name(channel)
        .map_err(|reason| ListenerError::InvalidChannel(format!("channel name {reason}")))
}

impl ChannelListener {
    /// Listen on `channel` and publish every decodable notification to `hub`
    /// until stopped or the connection fails.
    ///
    /// Fails before spawning anything if the channel name is invalid or the
    /// `LISTEN` itself fails.
    pub async fn start<S: NotificationSource>(
        channel: &str,
        mut source: S,
        hub: BroadcastHub,
        poll_wait: Duration,
    ) -> Result<ListenerHandle, ListenerError> {
        validate_channel(channel)?;
        source.listen(channel).await?;
        tracing::info!(channel, poll_wait_ms = poll_wait.as_millis() as u64, "listening for notifications");

        let cancel = CancellationToken::new();
        let terminated = CancellationToken::new();
        let stats = Arc::new(ListenerStats::default());

        let task = tokio::spawn(listen_loop(
            channel.to_string(),
            source,
            hub.clone(),
            poll_wait,
            cancel.clone(),
            terminated.clone(),
            Arc::clone(&stats),
        ));

        Ok(ListenerHandle {
            cancel,
            terminated,
            task: Mutex::new(Some(task)),
            stats,
            hub,
        })
    }
}

async fn listen_loop<S: NotificationSource>(
    channel: String,
    mut source: S,
    hub: BroadcastHub,
    poll_wait: Duration,
    cancel: CancellationToken,
    terminated: CancellationToken,
    stats: Arc<ListenerStats>,
) -> Result<(), ListenerError> {
    let _terminated = terminated.drop_guard();

    let result = loop {
        if cancel.is_cancelled() {
            break Ok(());
        }

        let polled = tokio::select! {
            biased;
            () = cancel.cancelled() => break Ok(()),
            polled = source.poll(poll_wait) => polled,
        };

        let batch = match polled {
            Ok(batch) => batch,
            Err(_) if cancel.is_cancelled() => break Ok(()),
            Err(err) => {
                tracing::error!(channel = %channel, error = %err, "notification listener failed");
                break Err(err);
            }
        };

        for raw in batch {
            stats.received.fetch_add(1, Ordering::Relaxed);
            match decode(&raw) {
                Ok(event) => {
                    stats.decoded.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(channel = %channel, ean = %event.ean, quantity = event.quantity, "product change");
                    let delivered = hub.publish(event);
                    stats.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
                }
                Err(err) => {
                    stats.skipped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        channel = %channel,
                        error = %err,
                        payload = %raw.payload,
                        "skipping undecodable notification"
                    );
                }
            }
        }
    };

    source.close().await;
    hub.shutdown_all();
    tracing::info!(channel = %channel, stats = ?stats.snapshot(), "notification listener stopped");
    result
}

/// Control handle for the running listener.
pub struct ListenerHandle {
    cancel: CancellationToken,
    terminated: CancellationToken,
    task: Mutex<Option<JoinHandle<Result<(), ListenerError>>>>,
    stats: Arc<ListenerStats>,
    hub: BroadcastHub,
}

impl ListenerHandle {
    /// Cancel the loop, wait for it, close the connection and complete every
    /// subscriber. Returns the loop's error if it had already failed.
    ///
    /// Later calls return `Ok(())`.
    pub async fn stop(&self) -> Result<(), ListenerError> {
        self.cancel.cancel();
        let task = self.task.lock().take();
        let Some(task) = task else {
            return Ok(());
        };

        let result = match task.await {
            Ok(result) => result,
            Err(join_err) => Err(ListenerError::Aborted(join_err.to_string())),
        };
        self.hub.shutdown_all();
        result
    }

    /// Resolves once the loop has exited, for any reason.
    pub async fn terminated(&self) {
        self.terminated.cancelled().await;
    }

    pub fn is_running(&self) -> bool {
        !self.terminated.is_cancelled()
    }

    pub fn stats(&self) -> ListenerSnapshot {
        self.stats.snapshot()
    }

    /// A cloneable read-only view for observers such as health checks.
    pub fn monitor(&self) -> ListenerMonitor {
        ListenerMonitor {
            terminated: self.terminated.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

/// Observes a listener without being able to stop it.
#[derive(Clone)]
pub struct ListenerMonitor {
    terminated: CancellationToken,
    stats: Arc<ListenerStats>,
}

impl ListenerMonitor {
    pub fn is_running(&self) -> bool {
        !self.terminated.is_cancelled()
    }

    pub async fn terminated(&self) {
        self.terminated.cancelled().await;
    }

    pub fn stats(&self) -> ListenerSnapshot {
        self.stats.snapshot()
    }
}

impl std::fmt::Debug for ListenerMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerMonitor")
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
