//! Fixed-period keep-alive ticks for one streaming session.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub struct HeartbeatScheduler;

struct TickGate {
    lock: Mutex<()>,
    cancelled: AtomicBool,
    fired: AtomicU64,
}

impl HeartbeatScheduler {
    /// Spawn a timer that calls `on_tick(n)` at t=0 and then every `period`,
    /// with `n` counting from 1. A tick that returns `false` stops the timer.
    ///
    /// Late ticks are delayed rather than bursted.
    pub fn start<F>(period: Duration, mut on_tick: F) -> HeartbeatHandle
    where
        F: FnMut(u64) -> bool + Send + 'static,
    {
        let gate = Arc::new(TickGate {
            lock: Mutex::new(()),
            cancelled: AtomicBool::new(false),
            fired: AtomicU64::new(0),
        });
        let token = CancellationToken::new();

        let task_gate = Arc::clone(&gate);
        let task_token = token.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    () = task_token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let keep_going = {
                    let _guard = task_gate.lock.lock();
                    if task_gate.cancelled.load(Ordering::SeqCst) {
                        false
                    } else {
                        let seq = task_gate.fired.fetch_add(1, Ordering::SeqCst) + 1;
                        on_tick(seq)
                    }
                };
                if !keep_going {
                    break;
                }
            }
        });

        HeartbeatHandle { gate, token }
    }
}

/// Owner's side of a running heartbeat. Dropping it cancels the timer.
pub struct HeartbeatHandle {
    gate: Arc<TickGate>,
    token: CancellationToken,
}

impl HeartbeatHandle {
    /// Stop the timer. Once this returns no further tick runs.
    ///
    /// Returns `true` for the call that actually cancelled. Must not be
    /// called from inside the tick callback.
    pub fn cancel(&self) -> bool {
        let first = !self.gate.cancelled.swap(true, Ordering::SeqCst);
        self.token.cancel();
        // Wait out a tick that is already running.
        drop(self.gate.lock.lock());
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.gate.cancelled.load(Ordering::SeqCst)
    }

    /// Ticks delivered so far.
    pub fn fired(&self) -> u64 {
        self.gate.fired.load(Ordering::SeqCst)
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for HeartbeatHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatHandle")
            .field("fired", &self.fired())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
