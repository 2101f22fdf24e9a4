//! Per-client streaming sessions.
//!
//! A session owns one hub subscription and one heartbeat timer, and runs a
//! small state machine on its own task:
//!
//! ```text
//! Open -> Streaming -> Completed | TimedOut | Errored
//! ```
//!
//! Every terminal transition goes through a single teardown that cancels the
//! heartbeat, unsubscribes and stops the loop. Only the first caller wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use stock_core::{ProductChangeEvent, SessionId, SubscriptionId};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;
use crate::heartbeat::{HeartbeatHandle, HeartbeatScheduler};
use crate::hub::{BroadcastHub, Subscription};

pub const HEARTBEAT_EVENT_NAME: &str = "heartbeat";

/// One server-sent event as written to the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WireFrame {
    pub id: String,
    pub event: String,
    pub data: String,
}

impl WireFrame {
    /// Keep-alive frame; `seq` counts from 1.
    pub fn heartbeat(seq: u64) -> Self {
        Self {
            id: format!("heartbeat-{seq}"),
            event: HEARTBEAT_EVENT_NAME.to_string(),
            data: String::new(),
        }
    }

    /// Payload frame; `seq` counts from 0.
    pub fn data(seq: u64, event: &str, data: String) -> Self {
        Self {
            id: seq.to_string(),
            event: event.to_string(),
            data,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.event == HEARTBEAT_EVENT_NAME
    }

    /// `text/event-stream` encoding, terminated by a blank line.
    pub fn to_event_stream(&self) -> String {
        let mut out = format!("id: {}\nevent: {}\n", self.id, self.event);
        if self.data.is_empty() {
            out.push_str("data: \n");
        } else {
            for line in self.data.split('\n') {
                out.push_str("data: ");
                out.push_str(line);
                out.push('\n');
            }
        }
        out.push('\n');
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Streaming,
    Completed,
    TimedOut,
    Errored,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Errored)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Errored => "errored",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a session writes its frames.
#[async_trait]
pub trait FrameSink: Send + Sync + 'static {
    async fn send(&mut self, frame: WireFrame) -> Result<(), SessionError>;

    /// Resolves once the client side has gone away.
    async fn closed(&self);
}

#[async_trait]
impl FrameSink for mpsc::Sender<WireFrame> {
    async fn send(&mut self, frame: WireFrame) -> Result<(), SessionError> {
        mpsc::Sender::send(self, frame)
            .await
            .map_err(|_| SessionError::Write("frame receiver dropped".into()))
    }

    async fn closed(&self) {
        mpsc::Sender::closed(self).await;
    }
}

struct SessionShared {
    id: SessionId,
    subscription_id: SubscriptionId,
    /// Hub the subscription is registered with, if it is still live.
    hub: Option<BroadcastHub>,
    state: Mutex<SessionState>,
    error: Mutex<Option<SessionError>>,
    heartbeat: Mutex<Option<HeartbeatHandle>>,
    torn_down: AtomicBool,
    stop: CancellationToken,
    finished: CancellationToken,
}

impl SessionShared {
    fn mark_streaming(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Open {
            *state = SessionState::Streaming;
        }
    }

    fn teardown(&self, terminal: SessionState, error: Option<SessionError>) -> bool {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return false;
        }

        if let Some(err) = &error {
            if terminal == SessionState::Errored {
                tracing::warn!(session_id = %self.id, error = %err, "stream session failed");
            }
        }
        *self.error.lock() = error;
        *self.state.lock() = terminal;

        let heartbeat = self.heartbeat.lock().take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.cancel();
        }
        if let Some(hub) = &self.hub {
            hub.unsubscribe(&self.subscription_id);
        }
        self.stop.cancel();

        tracing::info!(
            session_id = %self.id,
            subscription_id = %self.subscription_id,
            state = %terminal,
            "stream session ended"
        );
        true
    }
}

/// Owner's view of a running session. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.shared.id
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    /// Request `Completed`. True only for the call that ended the session.
    pub fn close(&self) -> bool {
        self.shared.teardown(SessionState::Completed, None)
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.torn_down.load(Ordering::SeqCst)
    }

    /// Wait for the session task to exit and return the final state.
    pub async fn wait(&self) -> SessionState {
        self.shared.finished.cancelled().await;
        self.state()
    }

    /// The failure or timeout that ended the session, if any.
    pub fn error(&self) -> Option<SessionError> {
        self.shared.error.lock().clone()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

/// A session whose frames are read from a channel, e.g. by an HTTP response.
///
/// Dropping `frames` counts as the client closing the connection.
pub struct StreamSession {
    pub handle: SessionHandle,
    pub frames: mpsc::Receiver<WireFrame>,
}

impl StreamSession {
    pub async fn next_frame(&mut self) -> Option<WireFrame> {
        self.frames.recv().await
    }

    pub fn into_parts(self) -> (SessionHandle, mpsc::Receiver<WireFrame>) {
        (self.handle, self.frames)
    }
}

/// Factory for sessions sharing one hub and one heartbeat period.
#[derive(Clone, Debug)]
pub struct StreamSessions {
    hub: BroadcastHub,
    heartbeat_interval: Duration,
    frame_buffer: usize,
}

enum Exit {
    Stopped,
    TimedOut,
    ClientClosed,
    UpstreamDone,
    Failed(SessionError),
}

impl StreamSessions {
    pub fn new(hub: BroadcastHub, heartbeat_interval: Duration, frame_buffer: usize) -> Self {
        Self {
            hub,
            heartbeat_interval,
            frame_buffer: frame_buffer.max(1),
        }
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn subscribe_to_product_changes(&self) -> Subscription {
        self.hub.subscribe()
    }

    /// Start a session writing to `sink`.
    ///
    /// Each event from `subscription` goes through `mapper`, is serialized to
    /// JSON and sent as an `event_name` frame. `timeout` bounds the whole
    /// session; `None` streams until the client or the hub goes away.
    pub fn open<T, M, S>(
        &self,
        subscription: Subscription,
        event_name: impl Into<String>,
        mapper: M,
        timeout: Option<Duration>,
        sink: S,
    ) -> SessionHandle
    where
        T: Serialize + 'static,
        M: FnMut(ProductChangeEvent) -> T + Send + 'static,
        S: FrameSink,
    {
        let event_name = event_name.into();
        let shared = Arc::new(SessionShared {
            id: SessionId::new(),
            subscription_id: subscription.id().clone(),
            hub: subscription.hub(),
            state: Mutex::new(SessionState::Open),
            error: Mutex::new(None),
            heartbeat: Mutex::new(None),
            torn_down: AtomicBool::new(false),
            stop: CancellationToken::new(),
            finished: CancellationToken::new(),
        });

        // One pending tick is enough; the session numbers its own frames.
        let (tick_tx, ticks) = mpsc::channel::<()>(1);
        let heartbeat = HeartbeatScheduler::start(self.heartbeat_interval, move |_| {
            !matches!(tick_tx.try_send(()), Err(mpsc::error::TrySendError::Closed(_)))
        });
        *shared.heartbeat.lock() = Some(heartbeat);

        tracing::info!(
            session_id = %shared.id,
            subscription_id = %shared.subscription_id,
            event = %event_name,
            timeout_secs = timeout.map(|t| t.as_secs()),
            "stream session opened"
        );

        tokio::spawn(run(
            Arc::clone(&shared),
            subscription,
            event_name,
            mapper,
            timeout,
            sink,
            ticks,
        ));

        SessionHandle { shared }
    }

    /// Start a session whose frames are read from the returned channel.
    pub fn open_streaming_response<T, M>(
        &self,
        subscription: Subscription,
        event_name: impl Into<String>,
        mapper: M,
        timeout: Option<Duration>,
    ) -> StreamSession
    where
        T: Serialize + 'static,
        M: FnMut(ProductChangeEvent) -> T + Send + 'static,
    {
        let (tx, frames) = mpsc::channel(self.frame_buffer);
        let handle = self.open(subscription, event_name, mapper, timeout, tx);
        StreamSession { handle, frames }
    }

    /// Subscribe to product changes and stream them.
    pub fn open_product_stream<T, M>(
        &self,
        event_name: impl Into<String>,
        mapper: M,
        timeout: Option<Duration>,
    ) -> StreamSession
    where
        T: Serialize + 'static,
        M: FnMut(ProductChangeEvent) -> T + Send + 'static,
    {
        let subscription = self.subscribe_to_product_changes();
        self.open_streaming_response(subscription, event_name, mapper, timeout)
    }
}

async fn run<T, M, S>(
    shared: Arc<SessionShared>,
    mut subscription: Subscription,
    event_name: String,
    mut mapper: M,
    timeout: Option<Duration>,
    mut sink: S,
    mut ticks: mpsc::Receiver<()>,
) where
    T: Serialize + 'static,
    M: FnMut(ProductChangeEvent) -> T + Send + 'static,
    S: FrameSink,
{
    let _guard = RunGuard(Arc::clone(&shared));
    shared.mark_streaming();
    // A deadline past what the clock can represent is no deadline.
    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
    let mut heartbeat_seq = 0u64;
    let mut data_seq = 0u64;

    let exit = loop {
        let frame = tokio::select! {
            biased;
            () = shared.stop.cancelled() => break Exit::Stopped,
            () = until(deadline) => break Exit::TimedOut,
            () = sink.closed() => break Exit::ClientClosed,
            Some(()) = ticks.recv() => {
                heartbeat_seq += 1;
                WireFrame::heartbeat(heartbeat_seq)
            }
            event = subscription.recv() => {
                let Some(event) = event else {
                    break Exit::UpstreamDone;
                };
                match render(&mut mapper, event) {
                    Ok(json) => {
                        let frame = WireFrame::data(data_seq, &event_name, json);
                        data_seq += 1;
                        frame
                    }
                    Err(e) => break Exit::Failed(SessionError::Serialize(e.to_string())),
                }
            }
        };

        if let Some(exit) = deliver(&shared, &mut sink, frame, deadline).await {
            break exit;
        }
    };

    match exit {
        Exit::Stopped | Exit::ClientClosed | Exit::UpstreamDone => {
            shared.teardown(SessionState::Completed, None);
        }
        Exit::TimedOut => {
            let limit = timeout.unwrap_or_default();
            shared.teardown(SessionState::TimedOut, Some(SessionError::Timeout(limit)));
        }
        Exit::Failed(err) => {
            shared.teardown(SessionState::Errored, Some(err));
        }
    }

    tracing::debug!(
        session_id = %shared.id,
        heartbeats = heartbeat_seq,
        events = data_seq,
        "stream session task finished"
    );
}

/// Makes every exit of the session task terminal, panics included.
struct RunGuard(Arc<SessionShared>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.teardown(
                SessionState::Errored,
                Some(SessionError::Aborted("session task panicked".into())),
            );
        } else {
            self.0.teardown(SessionState::Completed, None);
        }
        self.0.finished.cancel();
    }
}

fn render<T, M>(mapper: &mut M, event: ProductChangeEvent) -> serde_json::Result<String>
where
    T: Serialize,
    M: FnMut(ProductChangeEvent) -> T,
{
    serde_json::to_string(&mapper(event))
}

/// Send one frame unless the session is stopped or times out first.
async fn deliver<S: FrameSink>(
    shared: &SessionShared,
    sink: &mut S,
    frame: WireFrame,
    deadline: Option<Instant>,
) -> Option<Exit> {
    let result = tokio::select! {
        biased;
        () = shared.stop.cancelled() => return Some(Exit::Stopped),
        () = until(deadline) => return Some(Exit::TimedOut),
        result = sink.send(frame) => result,
    };

    result.err().map(Exit::Failed)
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
