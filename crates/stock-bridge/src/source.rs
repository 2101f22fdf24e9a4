//! Where raw notifications come from.
//!
//! [`PgNotificationSource`] owns a dedicated `tokio-postgres` connection.
//! Pooled connections are never used for `LISTEN`: a pool may recycle the
//! connection and silently drop the registration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use stock_core::RawNotification;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, Client, NoTls};

use crate::error::ListenerError;

#[async_trait]
pub trait NotificationSource: Send + 'static {
    /// Register interest in `channel`.
    async fn listen(&mut self, channel: &str) -> Result<(), ListenerError>;

    /// Wait up to `wait` for notifications. An empty batch means none arrived.
    async fn poll(&mut self, wait: Duration) -> Result<Vec<RawNotification>, ListenerError>;

    /// Release the connection. Further polls fail.
    async fn close(&mut self);
}

/// Double-quote an identifier so it matches the exact string given to
/// `pg_notify`, case included.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

type Delivery = Result<RawNotification, String>;

/// Buffer between a connection driver and the polling listener.
struct NotificationQueue {
    rx: mpsc::UnboundedReceiver<Delivery>,
    pending_error: Option<String>,
}

impl NotificationQueue {
    fn new(rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self {
            rx,
            pending_error: None,
        }
    }

    async fn poll(&mut self, wait: Duration) -> Result<Vec<RawNotification>, ListenerError> {
        if let Some(err) = self.pending_error.take() {
            return Err(ListenerError::Transport(err));
        }

        let first = match tokio::time::timeout(wait, self.rx.recv()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(None) => return Err(ListenerError::Transport("connection closed".into())),
            Ok(Some(Err(err))) => return Err(ListenerError::Transport(err)),
            Ok(Some(Ok(notification))) => notification,
        };

        let mut batch = vec![first];
        while let Ok(delivery) = self.rx.try_recv() {
            match delivery {
                Ok(notification) => batch.push(notification),
                Err(err) => {
                    // Hand out what arrived before the failure first.
                    self.pending_error = Some(err);
                    break;
                }
            }
        }
        Ok(batch)
    }
}

/// `LISTEN` on a dedicated PostgreSQL connection.
pub struct PgNotificationSource {
    client: Option<Client>,
    driver: Option<JoinHandle<()>>,
    queue: NotificationQueue,
}

impl PgNotificationSource {
    /// Open the dedicated connection and start driving it.
    pub async fn connect(conn_str: &str) -> Result<Self, ListenerError> {
        let (client, mut connection) = tokio_postgres::connect(conn_str, NoTls)
            .await
            .map_err(|e| ListenerError::Transport(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(async move {
            let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(n)) => {
                        let raw = RawNotification::new(n.channel(), n.payload());
                        if tx.send(Ok(raw)).is_err() {
                            break;
                        }
                    }
                    Ok(AsyncMessage::Notice(notice)) => {
                        tracing::debug!(notice = %notice.message(), "server notice on listen connection");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = tx.send(Err(e.to_string()));
                        break;
                    }
                }
            }
            tracing::debug!("listen connection driver exited");
        });

        Ok(Self {
            client: Some(client),
            driver: Some(driver),
            queue: NotificationQueue::new(rx),
        })
    }
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    async fn listen(&mut self, channel: &str) -> Result<(), ListenerError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ListenerError::Transport("connection closed".into()))?;
        client
            .batch_execute(&format!("LISTEN {}", quote_ident(channel)))
            .await
            .map_err(|e| ListenerError::Transport(e.to_string()))
    }

    async fn poll(&mut self, wait: Duration) -> Result<Vec<RawNotification>, ListenerError> {
        self.queue.poll(wait).await
    }

    async fn close(&mut self) {
        self.client.take();
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

impl Drop for PgNotificationSource {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

#[derive(Default)]
struct MemoryState {
    listened: Mutex<Vec<String>>,
    closed: AtomicBool,
}

/// In-process source driven by a [`NotificationInjector`].
///
/// Only notifications for a channel that was listened on are delivered,
/// like a real server.
pub struct MemoryNotificationSource {
    queue: NotificationQueue,
    state: Arc<MemoryState>,
}

/// Test-side handle that feeds a [`MemoryNotificationSource`].
#[derive(Clone)]
pub struct NotificationInjector {
    tx: mpsc::UnboundedSender<Delivery>,
    state: Arc<MemoryState>,
}

impl MemoryNotificationSource {
    pub fn new() -> (Self, NotificationInjector) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(MemoryState::default());
        (
            Self {
                queue: NotificationQueue::new(rx),
                state: Arc::clone(&state),
            },
            NotificationInjector { tx, state },
        )
    }
}

#[async_trait]
impl NotificationSource for MemoryNotificationSource {
    async fn listen(&mut self, channel: &str) -> Result<(), ListenerError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(ListenerError::Transport("connection closed".into()));
        }
        self.state.listened.lock().push(channel.to_string());
        Ok(())
    }

    async fn poll(&mut self, wait: Duration) -> Result<Vec<RawNotification>, ListenerError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(ListenerError::Transport("connection closed".into()));
        }
        let batch = self.queue.poll(wait).await?;
        let listened = self.state.listened.lock();
        Ok(batch
            .into_iter()
            .filter(|n| listened.contains(&n.channel))
            .collect())
    }

    async fn close(&mut self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

impl NotificationInjector {
    /// Queue a notification. False once the source is gone.
    pub fn notify(&self, channel: &str, payload: &str) -> bool {
        self.tx.send(Ok(RawNotification::new(channel, payload))).is_ok()
    }

    /// Make the next poll fail with a transport error.
    pub fn fail(&self, message: &str) -> bool {
        self.tx.send(Err(message.to_string())).is_ok()
    }

    /// Channels the source has listened on.
    pub fn listened(&self) -> Vec<String> {
        self.state.listened.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}
