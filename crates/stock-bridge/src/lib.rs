//! Bridge from the database notification channel to streaming clients.
//!
//! One [`ChannelListener`] task polls a dedicated connection, decodes each
//! payload and publishes it on the [`BroadcastHub`]. Every streaming client
//! gets a [`StreamSession`](session::StreamSession) that merges hub events
//! with a heartbeat and owns its own teardown.

pub mod decoder;
pub mod error;
pub mod heartbeat;
pub mod hub;
pub mod listener;
pub mod session;
pub mod source;

pub use decoder::decode;
pub use error::{DecodeError, ListenerError, SessionError};
pub use heartbeat::{HeartbeatHandle, HeartbeatScheduler};
pub use hub::{BroadcastHub, Subscription};
pub use listener::{
    validate_channel, ChannelListener, ListenerHandle, ListenerMonitor, ListenerSnapshot,
};
pub use session::{
    FrameSink, SessionHandle, SessionState, StreamSession, StreamSessions, WireFrame,
    HEARTBEAT_EVENT_NAME,
};
pub use source::{
    quote_ident, MemoryNotificationSource, NotificationInjector, NotificationSource,
    PgNotificationSource,
};
