pub mod channel;
pub mod ids;
pub mod product;

pub use channel::{check_channel_name, ChannelNameError, MAX_CHANNEL_NAME_LEN};
pub use ids::{SessionId, SubscriptionId};
pub use product::{Price, Product, ProductChangeEvent, RawNotification};
