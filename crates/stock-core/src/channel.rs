//! Notification channel names.

/// Longest identifier PostgreSQL keeps without truncation.
pub const MAX_CHANNEL_NAME_LEN: usize = 63;

/// Why a channel name cannot be used with `LISTEN`/`pg_notify`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelNameError {
    Blank,
    TooLong,
    ContainsNul,
}

impl std::fmt::Display for ChannelNameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blank => f.write_str("must not be blank"),
            Self::TooLong => write!(f, "is longer than {MAX_CHANNEL_NAME_LEN} bytes"),
            Self::ContainsNul => f.write_str("contains a NUL byte"),
        }
    }
}

impl std::error::Error for ChannelNameError {}

/// A channel name must be non-blank, fit in an identifier and contain no NUL.
pub fn check_channel_name(name: &str) -> Result<(), ChannelNameError> {
    if name.trim().is_empty() {
        return Err(ChannelNameError::Blank);
    }
    if name.len() > MAX_CHANNEL_NAME_LEN {
        return Err(ChannelNameError::TooLong);
    }
    if name.contains('\0') {
        return Err(ChannelNameError::ContainsNul);
    }
    Ok(())
}
