use std::time::Duration;

/// Failures of the notification listener.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ListenerError {
    /// The channel name cannot be listened on.
    #[error("invalid channel name: {0}")]
    InvalidChannel(String),

    /// The dedicated connection failed. Fatal to the listener, never retried.
    #[error("notification transport error: {0}")]
    Transport(String),

    /// The listener task panicked or was aborted.
    #[error("listener task ended abnormally: {0}")]
    Aborted(String),
}

/// A notification payload that does not describe a product change.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Malformed(String),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("payload is missing field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },

    #[error("field `ean` is empty")]
    EmptyEan,
}

/// Why a streaming session ended abnormally.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("write to client failed: {0}")]
    Write(String),

    #[error("event serialization failed: {0}")]
    Serialize(String),

    #[error("stream timed out after {0:?}")]
    Timeout(Duration),

    #[error("session ended abnormally: {0}")]
    Aborted(String),
}

impl ListenerError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidChannel(_) => "invalid_channel",
            Self::Transport(_) => "transport",
            Self::Aborted(_) => "aborted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_names_field() {
        assert_eq!(
            DecodeError::MissingField("ean").to_string(),
            "payload is missing field `ean`"
        );
        assert_eq!(
            DecodeError::InvalidField { field: "quantite", expected: "an integer" }.to_string(),
            "field `quantite` must be an integer"
        );
    }

    #[test]
    fn listener_error_kinds() {
        assert_eq!(ListenerError::Transport("eof".into()).error_kind(), "transport");
        assert_eq!(ListenerError::InvalidChannel("".into()).error_kind(), "invalid_channel");
    }

    #[test]
    fn timeout_display() {
        let err = SessionError::Timeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "stream timed out after 30s");
    }
}
