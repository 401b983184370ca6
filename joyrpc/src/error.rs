use serde::{Deserialize, Serialize};

/// Classification of every failure the runtime can surface.
///
/// Each variant maps to a stable wire code (see [`ErrorKind::code`]) so that
/// peers and tracing backends can match on it without parsing messages.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid or missing parameter, fatal at bind time.
    Config,
    /// Resource acquisition failed before the invoker reached OPENED.
    Init,
    /// Connection-level failure (refused, reset, broken pipe).
    Transport,
    /// The channel was closed while the call was pending.
    TransportClosed,
    /// The channel was declared dead by the heartbeat engine.
    TransportDead,
    /// The per-channel send queue hit its high watermark.
    SendFull,
    /// The outgoing frame exceeds the channel payload cap.
    OverPayload,
    /// Frame or payload encode/decode failure.
    Serialization,
    /// The call deadline elapsed before a response arrived.
    Timeout,
    /// The business executor refused the request.
    Overload,
    /// The cluster has no node eligible to receive traffic.
    NoAvailableNode,
    /// The requested method is not published by the service.
    NoSuchMethod,
    /// The requested (interface, alias) pair is not exported.
    NoSuchAlias,
    /// An application exception propagated from the provider.
    Remote,
    /// Explicit retry signal from the provider.
    Retry,
    /// The invoker is closed or the process is shutting down.
    Shutdown,
    #[serde(untagged)]
    Unknown(String),
}

impl ErrorKind {
    /// Stable code attached to user-visible errors and wire frames.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Config => "CONFIG_ERROR",
            ErrorKind::Init => "INIT_ERROR",
            ErrorKind::Transport => "TRANSPORT_ERROR",
            ErrorKind::TransportClosed => "TRANSPORT_CLOSED",
            ErrorKind::TransportDead => "TRANSPORT_DEAD",
            ErrorKind::SendFull => "SEND_FULL",
            ErrorKind::OverPayload => "OVER_PAYLOAD",
            ErrorKind::Serialization => "SERIALIZATION_ERROR",
            ErrorKind::Timeout => "TIMEOUT_ERROR",
            ErrorKind::Overload => "OVERLOAD_ERROR",
            ErrorKind::NoAvailableNode => "NO_AVAILABLE_NODE",
            ErrorKind::NoSuchMethod => "NO_SUCH_METHOD",
            ErrorKind::NoSuchAlias => "NO_SUCH_ALIAS",
            ErrorKind::Remote => "REMOTE_ERROR",
            ErrorKind::Retry => "RETRY_SIGNAL",
            ErrorKind::Shutdown => "SHUTDOWN_ERROR",
            ErrorKind::Unknown(_) => "UNKNOWN_ERROR",
        }
    }

    /// Whether the route layer may re-attempt the call on another node.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Transport
                | ErrorKind::TransportClosed
                | ErrorKind::TransportDead
                | ErrorKind::NoAvailableNode
                | ErrorKind::Retry
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub msg: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, msg: String) -> Self {
        Self { kind, msg }
    }

    #[must_use]
    pub fn kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            msg: String::default(),
        }
    }

    /// Whether the route layer may re-attempt the call on another node.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }

    /// Attaches the (channel, request) correlation pair for tracing.
    #[must_use]
    pub fn with_correlation(mut self, channel_id: u64, msgid: u64) -> Self {
        if !self.msg.contains("channel:") {
            if !self.msg.is_empty() {
                self.msg.push(' ');
            }
            self.msg
                .push_str(&format!("(channel: {channel_id}, request: {msgid})"));
        }
        self
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::kind(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        let kind = match value.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::UnexpectedEof => ErrorKind::TransportClosed,
            _ => ErrorKind::Transport,
        };
        Self::new(kind, value.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::new(ErrorKind::Serialization, value.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(value: rmp_serde::encode::Error) -> Self {
        Self::new(ErrorKind::Serialization, value.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(value: rmp_serde::decode::Error) -> Self {
        Self::new(ErrorKind::Serialization, value.to_string())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            write!(f, "{:?}: {}", self.kind, self.msg)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = Error::kind(ErrorKind::Timeout);
        assert_eq!(error.to_string(), "Timeout");

        let error = Error::new(ErrorKind::Transport, "connection refused".into());
        assert_eq!(error.to_string(), "Transport: connection refused");
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(ErrorKind::NoSuchAlias.code(), "NO_SUCH_ALIAS");
        assert_eq!(ErrorKind::Shutdown.code(), "SHUTDOWN_ERROR");
        assert_eq!(ErrorKind::Unknown("x".into()).code(), "UNKNOWN_ERROR");
    }

    #[test]
    fn test_retriable_partition() {
        assert!(ErrorKind::Transport.is_retriable());
        assert!(ErrorKind::TransportDead.is_retriable());
        assert!(ErrorKind::Retry.is_retriable());
        assert!(!ErrorKind::Remote.is_retriable());
        assert!(!ErrorKind::Timeout.is_retriable());
        assert!(!ErrorKind::Serialization.is_retriable());
        assert!(!ErrorKind::OverPayload.is_retriable());
    }

    #[test]
    fn test_correlation_attached_once() {
        let error = Error::new(ErrorKind::Timeout, "deadline reached".into())
            .with_correlation(7, 42)
            .with_correlation(8, 43);
        assert_eq!(error.msg, "deadline reached (channel: 7, request: 42)");
    }

    #[test]
    fn test_io_error_mapping() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let error: Error = eof.into();
        assert_eq!(error.kind, ErrorKind::TransportClosed);

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let error: Error = refused.into();
        assert_eq!(error.kind, ErrorKind::Transport);
    }

    #[test]
    fn test_wire_roundtrip() {
        let error = Error::new(ErrorKind::NoSuchMethod, "echo2".into());
        let bytes = serde_json::to_vec(&error).unwrap();
        let back: Error = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, error);
    }
}
