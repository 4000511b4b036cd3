#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

use super::envelope::Method;

/// WebSocket error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// Error parsing a WebSocket message
    MessageParse(serde_json::Error),
    /// The manager has been destroyed and no longer accepts commands
    ConnectionClosed,
    /// The operation needs an open socket and there is none
    NotConnected,
    /// Operation timed out
    Timeout,
    /// The server answered a typed request with a failure
    RequestFailed {
        /// Protocol method of the failed request
        method: Method,
        /// Failure details reported by the server or the dispatcher
        reason: String,
    },
    /// A typed request was superseded before it completed
    Cancelled(Method),
    /// Event subscriber lagged and missed notifications
    Lagged {
        /// Number of notifications that were missed
        count: u64,
    },
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::MessageParse(e) => write!(f, "Failed to parse WebSocket message: {e}"),
            Self::ConnectionClosed => write!(f, "WebSocket manager is closed"),
            Self::NotConnected => write!(f, "WebSocket is not connected"),
            Self::Timeout => write!(f, "WebSocket operation timed out"),
            Self::RequestFailed { method, reason } => {
                write!(f, "{method} request failed: {reason}")
            }
            Self::Cancelled(method) => write!(f, "{method} request was cancelled"),
            Self::Lagged { count } => write!(f, "Subscriber lagged, missed {count} events"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            Self::MessageParse(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        let kind = match e {
            WsError::RequestFailed { .. } | WsError::Cancelled(_) => crate::error::Kind::Request,
            _ => crate::error::Kind::WebSocket,
        };
        crate::error::Error::with_source(kind, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, WsError::Connection(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Kind};

    #[test]
    fn request_failures_map_to_request_kind() {
        let error: Error = WsError::RequestFailed {
            method: Method::EventReplay,
            reason: "server busy".to_owned(),
        }
        .into();

        assert_eq!(error.kind(), Kind::Request);
        assert_eq!(
            error.to_string(),
            "Request: Event.replay request failed: server busy"
        );
    }

    #[test]
    fn transport_failures_map_to_websocket_kind() {
        let error: Error = WsError::NotConnected.into();

        assert_eq!(error.kind(), Kind::WebSocket);
        assert!(
            matches!(error.downcast_ref::<WsError>(), Some(WsError::NotConnected)),
            "source should be preserved"
        );
    }
}
