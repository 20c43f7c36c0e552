//! Wire types for the medisync-server REST and WebSocket API.
//!
//! REST bodies are plain JSON. Live queries use a WebSocket per query: the
//! client sends a single `listen` frame, the server replies with `snapshot`
//! frames for as long as the socket stays open, or a single `error` frame.

use serde::{Deserialize, Serialize};

use super::{Document, FieldFilter, Fields};
use crate::error::RemoteError;

/// Frames sent by the client on a live-query socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Opens the live query, optionally filtered by field equality
    Listen {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<FieldFilter>,
    },
}

/// Frames sent by the server on a live-query socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Full listing of the matching documents
    Snapshot { documents: Vec<Document> },
    /// The query failed; the server closes the socket afterwards
    Error { code: ErrorCode, message: String },
}

/// Error classification shared by REST error bodies and error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    PermissionDenied,
    NotFound,
    BadRequest,
    Unavailable,
    Internal,
}

impl ErrorCode {
    /// Maps a wire error back to the backend taxonomy.
    pub fn into_remote_error(self, message: String) -> RemoteError {
        match self {
            ErrorCode::PermissionDenied => RemoteError::PermissionDenied(message),
            ErrorCode::NotFound => RemoteError::NotFound(message),
            ErrorCode::Unavailable => RemoteError::Unavailable(message),
            ErrorCode::BadRequest | ErrorCode::Internal => RemoteError::Protocol(message),
        }
    }
}

impl From<&RemoteError> for ErrorCode {
    fn from(err: &RemoteError) -> Self {
        match err {
            RemoteError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            RemoteError::NotFound(_) => ErrorCode::NotFound,
            RemoteError::Unavailable(_) => ErrorCode::Unavailable,
            RemoteError::Transport(_) | RemoteError::Protocol(_) => ErrorCode::Internal,
        }
    }
}

/// Body of `POST /collections/{c}/documents`.
pub type CreateRequest = Fields;

/// Response to a successful create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedResponse {
    pub id: String,
}

/// Body of `POST /collections/{c}/query`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub filter: Option<FieldFilter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub documents: Vec<Document>,
}

/// JSON body of every non-2xx response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorCode,
    pub message: String,
}

/// Response from the /me endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeResponse {
    pub owner_id: String,
}

impl ClientFrame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn error(err: &RemoteError) -> Self {
        ServerFrame::Error {
            code: err.into(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_listen_frame_format() {
        let frame = ClientFrame::Listen {
            filter: Some(FieldFilter {
                field: "owner_id".to_string(),
                value: json!("clinic-a"),
            }),
        };
        let value: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "listen", "filter": {"field": "owner_id", "value": "clinic-a"}})
        );
    }

    #[test]
    fn test_unfiltered_listen_omits_filter() {
        let encoded = ClientFrame::Listen { filter: None }.encode().unwrap();
        assert_eq!(encoded, r#"{"type":"listen"}"#);
        assert_eq!(
            ClientFrame::decode(&encoded).unwrap(),
            ClientFrame::Listen { filter: None }
        );
    }

    #[test]
    fn test_decode_error_frame() {
        let frame = ServerFrame::decode(
            r#"{"type":"error","code":"permission-denied","message":"nope"}"#,
        )
        .unwrap();
        match frame {
            ServerFrame::Error { code, message } => {
                assert_eq!(code, ErrorCode::PermissionDenied);
                assert_eq!(
                    code.into_remote_error(message),
                    RemoteError::PermissionDenied("nope".to_string())
                );
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_error_frame_from_remote_error() {
        let frame = ServerFrame::error(&RemoteError::Unavailable("down".to_string()));
        assert!(matches!(
            frame,
            ServerFrame::Error {
                code: ErrorCode::Unavailable,
                ..
            }
        ));
    }

    #[test]
    fn test_query_request_defaults_to_unfiltered() {
        let req: QueryRequest = serde_json::from_str("{}").unwrap();
        assert!(req.filter.is_none());
    }
}
