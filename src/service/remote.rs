use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::serializer::Serializer;

const VALIDATION: &str = "validation";
const PERMISSION_DENIED: &str = "permission_denied";
const NOT_FOUND: &str = "not_found";

/// A failure raised by a remote method and reproduced on the calling side.
///
/// The set of kinds is closed. Anything the receiving side does not recognize folds into
/// [`Application`](RemoteError::Application) with the original kind preserved.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        payload: Option<Value>,
    },

    #[error("permission denied: {message}")]
    PermissionDenied {
        message: String,
        payload: Option<Value>,
    },

    #[error("not found: {message}")]
    NotFound {
        message: String,
        payload: Option<Value>,
    },

    #[error("{kind}: {message}")]
    Application {
        kind: String,
        message: String,
        payload: Option<Value>,
    },
}

/// Wire body of a remote error; the kind travels separately as the reply id.
#[derive(Debug, Serialize, Deserialize)]
struct FaultBody {
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
}

impl RemoteError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            payload: None,
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
            payload: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
            payload: None,
        }
    }

    pub fn application(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Application {
            kind: kind.into(),
            message: message.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, value: Value) -> Self {
        match &mut self {
            Self::Validation { payload, .. }
            | Self::PermissionDenied { payload, .. }
            | Self::NotFound { payload, .. }
            | Self::Application { payload, .. } => *payload = Some(value),
        }
        self
    }

    /// Identifier sent in the reply `id` field.
    pub fn kind(&self) -> &str {
        match self {
            Self::Validation { .. } => VALIDATION,
            Self::PermissionDenied { .. } => PERMISSION_DENIED,
            Self::NotFound { .. } => NOT_FOUND,
            Self::Application { kind, .. } => kind,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Validation { message, .. }
            | Self::PermissionDenied { message, .. }
            | Self::NotFound { message, .. }
            | Self::Application { message, .. } => message,
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Validation { payload, .. }
            | Self::PermissionDenied { payload, .. }
            | Self::NotFound { payload, .. }
            | Self::Application { payload, .. } => payload.as_ref(),
        }
    }

    /// Encode as a reply `(id, data)` pair.
    pub fn to_wire(&self, serializer: &dyn Serializer) -> (String, String) {
        let body = FaultBody {
            message: self.message().to_string(),
            payload: self.payload().cloned(),
        };
        // A body that cannot be encoded still carries the message as plain text.
        let data = serializer
            .encode(&body)
            .unwrap_or_else(|_| self.message().to_string());

        let kind = match self.kind() {
            "" => "application",
            kind => kind,
        };
        (kind.to_string(), data)
    }

    /// Rebuild from a reply `(id, data)` pair. `id` must be non-empty.
    pub fn from_wire(id: &str, data: &str, serializer: &dyn Serializer) -> Self {
        let FaultBody { message, payload } =
            serializer
                .decode::<FaultBody>(data)
                .unwrap_or_else(|_| FaultBody {
                    message: data.to_string(),
                    payload: None,
                });

        match id {
            VALIDATION => Self::Validation { message, payload },
            PERMISSION_DENIED => Self::PermissionDenied { message, payload },
            NOT_FOUND => Self::NotFound { message, payload },
            kind => Self::Application {
                kind: kind.to_string(),
                message,
                payload,
            },
        }
    }
}
