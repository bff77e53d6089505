//! Fabric error model.
//!
//! Two kinds, per spec: `Client` (domain-meaningful, message crosses the
//! wire as written) and `Internal` (everything else; message genericized on
//! the wire, full detail kept locally via `details` and `source`).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Error code carried across the request/reply envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorCode {
    /// User-surfaced client error; message preserved verbatim.
    EFail,
    /// Everything else; message genericized when the origin is opaque.
    EInternal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::EFail => write!(f, "EFAIL"),
            ErrorCode::EInternal => write!(f, "EINTERNAL"),
        }
    }
}

/// The fabric's only error type. Boundaries (service method wrappers,
/// client-side deserialization) normalize through this type; the
/// `Client`/`Internal` distinction survives a wire round trip, the `source`
/// chain does not (spec §7 rule 1).
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    #[error("{message}")]
    Client {
        message: String,
        details: BTreeMap<String, serde_json::Value>,
    },
    #[error("{message}")]
    Internal {
        message: String,
        details: BTreeMap<String, serde_json::Value>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl FabricError {
    pub fn client(message: impl Into<String>) -> Self {
        FabricError::Client {
            message: message.into(),
            details: BTreeMap::new(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        FabricError::Internal {
            message: message.into(),
            details: BTreeMap::new(),
            source: None,
        }
    }

    pub fn internal_from(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        FabricError::Internal {
            message: message.into(),
            details: BTreeMap::new(),
            source: Some(Box::new(source)),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        match &mut self {
            FabricError::Client { details, .. } | FabricError::Internal { details, .. } => {
                details.insert(key.into(), value);
            }
        }
        self
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            FabricError::Client { .. } => ErrorCode::EFail,
            FabricError::Internal { .. } => ErrorCode::EInternal,
        }
    }

    pub fn details(&self) -> &BTreeMap<String, serde_json::Value> {
        match self {
            FabricError::Client { details, .. } | FabricError::Internal { details, .. } => details,
        }
    }

    /// True if this error (or its cause chain) originates from a cancellation
    /// signal. Such errors are shutdown, not failure (spec §7 rule 3).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, FabricError::Internal { message, .. } if message == CANCELLED_MARKER)
    }

    pub fn cancelled() -> Self {
        FabricError::internal(CANCELLED_MARKER)
    }
}

const CANCELLED_MARKER: &str = "autoabortable: operation cancelled";

/// Wire representation of a service error, serialized across the request/
/// reply boundary. `source` never crosses the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl From<&FabricError> for WireError {
    fn from(err: &FabricError) -> Self {
        match err {
            FabricError::Client { message, details } => WireError {
                code: ErrorCode::EFail,
                message: message.clone(),
                details: details.clone(),
            },
            FabricError::Internal { details, .. } => WireError {
                code: ErrorCode::EInternal,
                message: "internal error".to_string(),
                details: details.clone(),
            },
        }
    }
}

impl From<WireError> for FabricError {
    fn from(wire: WireError) -> Self {
        match wire.code {
            ErrorCode::EFail => FabricError::Client {
                message: wire.message,
                details: wire.details,
            },
            ErrorCode::EInternal => FabricError::Internal {
                message: wire.message,
                details: wire.details,
                source: None,
            },
        }
    }
}

/// Request/reply envelope: either a decoded result or a wire error. An
/// envelope carrying neither is a protocol error on the receiving side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope<T> {
    Ok { result: T },
    Err { error: WireError },
}

impl<T> Envelope<T> {
    pub fn ok(result: T) -> Self {
        Envelope::Ok { result }
    }

    pub fn err(error: &FabricError) -> Self {
        Envelope::Err {
            error: error.into(),
        }
    }

    /// Decode an envelope, surfacing `{result}` or raising the deserialized
    /// error. An envelope with neither field is reported as a protocol
    /// error (spec §4.7).
    pub fn into_result(self) -> Result<T, FabricError> {
        match self {
            Envelope::Ok { result } => Ok(result),
            Envelope::Err { error } => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_error_round_trips_message_and_details() {
        let err = FabricError::client("bad params").with_detail("field", "shard");
        let wire = WireError::from(&err);
        assert_eq!(wire.code, ErrorCode::EFail);
        assert_eq!(wire.message, "bad params");

        let back: FabricError = wire.into();
        assert_eq!(back.code(), ErrorCode::EFail);
        assert_eq!(back.details().get("field").unwrap(), "shard");
    }

    #[test]
    fn internal_error_message_is_genericized_on_wire() {
        let err = FabricError::internal("db pool exhausted at host 10.0.0.1");
        let wire = WireError::from(&err);
        assert_eq!(wire.code, ErrorCode::EInternal);
        assert_eq!(wire.message, "internal error");
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let env = Envelope::ok(42u32);
        let json = serde_json::to_string(&env).unwrap();
        let decoded: Envelope<u32> = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.into_result().unwrap(), 42);

        let err_env: Envelope<u32> = Envelope::err(&FabricError::client("nope"));
        let json = serde_json::to_string(&err_env).unwrap();
        let decoded: Envelope<u32> = serde_json::from_str(&json).unwrap();
        let result = decoded.into_result();
        assert!(matches!(result, Err(FabricError::Client { .. })));
    }

    #[test]
    fn error_code_serializes_uppercase_on_the_wire() {
        assert_eq!(serde_json::to_string(&ErrorCode::EFail).unwrap(), "\"EFAIL\"");
        assert_eq!(serde_json::to_string(&ErrorCode::EInternal).unwrap(), "\"EINTERNAL\"");
    }

    #[test]
    fn cancellation_is_recognized_and_not_a_failure() {
        let err = FabricError::cancelled();
        assert!(err.is_cancellation());
        let ordinary = FabricError::internal("boom");
        assert!(!ordinary.is_cancellation());
    }
}
