// Call envelope and dispatch boundary
// Every module consumes the same pre-authenticated call shape and reports
// failures as values, never as unwinding control flow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// ============================================================================
// IDENTITY
// ============================================================================

/// Opaque caller reference (an address or account handle).
///
/// Equality-comparable only; the engine trusts the identity as given and
/// performs no authentication of its own.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Identity(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Identity(s.to_string())
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Identity(s)
    }
}

// ============================================================================
// CONTRACT ERRORS
// ============================================================================

/// Failure conditions a handler can report.
///
/// Handlers are total: every call produces either a success value or one of
/// these, and no precondition failure leaves a partial write behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractError {
    /// Referenced record does not exist
    NotFound,
    /// Listing was already bought and can never go active again
    AlreadySold,
    /// Caller balance is below the required amount
    InsufficientFunds,
    /// Caller does not hold transfer rights on the record
    NotOwner,
    /// Method name is not part of the module's dispatch table
    UnknownMethod(String),
    /// Argument list failed to decode (missing, wrong type, negative)
    BadRequest(String),
    /// Amount rejected by the engine policy or out of arithmetic range
    InvalidAmount(String),
    /// Durable store failure, surfaced as a value like every other error
    Storage(String),
}

impl ContractError {
    /// Stable machine-readable code carried in the outcome envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ContractError::NotFound => "not-found",
            ContractError::AlreadySold => "already-sold",
            ContractError::InsufficientFunds => "insufficient-funds",
            ContractError::NotOwner => "not-owner",
            ContractError::UnknownMethod(_) => "unknown-method",
            ContractError::BadRequest(_) => "bad-request",
            ContractError::InvalidAmount(_) => "invalid-amount",
            ContractError::Storage(_) => "storage-failure",
        }
    }
}

impl fmt::Display for ContractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractError::NotFound => write!(f, "record not found"),
            ContractError::AlreadySold => write!(f, "listing is no longer active"),
            ContractError::InsufficientFunds => write!(f, "insufficient balance"),
            ContractError::NotOwner => write!(f, "caller is not the owner"),
            ContractError::UnknownMethod(m) => write!(f, "unknown method: {}", m),
            ContractError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            ContractError::InvalidAmount(msg) => write!(f, "invalid amount: {}", msg),
            ContractError::Storage(msg) => write!(f, "storage failure: {}", msg),
        }
    }
}

impl std::error::Error for ContractError {}

// ============================================================================
// CALL ENVELOPE
// ============================================================================

/// One pre-authenticated invocation of a module method.
///
/// `call_id` and `received_at` are host-side diagnostics only. They show up
/// in trace output and never influence state, so identical call sequences
/// stay byte-for-byte deterministic.
#[derive(Debug, Clone, Serialize)]
pub struct Call {
    /// Dispatch target, e.g. "create-listing"
    pub method: String,
    /// Positional arguments as loose JSON values, decoded by the module
    pub args: Vec<Value>,
    /// Authenticated caller, trusted as given
    pub caller: Identity,
    /// Correlation id for tracing
    pub call_id: uuid::Uuid,
    /// When the host accepted the call
    pub received_at: DateTime<Utc>,
}

impl Call {
    pub fn new(method: &str, args: Vec<Value>, caller: impl Into<Identity>) -> Self {
        Call {
            method: method.to_string(),
            args,
            caller: caller.into(),
            call_id: uuid::Uuid::new_v4(),
            received_at: Utc::now(),
        }
    }
}

// ============================================================================
// OUTCOME ENVELOPE
// ============================================================================

/// Tagged call result: `{success: true, value?}` or `{success: false, error}`.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Outcome {
    pub fn ok(value: Option<Value>) -> Self {
        Outcome {
            success: true,
            value,
            error: None,
        }
    }

    pub fn err(error: &ContractError) -> Self {
        Outcome {
            success: false,
            value: None,
            error: Some(error.code().to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn from_result(result: Result<Option<Value>, ContractError>) -> Self {
        match result {
            Ok(value) => Outcome::ok(value),
            Err(e) => Outcome::err(&e),
        }
    }
}

// ============================================================================
// ARGUMENT DECODING
// ============================================================================
// Decoding happens once at the module boundary. Everything that gets past
// these helpers dispatches through an exhaustive match, so UnknownMethod and
// BadRequest can only originate here.

/// Pull an unsigned integer argument out of the list.
///
/// Negative, fractional and non-numeric values are all BadRequest; the u64
/// return type is what keeps negative amounts unrepresentable downstream.
pub fn arg_u64(args: &[Value], index: usize, name: &str) -> Result<u64, ContractError> {
    let raw = args.get(index).ok_or_else(|| {
        ContractError::BadRequest(format!("missing argument `{}` at position {}", name, index))
    })?;

    raw.as_u64().ok_or_else(|| {
        ContractError::BadRequest(format!(
            "argument `{}` must be a non-negative integer, got {}",
            name, raw
        ))
    })
}

/// Pull a string argument out of the list.
pub fn arg_str(args: &[Value], index: usize, name: &str) -> Result<String, ContractError> {
    let raw = args.get(index).ok_or_else(|| {
        ContractError::BadRequest(format!("missing argument `{}` at position {}", name, index))
    })?;

    raw.as_str().map(|s| s.to_string()).ok_or_else(|| {
        ContractError::BadRequest(format!("argument `{}` must be a string, got {}", name, raw))
    })
}

/// Pull an identity argument out of the list.
pub fn arg_identity(args: &[Value], index: usize, name: &str) -> Result<Identity, ContractError> {
    arg_str(args, index, name).map(Identity::new)
}

/// Encode a record into an outcome value.
pub fn to_outcome_value<T: Serialize>(record: &T) -> Result<Option<Value>, ContractError> {
    serde_json::to_value(record)
        .map(Some)
        .map_err(|e| ContractError::Storage(e.to_string()))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_equality_and_display() {
        let a = Identity::new("user1");
        let b: Identity = "user1".into();
        let c = Identity::from("user2".to_string());

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "user1");
        assert_eq!(a.as_str(), "user1");
    }

    #[test]
    fn test_identity_serializes_transparent() {
        let id = Identity::new("user1");
        assert_eq!(serde_json::to_value(&id).unwrap(), json!("user1"));
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(ContractError::NotFound.code(), "not-found");
        assert_eq!(ContractError::AlreadySold.code(), "already-sold");
        assert_eq!(ContractError::InsufficientFunds.code(), "insufficient-funds");
        assert_eq!(ContractError::NotOwner.code(), "not-owner");
        assert_eq!(
            ContractError::UnknownMethod("x".to_string()).code(),
            "unknown-method"
        );
        assert_eq!(
            ContractError::BadRequest("x".to_string()).code(),
            "bad-request"
        );
        assert_eq!(
            ContractError::InvalidAmount("x".to_string()).code(),
            "invalid-amount"
        );
        assert_eq!(
            ContractError::Storage("x".to_string()).code(),
            "storage-failure"
        );
    }

    #[test]
    fn test_error_display_messages() {
        assert_eq!(
            ContractError::InsufficientFunds.to_string(),
            "insufficient balance"
        );
        assert_eq!(
            ContractError::UnknownMethod("spin-up".to_string()).to_string(),
            "unknown method: spin-up"
        );
    }

    #[test]
    fn test_arg_u64_accepts_valid_values() {
        let args = vec![json!(1), json!(100)];
        assert_eq!(arg_u64(&args, 0, "product-id").unwrap(), 1);
        assert_eq!(arg_u64(&args, 1, "price").unwrap(), 100);
    }

    #[test]
    fn test_arg_u64_rejects_missing_argument() {
        let args = vec![json!(1)];
        let err = arg_u64(&args, 1, "price").unwrap_err();
        assert!(matches!(err, ContractError::BadRequest(_)));
    }

    #[test]
    fn test_arg_u64_rejects_negative_and_fractional() {
        let args = vec![json!(-5), json!(1.5), json!("100")];
        assert!(matches!(
            arg_u64(&args, 0, "price"),
            Err(ContractError::BadRequest(_))
        ));
        assert!(matches!(
            arg_u64(&args, 1, "price"),
            Err(ContractError::BadRequest(_))
        ));
        assert!(matches!(
            arg_u64(&args, 2, "price"),
            Err(ContractError::BadRequest(_))
        ));
    }

    #[test]
    fn test_arg_str_and_identity() {
        let args = vec![json!("Test Product"), json!(42)];
        assert_eq!(arg_str(&args, 0, "name").unwrap(), "Test Product");
        assert_eq!(
            arg_identity(&args, 0, "recipient").unwrap(),
            Identity::new("Test Product")
        );
        assert!(matches!(
            arg_str(&args, 1, "name"),
            Err(ContractError::BadRequest(_))
        ));
    }

    #[test]
    fn test_outcome_envelope_shape() {
        let ok = Outcome::ok(Some(json!(1)));
        let ok_json = serde_json::to_value(&ok).unwrap();
        assert_eq!(ok_json, json!({"success": true, "value": 1}));

        let bare = Outcome::ok(None);
        let bare_json = serde_json::to_value(&bare).unwrap();
        assert_eq!(bare_json, json!({"success": true}));

        let err = Outcome::err(&ContractError::InsufficientFunds);
        let err_json = serde_json::to_value(&err).unwrap();
        assert_eq!(
            err_json,
            json!({"success": false, "error": "insufficient-funds"})
        );
    }

    #[test]
    fn test_outcome_from_result() {
        let ok = Outcome::from_result(Ok(Some(json!(3))));
        assert!(ok.is_success());
        assert_eq!(ok.value, Some(json!(3)));

        let err = Outcome::from_result(Err(ContractError::NotFound));
        assert!(!err.is_success());
        assert_eq!(err.error.as_deref(), Some("not-found"));
    }

    #[test]
    fn test_call_envelope_carries_caller_and_method() {
        let call = Call::new("create-listing", vec![json!(1), json!(100)], "user1");
        assert_eq!(call.method, "create-listing");
        assert_eq!(call.caller, Identity::new("user1"));
        assert_eq!(call.args.len(), 2);
    }
}
