//! Record types stored per request kind.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// RequestState
// ============================================================================

/// Persisted lifecycle state of a pending request.
///
/// Approval deletes the row and denial only stamps `denied_at`, so those
/// outcomes are not states of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    /// Stored, requester has not clicked the verification link yet
    Submitted,
    /// Requester proved control of the contact address
    Verified,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Submitted => "SUBMITTED",
            RequestState::Verified => "VERIFIED",
        }
    }

    pub fn valid_transitions(&self) -> &'static [RequestState] {
        match self {
            RequestState::Submitted => &[RequestState::Verified],
            RequestState::Verified => &[],
        }
    }

    pub fn can_transition_to(&self, target: RequestState) -> bool {
        self.valid_transitions().contains(&target)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateParseError(pub String);

impl fmt::Display for StateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid request state: {}", self.0)
    }
}

impl std::error::Error for StateParseError {}

impl std::str::FromStr for RequestState {
    type Err = StateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUBMITTED" => Ok(RequestState::Submitted),
            "VERIFIED" => Ok(RequestState::Verified),
            _ => Err(StateParseError(s.to_string())),
        }
    }
}

// ============================================================================
// PendingRequest
// ============================================================================

/// Free-form subject fields (real name, justification, ...).
pub type SubjectFields = BTreeMap<String, String>;

/// A live request row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    /// Requested account name; case-insensitive key
    pub request_id: String,
    /// Opaque verification/review token (hyphenated UUIDv4)
    pub token: String,
    pub contact_email: String,
    /// Target project
    pub scope: String,
    pub fields: SubjectFields,
    /// Unix seconds
    pub created_at: i64,
    pub origin_ip: String,
    pub state: RequestState,
    /// Unix seconds, set once by a denial
    pub denied_at: Option<i64>,
}

impl PendingRequest {
    pub fn is_verified(&self) -> bool {
        self.state == RequestState::Verified
    }

    pub fn is_denied(&self) -> bool {
        self.denied_at.is_some()
    }

    pub fn field(&self, name: &str) -> &str {
        self.fields.get(name).map(String::as_str).unwrap_or("")
    }
}

/// Insert payload; state always starts at [`RequestState::Submitted`].
#[derive(Debug, Clone)]
pub struct NewPendingRequest {
    pub request_id: String,
    pub token: String,
    pub contact_email: String,
    pub scope: String,
    pub fields: SubjectFields,
    pub created_at: i64,
    pub origin_ip: String,
}
