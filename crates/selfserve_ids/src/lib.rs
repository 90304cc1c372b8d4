//! Shared identifier wrappers for the selfserve portal.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Error returned when parsing an identifier fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdParseError {
    message: String,
}

impl IdParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for IdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for IdParseError {}

macro_rules! define_uuid_id {
    ($name:ident, $label:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Parse the canonical hyphenated form (36 characters).
            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                if value.len() != 36 {
                    return Err(IdParseError::new(format!(
                        "Invalid {}: expected 36 characters, got {}",
                        $label,
                        value.len()
                    )));
                }
                let parsed = Uuid::parse_str(value)
                    .map_err(|e| IdParseError::new(format!("Invalid {}: {}", $label, e)))?;
                Ok(Self(parsed.hyphenated().to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

define_uuid_id!(RequestToken, "request token");
define_uuid_id!(ReactivationToken, "reactivation token");

/// Length of an [`ErrorId`].
pub const ERROR_ID_LEN: usize = 18;

/// Short correlation id printed in the journal next to an internal error
/// and handed to the client instead of the error detail.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorId(String);

impl ErrorId {
    pub fn new() -> Self {
        let simple = Uuid::new_v4().simple().to_string();
        Self(simple[..ERROR_ID_LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ErrorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ErrorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tokens_are_unique() {
        let tokens: HashSet<_> = (0..1000).map(|_| RequestToken::new()).collect();
        assert_eq!(tokens.len(), 1000);
    }

    #[test]
    fn parse_requires_canonical_length() {
        let token = RequestToken::new();
        assert_eq!(RequestToken::parse(token.as_str()).unwrap(), token);

        let simple = token.as_str().replace('-', "");
        assert!(RequestToken::parse(&simple).is_err());
        assert!(RequestToken::parse("").is_err());
        assert!(RequestToken::parse("zzzzzzzz-zzzz-zzzz-zzzz-zzzzzzzzzzzz").is_err());
    }

    #[test]
    fn parse_normalizes_case() {
        let token = RequestToken::new();
        let upper = token.as_str().to_uppercase();
        assert_eq!(RequestToken::parse(&upper).unwrap(), token);
    }

    #[test]
    fn error_id_has_fixed_length() {
        let id = ErrorId::new();
        assert_eq!(id.as_str().len(), ERROR_ID_LEN);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
