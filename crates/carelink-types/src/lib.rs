//! Shared types for the CareLink realtime platform.
//!
//! This crate holds the identifiers and message shapes that cross crate
//! boundaries: who a user is ([`UserIdentity`], [`UserRole`]), which
//! conversation a message belongs to ([`ConversationRef`], [`MessageId`]),
//! and what the router moves around ([`OutboundMessage`],
//! [`DeliveryOutcome`]).
//!
//! Storage row types live with the store in `carelink-chat`; only what the
//! router and the wire protocol share is defined here.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

mod message;
pub use message::{DeliveryOutcome, OutboundMessage, Payload, PayloadKind};

/// Opaque, stable key for a registered user.
///
/// Doctors, patients and receptionists all share the same identity space;
/// the role travels separately as [`UserRole`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserIdentity(String);

impl UserIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserIdentity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserIdentity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Account type of a registrant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Doctor,
    Patient,
    Receptionist,
}

impl UserRole {
    /// Returns the lowercase label stored in the database and in tokens.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Doctor => "doctor",
            Self::Patient => "patient",
            Self::Receptionist => "receptionist",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a role label is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown user role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for UserRole {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "doctor" => Ok(Self::Doctor),
            "patient" => Ok(Self::Patient),
            "receptionist" => Ok(Self::Receptionist),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Reference to a conversation held by the persistence layer.
///
/// Opaque to the realtime core; only the store interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationRef(String);

impl ConversationRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier assigned to a message once it has been durably stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random message ID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_role_labels_parse_back() {
        for role in [UserRole::Doctor, UserRole::Patient, UserRole::Receptionist] {
            assert_eq!(role.as_str().parse::<UserRole>(), Ok(role));
        }
    }

    #[test]
    fn user_role_rejects_unknown_label() {
        let err = "admin".parse::<UserRole>().unwrap_err();
        assert_eq!(err, UnknownRole("admin".to_string()));
    }

    #[test]
    fn identity_serializes_as_plain_string() {
        let id = UserIdentity::from("doc-42");
        assert_eq!(serde_json::to_value(&id).unwrap(), serde_json::json!("doc-42"));
    }

    #[test]
    fn generated_message_ids_are_unique() {
        assert_ne!(MessageId::generate(), MessageId::generate());
    }
}
