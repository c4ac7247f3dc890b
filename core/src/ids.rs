//! Identifier newtypes.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies one browsing/checkout session.
///
/// Reservations are owned by a session: only the owner may refresh, extend
/// or release its holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new random session id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A `(resource, sub-type)` pair a reservation is held against.
///
/// For ticketing this is an event id plus a ticket class, e.g.
/// `("evt-42", "VIP")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReservationKey {
    resource_id: String,
    sub_type: String,
}

impl ReservationKey {
    /// Create a key from a resource id and a sub-type.
    pub fn new(resource_id: impl Into<String>, sub_type: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            sub_type: sub_type.into(),
        }
    }

    /// The resource (event) identifier.
    #[must_use]
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// The sub-type (ticket class).
    #[must_use]
    pub fn sub_type(&self) -> &str {
        &self.sub_type
    }
}

impl fmt::Display for ReservationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_id, self.sub_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_session_id_round_trips_uuid() {
        let uuid = Uuid::new_v4();
        let session = SessionId::from_uuid(uuid);
        assert_eq!(session.as_uuid(), &uuid);
        assert_eq!(session.to_string(), uuid.to_string());
    }

    #[test]
    fn test_reservation_key_accessors() {
        let key = ReservationKey::new("event1", "VIP");
        assert_eq!(key.resource_id(), "event1");
        assert_eq!(key.sub_type(), "VIP");
        assert_eq!(key.to_string(), "event1:VIP");
    }

    #[test]
    fn test_reservation_keys_distinguish_sub_types() {
        assert_ne!(
            ReservationKey::new("event1", "VIP"),
            ReservationKey::new("event1", "GA")
        );
    }
}
