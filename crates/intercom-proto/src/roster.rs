//! Roster (CONTACTS) payload model.
//!
//! The relay pushes the full roster to every device on each membership
//! change. The payload is a JSON array; recomputing and broadcasting the
//! whole snapshot is cheaper than diffing at the tens-of-devices scale this
//! protocol targets.

use serde::{Deserialize, Serialize};

use crate::FrameError;

/// One roster entry as seen by a recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Registered device identifier.
    pub id: String,
    /// Display name; the relay uses the id.
    pub name: String,
    /// Whether the device is currently in a call.
    pub busy: bool,
}

impl Contact {
    /// Build an entry for a registered device.
    #[must_use]
    pub fn new(id: &str, busy: bool) -> Self {
        Self {
            id: id.to_owned(),
            name: id.to_owned(),
            busy,
        }
    }
}

/// Encode a roster snapshot as a CONTACTS payload.
#[must_use]
pub fn encode_roster(contacts: &[Contact]) -> Vec<u8> {
    // Contact contains no map types, so serialization cannot fail.
    serde_json::to_vec(contacts).expect("roster serialization")
}

/// Decode a CONTACTS payload.
///
/// # Errors
///
/// Returns `FrameError::MalformedRoster` if the payload is not a JSON
/// array of contacts.
pub fn decode_roster(payload: &[u8]) -> Result<Vec<Contact>, FrameError> {
    serde_json::from_slice(payload).map_err(|e| FrameError::MalformedRoster(e.to_string()))
}
