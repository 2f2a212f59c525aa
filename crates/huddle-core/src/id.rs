//! Strongly-typed identifiers for Huddle entities.
//!
//! Meeting and user identifiers are issued by the host database and arrive
//! as opaque strings; they are validated once at the boundary and then
//! carried as distinct types. Identifiers minted by the control plane itself
//! (dead-letter entries) are ULIDs.
//!
//! # Example
//!
//! ```rust
//! use huddle_core::id::{MeetingId, UserId};
//!
//! let meeting = MeetingId::new("mtg_42").unwrap();
//! let user = UserId::new("user_7").unwrap();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: MeetingId = user;
//! assert_eq!(meeting.as_str(), "mtg_42");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

const MAX_EXTERNAL_ID_LEN: usize = 128;

fn validate_external_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::validation(format!("{kind} cannot be empty")));
    }
    if id.len() > MAX_EXTERNAL_ID_LEN {
        return Err(Error::validation(format!(
            "{kind} '{id}' is too long (maximum {MAX_EXTERNAL_ID_LEN} characters)"
        )));
    }
    // Identifiers become storage path segments.
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(Error::validation(format!(
            "{kind} '{id}' contains invalid characters"
        )));
    }
    Ok(())
}

/// Identifier of a meeting (the aggregate most batches group by).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MeetingId(String);

impl MeetingId {
    /// Creates a meeting ID after validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the ID is empty, too long, or not path-safe.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_external_id("meeting ID", &id)?;
        Ok(Self(id))
    }

    /// Creates a meeting ID without validation, for values known to be valid.
    #[must_use]
    pub fn new_unchecked(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MeetingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for MeetingId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MeetingId {
    type Error = Error;

    fn try_from(id: String) -> Result<Self> {
        Self::new(id)
    }
}

impl From<MeetingId> for String {
    fn from(id: MeetingId) -> Self {
        id.0
    }
}

/// Identifier of a user (participant, speaker or editor).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    /// Creates a user ID after validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the ID is empty, too long, or not path-safe.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_external_id("user ID", &id)?;
        Ok(Self(id))
    }

    /// Creates a user ID without validation, for values known to be valid.
    #[must_use]
    pub fn new_unchecked(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = Error;

    fn try_from(id: String) -> Result<Self> {
        Self::new(id)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

/// Identifier of a dead-letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeadLetterId(Ulid);

impl DeadLetterId {
    /// Generates a new unique dead-letter ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a dead-letter ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for DeadLetterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeadLetterId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::validation(format!("invalid dead-letter ID '{s}': {e}")))
    }
}
