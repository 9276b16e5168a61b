// src/types.rs
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::LookupError;

/// Member identifier as issued by the backend.
pub type UserId = u64;

/// `userID` sent for charges that are tracked by card number only.
pub const UNREGISTERED_USER_ID: i64 = -1;

// Raw status strings returned by GET /users/byCardNumber/{cardNumber}
pub const STATUS_NOT_REGISTERED: &str = "NOT_REGISTERED";
pub const STATUS_UNASSIGNED: &str = "UNASSIGNED";
pub const STATUS_ASSIGNED: &str = "ASSIGNED";

/// Token read from a physical card. Always trimmed and non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CardUid(String);

impl CardUid {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base-10 card number the backend expects in the lookup path.
    pub fn card_number(&self) -> Result<u64, LookupError> {
        // u64::from_str would also accept a leading '+'
        if !self.0.bytes().all(|b| b.is_ascii_digit()) {
            return Err(LookupError::MalformedCard(self.0.clone()));
        }
        self.0
            .parse::<u64>()
            .map_err(|_| LookupError::MalformedCard(self.0.clone()))
    }
}

impl fmt::Display for CardUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Classified result of a card lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentificationOutcome {
    NotRegistered,
    Unassigned,
    Assigned(UserId),
    Unknown,
}

impl IdentificationOutcome {
    /// Status label used on the outcome feed.
    pub fn label(&self) -> &'static str {
        match self {
            IdentificationOutcome::NotRegistered => STATUS_NOT_REGISTERED,
            IdentificationOutcome::Unassigned => STATUS_UNASSIGNED,
            IdentificationOutcome::Assigned(_) => STATUS_ASSIGNED,
            IdentificationOutcome::Unknown => "UNKNOWN",
        }
    }
}

/// A scanned card together with what the backend said about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identification {
    pub uid: CardUid,
    pub outcome: IdentificationOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Kiosk: keep listening after every outcome.
    Multiple,
    /// Operator-assisted: stop after the first outcome.
    Single,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Listening,
    LookupInFlight,
    Closed,
}

/// Body of GET /users/byCardNumber/{cardNumber}
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct LookupResponse {
    #[serde(default)]
    pub status: String,
    #[serde(rename = "userID", default)]
    pub user_id: Option<i64>,
}

/// Text commands understood by the card reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    Start,
    Stop,
}

impl DeviceCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceCommand::Start => "START",
            DeviceCommand::Stop => "STOP",
        }
    }
}

/// One-time entry definitions shared with the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Standard,
    Student,
    Manual,
}

impl EntryType {
    pub fn id(&self) -> u32 {
        match self {
            EntryType::Standard => 1,
            EntryType::Student => 2,
            EntryType::Manual => 3,
        }
    }
}
