//! Messages exchanged between the relay and its viewers. Serialised as JSON
//! objects tagged by `kind`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::feed::AnnouncementRecord;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Full store contents, sent first on every (re)connect.
    Snapshot {
        items: Vec<AnnouncementRecord>,
        polling_active: bool,
        as_of: DateTime<Utc>,
    },
    /// Records newly admitted by one poll cycle, never empty.
    Delta {
        items: Vec<AnnouncementRecord>,
        as_of: DateTime<Utc>,
    },
    Status {
        polling_active: bool,
        as_of: DateTime<Utc>,
    },
    /// Advisory diagnostic; never ends the session.
    Error { message: String },
    Pong { as_of: DateTime<Utc> },
}

impl ServerMessage {
    pub fn snapshot(items: Vec<AnnouncementRecord>, polling_active: bool) -> Self {
        Self::Snapshot {
            items,
            polling_active,
            as_of: Utc::now(),
        }
    }

    pub fn delta(items: Vec<AnnouncementRecord>) -> Self {
        Self::Delta {
            items,
            as_of: Utc::now(),
        }
    }

    pub fn status(polling_active: bool) -> Self {
        Self::Status {
            polling_active,
            as_of: Utc::now(),
        }
    }

    pub fn diagnostic(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong { as_of: Utc::now() }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ClientMessage {
    Ping,
    RequestStatus,
}
