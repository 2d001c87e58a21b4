//! Session event feed payloads.

use crate::error::InvalidReason;
use crate::profile::Profile;
use crate::session_fsm::SessionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event broadcast to every subscriber, in transition order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SignedIn {
        identity: String,
    },
    SignedOut,
    Invalid {
        reason: InvalidReason,
    },
    /// A refresh replaced the credential; status unchanged.
    CredentialRefreshed {
        identity: String,
        expires_at: DateTime<Utc>,
    },
    ProfileUpdated {
        profile: Profile,
        #[serde(skip_serializing_if = "Option::is_none")]
        previous: Option<Profile>,
    },
}

impl SessionEvent {
    /// Status this event announces, if it is a status event.
    pub fn status(&self) -> Option<SessionStatus> {
        match self {
            SessionEvent::SignedIn { .. } => Some(SessionStatus::SignedIn),
            SessionEvent::SignedOut => Some(SessionStatus::SignedOut),
            SessionEvent::Invalid { .. } => Some(SessionStatus::Invalid),
            _ => None,
        }
    }
}
