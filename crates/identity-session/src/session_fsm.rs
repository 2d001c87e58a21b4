//! Session phase state machine using rust-fsm.
//!
//! The machine only tracks the phase. Credential data, backoff, and deadlines
//! live next to it in the session state and are updated by the same lock.
//!
//! ## State Diagram
//!
//! ```text
//!                 SignInRequested
//!  ┌───────────┐ ───────────────────► ┌───────────┐
//!  │ SignedOut │ ◄─── AcquireFailed ─ │ Acquiring │
//!  └─────┬─────┘                      └─────┬─────┘
//!        │ CredentialRestored               │ AcquireSucceeded      AcquireRejected
//!        ▼                                  ▼                            │
//!  ┌───────────┐ ── RefreshStarted ─► ┌────────────┐                     ▼
//!  │ SignedIn  │ ◄─ RefreshSucceeded ─│ Refreshing │ ─ RefreshRejected ► Invalid
//!  │           │ ◄─ RefreshFailed ─── │            │
//!  └───────────┘                      └────────────┘
//!        │ CredentialExpired / UnauthorizedConfirmed ─────────────────► Invalid
//!
//!  SignOutRequested from any phase ─► SignedOut
//!  Invalid ── SignInRequested ─► Acquiring
//! ```

use rust_fsm::*;
use serde::{Deserialize, Serialize};

state_machine! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub session_machine(SignedOut)

    SignedOut => {
        SignInRequested => Acquiring,
        CredentialRestored => SignedIn,
        SignOutRequested => SignedOut
    },
    Acquiring => {
        AcquireSucceeded => SignedIn,
        // Grant rejected or too many protocol errors
        AcquireRejected => Invalid,
        // Network error, timeout, or storage failure
        AcquireFailed => SignedOut,
        SignOutRequested => SignedOut
    },
    SignedIn => {
        RefreshStarted => Refreshing,
        CredentialExpired => Invalid,
        UnauthorizedConfirmed => Invalid,
        SignOutRequested => SignedOut
    },
    Refreshing => {
        RefreshSucceeded => SignedIn,
        // Old credential retained until it actually expires
        RefreshFailed => SignedIn,
        RefreshRejected => Invalid,
        UnauthorizedConfirmed => Invalid,
        SignOutRequested => SignedOut
    },
    Invalid => {
        SignInRequested => Acquiring,
        SignOutRequested => SignedOut
    }
}

pub use session_machine::Input as SessionInput;
pub use session_machine::State as SessionPhase;
pub use session_machine::StateMachine as SessionMachine;

/// Observable projection of the phase, as delivered on the event feed.
///
/// `Acquiring` still reads as signed out and `Refreshing` as signed in;
/// in-flight work never changes what callers observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    SignedOut,
    SignedIn,
    Invalid,
}

impl SessionStatus {
    pub fn is_signed_in(&self) -> bool {
        matches!(self, SessionStatus::SignedIn)
    }
}

impl From<&SessionPhase> for SessionStatus {
    fn from(phase: &SessionPhase) -> Self {
        match phase {
            SessionPhase::SignedOut | SessionPhase::Acquiring => SessionStatus::SignedOut,
            SessionPhase::SignedIn | SessionPhase::Refreshing => SessionStatus::SignedIn,
            SessionPhase::Invalid => SessionStatus::Invalid,
        }
    }
}

/// True for phases that hold a credential.
pub fn holds_credential(phase: &SessionPhase) -> bool {
    matches!(phase, SessionPhase::SignedIn | SessionPhase::Refreshing)
}
