//! Identity session core for Peach.
//!
//! This crate provides:
//! - Immutable credentials with skew-tolerant expiry checks
//! - An explicit FSM-based session state machine that owns the credential
//! - Proactive refresh scheduling with full-jitter retry backoff
//! - Persistence through a pluggable secure store
//! - Reachability gating so refreshes wait out network outages
//! - An OAuth 2.0 provider client and a broadcast event feed

mod client;
mod clock;
mod credential;
mod error;
mod events;
mod http_provider;
mod profile;
mod reachability;
mod scheduler;
mod session;
mod session_fsm;
mod vault;

pub use client::IdentityProviderClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use credential::{is_expired, Credential, CredentialError};
pub use error::{AuthError, AuthResult, InvalidReason};
pub use events::SessionEvent;
pub use http_provider::OAuthProviderClient;
pub use profile::{Gender, Profile};
pub use reachability::{forward_reachability, Reachability, TcpProbe};
pub use scheduler::{full_jitter, RefreshConfig, RefreshScheduler};
pub use session::{
    RefreshDriver, RefreshOutcome, SessionConfig, SessionSnapshot, SessionStateMachine,
    EVENT_CHANNEL_CAPACITY,
};
pub use session_fsm::session_machine;
pub use session_fsm::{holds_credential, SessionInput, SessionMachine, SessionPhase, SessionStatus};
pub use vault::CredentialVault;
