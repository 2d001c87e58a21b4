//! Session state machine: single authority over the current credential.
//!
//! All state lives behind one `std::sync::Mutex`. The lock is never held
//! across a provider call: the phase moves to `Acquiring`/`Refreshing` first,
//! the lock is released for the network exchange, and the result is applied
//! after re-acquiring it. An epoch counter, bumped by sign-in, sign-out, and
//! invalidation, discards results that arrive for a session that no longer
//! exists.
//!
//! Every transition that adds or removes a credential writes or deletes the
//! persisted entry first. If the store fails, the phase is left where it was
//! and the storage error is returned.

use crate::clock::{chrono_duration, Clock};
use crate::client::IdentityProviderClient;
use crate::credential::Credential;
use crate::error::{AuthError, AuthResult, InvalidReason};
use crate::events::SessionEvent;
use crate::profile::Profile;
use crate::reachability::Reachability;
use crate::scheduler::{RefreshConfig, RefreshScheduler};
use crate::session_fsm::{
    holds_credential, SessionInput, SessionMachine, SessionPhase, SessionStatus,
};
use crate::vault::CredentialVault;
use chrono::{DateTime, Utc};
use identity_config_and_utils::SessionSettings;
use identity_storage::StorageError;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the session event feed. Slow subscribers past this lag.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Session behavior configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub refresh: RefreshConfig,
    /// A credential counts as expired this long before `expires_at`.
    pub clock_skew_tolerance: Duration,
    /// Upper bound on every provider call.
    pub request_timeout: Duration,
    /// Consecutive protocol errors before the session is invalidated.
    pub max_protocol_errors: u32,
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&SessionSettings::default())
    }
}

impl From<&SessionSettings> for SessionConfig {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            refresh: RefreshConfig::from(settings),
            clock_skew_tolerance: settings.clock_skew_tolerance(),
            request_timeout: settings.request_timeout(),
            max_protocol_errors: settings.max_protocol_errors.max(1),
            event_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }
}

/// Result of a scheduled refresh attempt.
#[derive(Debug)]
pub enum RefreshOutcome {
    /// New credential persisted and installed.
    Refreshed(Credential),
    /// Transient failure; old credential kept, retry at `retry_at`.
    RetryScheduled {
        retry_at: DateTime<Utc>,
        error: AuthError,
    },
    /// Terminal failure; session is now `Invalid`.
    Invalidated(InvalidReason),
    /// Network unreachable; refresh runs once reachability returns.
    Deferred,
    /// Another refresh is already running.
    AlreadyInFlight,
    /// Nothing to refresh (signed out, invalid, or acquiring).
    Skipped,
    /// Session was signed out or restarted while the refresh was running.
    Superseded,
}

/// Point-in-time view of the session for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    #[serde(skip)]
    pub phase: SessionPhase,
    pub identity: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub pending_refresh_deadline: Option<DateTime<Utc>>,
    pub backoff_ms: u64,
    pub reachability: Reachability,
    pub invalid_reason: Option<InvalidReason>,
    pub email_address: Option<String>,
}

struct SessionState {
    machine: SessionMachine,
    credential: Option<Credential>,
    invalid_reason: Option<InvalidReason>,
    scheduler: RefreshScheduler,
    pending_refresh_deadline: Option<DateTime<Utc>>,
    /// A refresh came due while unreachable.
    refresh_due: bool,
    reachability: Reachability,
    epoch: u64,
    protocol_failures: u32,
    profile: Option<Profile>,
    /// Earliest retry for a sign-in that failed transiently.
    sign_in_retry_at: Option<DateTime<Utc>>,
    /// Epoch of the session whose unauthorization check is running.
    unauthorization_check: Option<u64>,
}

enum Grant<'a> {
    AuthCode(&'a str),
    Password { email: &'a str, password: &'a str },
    SignUp { email: &'a str, password: &'a str },
}

/// Owns the session phase and current credential.
///
/// Share it as `Arc<SessionStateMachine>`; every method takes `&self`.
pub struct SessionStateMachine {
    config: SessionConfig,
    state: Mutex<SessionState>,
    vault: CredentialVault,
    client: Arc<dyn IdentityProviderClient>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<SessionEvent>,
    /// Wakes the refresh driver whenever the deadline changes.
    wakeup: Notify,
}

impl SessionStateMachine {
    pub fn new(
        config: SessionConfig,
        vault: CredentialVault,
        client: Arc<dyn IdentityProviderClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let state = SessionState {
            machine: SessionMachine::new(),
            credential: None,
            invalid_reason: None,
            scheduler: RefreshScheduler::new(config.refresh.clone()),
            pending_refresh_deadline: None,
            refresh_due: false,
            reachability: Reachability::Reachable,
            epoch: 0,
            protocol_failures: 0,
            profile: None,
            sign_in_retry_at: None,
            unauthorization_check: None,
        };

        Self {
            config,
            state: Mutex::new(state),
            vault,
            client,
            clock,
            events,
            wakeup: Notify::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Subscribe to session events. Each subscriber sees every event emitted
    /// after subscribing, in transition order.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from(self.lock().machine.state())
    }

    pub fn phase(&self) -> SessionPhase {
        *self.lock().machine.state()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let st = self.lock();
        SessionSnapshot {
            status: SessionStatus::from(st.machine.state()),
            phase: *st.machine.state(),
            identity: st.credential.as_ref().map(|c| c.identity().to_string()),
            expires_at: st.credential.as_ref().map(Credential::expires_at),
            pending_refresh_deadline: st.pending_refresh_deadline,
            backoff_ms: u64::try_from(st.scheduler.current_backoff().as_millis())
                .unwrap_or(u64::MAX),
            reachability: st.reachability,
            invalid_reason: st.invalid_reason.clone(),
            email_address: st.profile.as_ref().and_then(|p| p.email_address.clone()),
        }
    }

    pub fn next_refresh_deadline(&self) -> Option<DateTime<Utc>> {
        self.lock().pending_refresh_deadline
    }

    pub fn current_backoff(&self) -> Duration {
        self.lock().scheduler.current_backoff()
    }

    pub fn invalid_reason(&self) -> Option<InvalidReason> {
        self.lock().invalid_reason.clone()
    }

    pub fn profile(&self) -> Option<Profile> {
        self.lock().profile.clone()
    }

    pub fn email_address(&self) -> Option<String> {
        self.lock()
            .profile
            .as_ref()
            .and_then(|p| p.email_address.clone())
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The current credential if it is not expired at call time.
    ///
    /// An expired credential is never returned; instead a refresh is marked
    /// due and the refresh driver is woken.
    pub fn current_credential(&self) -> Option<Credential> {
        let now = self.clock.now();
        let mut st = self.lock();
        self.usable_credential(&mut st, now)
    }

    /// Load a persisted credential and resume the session.
    ///
    /// A credential already inside the refresh window (or expired) gets a
    /// refresh due immediately. A corrupt blob is deleted and the session stays
    /// signed out.
    pub fn restore(&self) -> AuthResult<Option<Credential>> {
        let now = self.clock.now();
        let mut st = self.lock();

        match *st.machine.state() {
            SessionPhase::SignedOut => {}
            SessionPhase::Acquiring => return Err(AuthError::SignInInProgress),
            SessionPhase::SignedIn | SessionPhase::Refreshing => {
                return Err(AuthError::AlreadySignedIn)
            }
            SessionPhase::Invalid => return Ok(None),
        }

        let credential = match self.vault.load() {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                debug!("No persisted credential");
                return Ok(None);
            }
            Err(StorageError::Encoding(e)) => {
                warn!(error = %e, "Persisted credential is corrupt, discarding");
                self.vault.clear()?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let skew = self.config.clock_skew_tolerance;
        if credential.refresh_token().is_none() && credential.is_expired(now, skew) {
            info!(
                identity = %credential.identity(),
                "Persisted credential expired and cannot be refreshed, discarding"
            );
            self.vault.clear()?;
            return Ok(None);
        }

        let profile = match self.vault.load_profile() {
            Ok(profile) => profile.filter(|p| p.uid == credential.identity()),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable cached profile");
                None
            }
        };

        let deadline = self.restored_deadline(&st.scheduler, &credential, now);
        self.apply(&mut st, SessionInput::CredentialRestored, |st| {
            st.credential = Some(credential.clone());
            st.invalid_reason = None;
            st.pending_refresh_deadline = Some(deadline);
            st.refresh_due = false;
            st.profile = profile;
            st.scheduler.reset();
        })?;
        drop(st);
        self.wakeup.notify_one();

        info!(
            identity = %credential.identity(),
            expires_at = %credential.expires_at(),
            refresh_at = %deadline,
            "Restored persisted session"
        );
        Ok(Some(credential))
    }

    /// Exchange an authorization code for a credential and sign in.
    pub async fn sign_in(&self, auth_code: &str) -> AuthResult<Credential> {
        self.acquire(Grant::AuthCode(auth_code)).await
    }

    /// Sign in through the provider's password grant.
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> AuthResult<Credential> {
        self.acquire(Grant::Password { email, password }).await
    }

    /// Register a new account and sign in with the credential the provider
    /// issues for it, then fetch the new account's profile.
    ///
    /// A failed profile fetch is logged and leaves the sign-in in place; the
    /// profile can be fetched later with [`update_profile`](Self::update_profile).
    pub async fn sign_up(&self, email: &str, password: &str) -> AuthResult<Credential> {
        let credential = self.acquire(Grant::SignUp { email, password }).await?;
        if let Err(e) = self.update_profile().await {
            warn!(error = %e, "Could not fetch profile after sign-up");
        }
        Ok(credential)
    }

    /// [`sign_in`](Self::sign_in), retrying network and protocol failures with
    /// jittered backoff up to `max_attempts` total attempts.
    pub async fn sign_in_with_retry(
        &self,
        auth_code: &str,
        max_attempts: u32,
    ) -> AuthResult<Credential> {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.sign_in(auth_code).await {
                Ok(credential) => return Ok(credential),
                Err(e)
                    if attempt < max_attempts
                        && matches!(
                            e,
                            AuthError::Network(_) | AuthError::Timeout | AuthError::Protocol(_)
                        )
                        && self.status() != SessionStatus::Invalid =>
                {
                    let delay = self.sign_in_retry_delay();
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Sign-in failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn acquire(&self, grant: Grant<'_>) -> AuthResult<Credential> {
        let (epoch, prior_reason) = {
            let mut st = self.lock();
            match *st.machine.state() {
                SessionPhase::SignedIn | SessionPhase::Refreshing => {
                    return Err(AuthError::AlreadySignedIn)
                }
                SessionPhase::Acquiring => return Err(AuthError::SignInInProgress),
                SessionPhase::SignedOut | SessionPhase::Invalid => {}
            }
            if st.reachability == Reachability::Unreachable {
                return Err(AuthError::Network("network unreachable".to_string()));
            }

            let prior_reason = st.invalid_reason.clone();
            st.epoch += 1;
            self.apply(&mut st, SessionInput::SignInRequested, |st| {
                st.credential = None;
                st.invalid_reason = None;
                st.pending_refresh_deadline = None;
                st.refresh_due = false;
                st.profile = None;
                st.sign_in_retry_at = None;
            })?;
            (st.epoch, prior_reason)
        };

        debug!("Acquiring credential");
        let result = match grant {
            Grant::AuthCode(code) => self.call_provider(self.client.exchange_auth_code(code)).await,
            Grant::Password { email, password } => {
                self.call_provider(self.client.exchange_password(email, password))
                    .await
            }
            Grant::SignUp { email, password } => {
                self.call_provider(self.client.sign_up(email, password)).await
            }
        };

        let now = self.clock.now();
        let mut st = self.lock();
        if st.epoch != epoch {
            debug!("Discarding sign-in result from a superseded session");
            return Err(AuthError::Superseded);
        }

        match result {
            Ok(credential) => self.complete_acquire(&mut st, credential, prior_reason, now),
            Err(e) => self.fail_acquire(&mut st, e, now),
        }
    }

    fn complete_acquire(
        &self,
        st: &mut SessionState,
        credential: Credential,
        prior_reason: Option<InvalidReason>,
        now: DateTime<Utc>,
    ) -> AuthResult<Credential> {
        if credential.is_expired(now, self.config.clock_skew_tolerance) {
            return self.fail_acquire(
                st,
                AuthError::Protocol("provider issued an already expired credential".to_string()),
                now,
            );
        }

        if let Err(e) = self.vault.save(&credential) {
            warn!(error = %e, "Failed to persist credential, sign-in rolled back");
            match prior_reason {
                // Back to the phase the sign-in started from
                Some(reason) => self.apply(st, SessionInput::AcquireRejected, |st| {
                    st.invalid_reason = Some(reason);
                })?,
                None => self.apply(st, SessionInput::AcquireFailed, |_| {})?,
            }
            return Err(e.into());
        }

        let deadline = self.deadline_for(&st.scheduler, &credential, now);
        self.apply(st, SessionInput::AcquireSucceeded, |st| {
            st.credential = Some(credential.clone());
            st.scheduler.reset();
            st.protocol_failures = 0;
            st.pending_refresh_deadline = Some(deadline);
        })?;
        self.wakeup.notify_one();

        info!(
            identity = %credential.identity(),
            expires_at = %credential.expires_at(),
            refresh_at = %deadline,
            "Signed in"
        );
        Ok(credential)
    }

    fn fail_acquire(
        &self,
        st: &mut SessionState,
        error: AuthError,
        now: DateTime<Utc>,
    ) -> AuthResult<Credential> {
        let error = match error {
            AuthError::InvalidCredential(e) => AuthError::Protocol(e.to_string()),
            other => other,
        };

        match &error {
            AuthError::InvalidGrant | AuthError::InvalidRefreshToken | AuthError::Unauthorized => {
                self.invalidate(st, InvalidReason::InvalidGrant, SessionInput::AcquireRejected)?;
            }
            AuthError::Protocol(_) if self.count_protocol_failure(st) => {
                let reason = InvalidReason::RepeatedProtocolErrors {
                    count: st.protocol_failures,
                };
                self.invalidate(st, reason, SessionInput::AcquireRejected)?;
            }
            _ => {
                if !matches!(error, AuthError::Protocol(_)) {
                    st.protocol_failures = 0;
                }
                let retry_at = st.scheduler.retry_at(now);
                self.apply(st, SessionInput::AcquireFailed, |st| {
                    st.sign_in_retry_at = Some(retry_at);
                })?;
                warn!(error = %error, retry_at = %retry_at, "Sign-in failed");
            }
        }
        Err(error)
    }

    /// Clear the persisted credential and move to `SignedOut`. Cancels any
    /// scheduled refresh and discards in-flight results. Idempotent.
    ///
    /// Returns true if a signed-in user was signed out.
    pub fn sign_out(&self) -> AuthResult<bool> {
        let mut st = self.lock();

        if let Err(e) = self.vault.clear() {
            warn!(error = %e, "Failed to clear persisted credential, still signed in");
            return Err(e.into());
        }

        let was_signed_in = holds_credential(st.machine.state());
        st.epoch += 1;
        self.apply(&mut st, SessionInput::SignOutRequested, |st| {
            st.credential = None;
            st.invalid_reason = None;
            st.pending_refresh_deadline = None;
            st.refresh_due = false;
            st.protocol_failures = 0;
            st.profile = None;
            st.sign_in_retry_at = None;
            st.scheduler.reset();
        })?;
        drop(st);
        self.wakeup.notify_one();

        if was_signed_in {
            info!("Signed out");
        }
        Ok(was_signed_in)
    }

    /// Record a reachability transition. Returns true when it triggered an
    /// immediate refresh.
    ///
    /// Going unreachable only suspends refreshes; the credential is kept.
    /// Coming back with a refresh that fell due during the outage resets the
    /// backoff and makes the refresh due now.
    pub fn on_reachability_change(&self, reachability: Reachability) -> bool {
        let now = self.clock.now();
        let mut st = self.lock();

        let previous = std::mem::replace(&mut st.reachability, reachability);
        if previous == reachability {
            return false;
        }
        info!(reachability = ?reachability, "Reachability changed");

        if reachability == Reachability::Unreachable
            || !st.refresh_due
            || !holds_credential(st.machine.state())
        {
            return false;
        }

        st.refresh_due = false;
        st.scheduler.reset();
        st.pending_refresh_deadline = Some(now);
        drop(st);
        self.wakeup.notify_one();

        debug!("Refresh overdue after outage, triggering now");
        true
    }

    /// Run a refresh if one is possible.
    ///
    /// While unreachable the refresh is only marked pending. At most one refresh
    /// runs at a time; a second request gets [`RefreshOutcome::AlreadyInFlight`].
    /// Only storage failures are returned as errors; provider failures are
    /// reported through the outcome.
    pub async fn on_refresh_due(&self) -> AuthResult<RefreshOutcome> {
        let now = self.clock.now();
        let (epoch, refresh_token, current) = {
            let mut st = self.lock();
            match *st.machine.state() {
                SessionPhase::SignedIn => {}
                SessionPhase::Refreshing => return Ok(RefreshOutcome::AlreadyInFlight),
                _ => return Ok(RefreshOutcome::Skipped),
            }
            let Some(current) = st.credential.clone() else {
                return Ok(RefreshOutcome::Skipped);
            };

            let Some(refresh_token) = current.refresh_token().map(str::to_string) else {
                return self.expire_without_refresh_token(&mut st, &current, now);
            };

            if st.reachability == Reachability::Unreachable {
                st.refresh_due = true;
                st.pending_refresh_deadline = None;
                debug!("Refresh due while unreachable, deferring");
                return Ok(RefreshOutcome::Deferred);
            }

            self.apply(&mut st, SessionInput::RefreshStarted, |st| {
                st.pending_refresh_deadline = None;
                st.refresh_due = false;
            })?;
            (st.epoch, refresh_token, current)
        };

        debug!(identity = %current.identity(), "Refreshing credential");
        let result = self
            .call_provider(self.client.refresh(&refresh_token))
            .await;

        let now = self.clock.now();
        let mut st = self.lock();
        if st.epoch != epoch {
            debug!("Discarding refresh result from a superseded session");
            return Ok(RefreshOutcome::Superseded);
        }

        match result {
            Ok(credential) => self.complete_refresh(&mut st, &current, credential, now),
            Err(e) => self.fail_refresh(&mut st, e, now),
        }
    }

    fn expire_without_refresh_token(
        &self,
        st: &mut SessionState,
        current: &Credential,
        now: DateTime<Utc>,
    ) -> AuthResult<RefreshOutcome> {
        if current.is_expired(now, self.config.clock_skew_tolerance) {
            let reason = self.invalidate(
                st,
                InvalidReason::ExpiredWithoutRefreshToken,
                SessionInput::CredentialExpired,
            )?;
            return Ok(RefreshOutcome::Invalidated(reason));
        }

        st.pending_refresh_deadline = Some(self.deadline_for(&st.scheduler, current, now));
        self.wakeup.notify_one();
        Ok(RefreshOutcome::Skipped)
    }

    fn complete_refresh(
        &self,
        st: &mut SessionState,
        current: &Credential,
        refreshed: Credential,
        now: DateTime<Utc>,
    ) -> AuthResult<RefreshOutcome> {
        let refreshed = if refreshed.refresh_token().is_none() {
            refreshed.with_refresh_token(current.refresh_token().map(str::to_string))
        } else {
            refreshed
        };

        if refreshed.identity() != current.identity() {
            let error = AuthError::Protocol(format!(
                "refresh returned a credential for a different identity ({})",
                refreshed.identity()
            ));
            return self.fail_refresh(st, error, now);
        }
        if refreshed.is_expired(now, self.config.clock_skew_tolerance) {
            let error =
                AuthError::Protocol("provider issued an already expired credential".to_string());
            return self.fail_refresh(st, error, now);
        }

        if let Err(e) = self.vault.save(&refreshed) {
            let retry_at = st.scheduler.retry_at(now);
            self.apply(st, SessionInput::RefreshFailed, |st| {
                st.pending_refresh_deadline = Some(retry_at);
            })?;
            self.wakeup.notify_one();
            warn!(error = %e, retry_at = %retry_at, "Failed to persist refreshed credential, keeping previous");
            return Err(e.into());
        }

        st.scheduler.reset();
        let deadline = self.deadline_for(&st.scheduler, &refreshed, now);
        self.apply(st, SessionInput::RefreshSucceeded, |st| {
            st.credential = Some(refreshed.clone());
            st.protocol_failures = 0;
            st.pending_refresh_deadline = Some(deadline);
        })?;
        self.emit(SessionEvent::CredentialRefreshed {
            identity: refreshed.identity().to_string(),
            expires_at: refreshed.expires_at(),
        });
        self.wakeup.notify_one();

        info!(
            identity = %refreshed.identity(),
            expires_at = %refreshed.expires_at(),
            refresh_at = %deadline,
            "Credential refreshed"
        );
        Ok(RefreshOutcome::Refreshed(refreshed))
    }

    fn fail_refresh(
        &self,
        st: &mut SessionState,
        error: AuthError,
        now: DateTime<Utc>,
    ) -> AuthResult<RefreshOutcome> {
        let error = match error {
            AuthError::InvalidCredential(e) => AuthError::Protocol(e.to_string()),
            other => other,
        };

        let terminal = match &error {
            AuthError::InvalidRefreshToken | AuthError::InvalidGrant => {
                Some(InvalidReason::RefreshTokenRejected)
            }
            AuthError::Unauthorized => Some(InvalidReason::Unauthorized),
            AuthError::Protocol(_) if self.count_protocol_failure(st) => {
                Some(InvalidReason::RepeatedProtocolErrors {
                    count: st.protocol_failures,
                })
            }
            _ => None,
        };

        if let Some(reason) = terminal {
            let reason = self.invalidate(st, reason, SessionInput::RefreshRejected)?;
            return Ok(RefreshOutcome::Invalidated(reason));
        }

        if !matches!(error, AuthError::Protocol(_)) {
            st.protocol_failures = 0;
        }
        let retry_at = st.scheduler.retry_at(now);
        self.apply(st, SessionInput::RefreshFailed, |st| {
            st.pending_refresh_deadline = Some(retry_at);
        })?;
        self.wakeup.notify_one();

        warn!(error = %error, retry_at = %retry_at, "Refresh failed, retry scheduled");
        Ok(RefreshOutcome::RetryScheduled { retry_at, error })
    }

    /// Ask the provider whether the current access token is still accepted.
    ///
    /// Returns true if the provider confirmed it is not and the session was
    /// invalidated. Otherwise the cached profile is updated. No-op while
    /// another check runs or when nobody is signed in.
    pub async fn report_unauthorization(&self) -> AuthResult<bool> {
        let now = self.clock.now();
        let (epoch, access_token) = {
            let mut st = self.lock();
            if st.unauthorization_check == Some(st.epoch) {
                debug!("Unauthorization check already running");
                return Ok(false);
            }
            let Some(credential) = self.usable_credential(&mut st, now) else {
                return Ok(false);
            };
            st.unauthorization_check = Some(st.epoch);
            (st.epoch, credential.access_token().to_string())
        };
        let _check = UnauthorizationCheck {
            session: self,
            epoch,
        };

        let result = self
            .call_provider(self.client.fetch_profile(&access_token))
            .await;

        let mut st = self.lock();
        if st.epoch != epoch {
            return Ok(false);
        }

        match result {
            Ok(profile) => {
                self.store_profile(&mut st, profile)?;
                Ok(false)
            }
            Err(AuthError::Unauthorized) => {
                self.invalidate(
                    &mut st,
                    InvalidReason::Unauthorized,
                    SessionInput::UnauthorizedConfirmed,
                )?;
                Ok(true)
            }
            Err(e) => {
                debug!(error = %e, "Unauthorization check inconclusive");
                Err(e)
            }
        }
    }

    /// Fetch the account profile, persist it, and announce it on the feed.
    pub async fn update_profile(&self) -> AuthResult<Profile> {
        let now = self.clock.now();
        let (epoch, access_token) = {
            let mut st = self.lock();
            let credential = self
                .usable_credential(&mut st, now)
                .ok_or(AuthError::NotSignedIn)?;
            (st.epoch, credential.access_token().to_string())
        };

        let result = self
            .call_provider(self.client.fetch_profile(&access_token))
            .await;

        let mut st = self.lock();
        if st.epoch != epoch {
            return Err(AuthError::Superseded);
        }

        match result {
            Ok(profile) => self.store_profile(&mut st, profile),
            Err(AuthError::Unauthorized) => {
                self.invalidate(
                    &mut st,
                    InvalidReason::Unauthorized,
                    SessionInput::UnauthorizedConfirmed,
                )?;
                Err(AuthError::Unauthorized)
            }
            Err(e) => Err(e),
        }
    }

    fn store_profile(&self, st: &mut SessionState, profile: Profile) -> AuthResult<Profile> {
        let identity = st
            .credential
            .as_ref()
            .map(|c| c.identity().to_string())
            .ok_or(AuthError::NotSignedIn)?;
        if profile.uid != identity {
            return Err(AuthError::Protocol(format!(
                "profile uid {} does not match signed-in identity",
                profile.uid
            )));
        }

        self.vault.save_profile(&profile)?;
        let previous = st.profile.replace(profile.clone());
        if previous.as_ref() != Some(&profile) {
            debug!(identity = %identity, "Profile updated");
            self.emit(SessionEvent::ProfileUpdated {
                profile: profile.clone(),
                previous,
            });
        }
        Ok(profile)
    }

    /// Start a task that runs [`on_refresh_due`](Self::on_refresh_due) whenever
    /// the pending deadline passes.
    pub fn spawn_refresh_driver(self: &Arc<Self>) -> RefreshDriver {
        let session = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            debug!("Refresh driver started");
            loop {
                let wait = session.next_refresh_deadline().map(|deadline| {
                    (deadline - session.clock.now())
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                });

                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = session.wakeup.notified() => continue,
                    _ = sleep_or_forever(wait) => {
                        match session.on_refresh_due().await {
                            Ok(outcome) => debug!(outcome = ?outcome, "Scheduled refresh finished"),
                            Err(e) => warn!(error = %e, "Scheduled refresh failed"),
                        }
                    }
                }
            }
            debug!("Refresh driver stopped");
        });

        RefreshDriver {
            shutdown: Some(shutdown_tx),
            handle,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    async fn call_provider<T>(&self, call: impl Future<Output = AuthResult<T>>) -> AuthResult<T> {
        tokio::time::timeout(self.config.request_timeout, call)
            .await
            .unwrap_or_else(|_| Err(AuthError::Timeout))
    }

    /// Consume `input`, apply `update`, and emit a status event if the
    /// observable status changed.
    fn apply(
        &self,
        st: &mut SessionState,
        input: SessionInput,
        update: impl FnOnce(&mut SessionState),
    ) -> AuthResult<()> {
        let old_phase = *st.machine.state();
        st.machine.consume(&input).map_err(|_| {
            AuthError::InvalidStateTransition(format!(
                "Cannot apply {:?} in phase {:?}",
                input, old_phase
            ))
        })?;
        update(st);

        let new_phase = *st.machine.state();
        if old_phase != new_phase {
            debug!(old_phase = ?old_phase, new_phase = ?new_phase, input = ?input, "Session transition");
        }

        let old_status = SessionStatus::from(&old_phase);
        let new_status = SessionStatus::from(&new_phase);
        if old_status != new_status {
            self.emit(status_event(st, new_status));
        }
        Ok(())
    }

    /// Clear the persisted credential, then enter `Invalid`. If the store
    /// fails the phase is rolled back to the last persisted state.
    fn invalidate(
        &self,
        st: &mut SessionState,
        reason: InvalidReason,
        input: SessionInput,
    ) -> AuthResult<InvalidReason> {
        if let Err(e) = self.vault.clear() {
            warn!(error = %e, reason = %reason, "Failed to clear credential, invalidation rolled back");
            match *st.machine.state() {
                SessionPhase::Refreshing => {
                    let retry_at = st.scheduler.retry_at(self.clock.now());
                    self.apply(st, SessionInput::RefreshFailed, |st| {
                        st.pending_refresh_deadline = Some(retry_at);
                    })?;
                    self.wakeup.notify_one();
                }
                SessionPhase::Acquiring => self.apply(st, SessionInput::AcquireFailed, |_| {})?,
                _ => {}
            }
            return Err(e.into());
        }

        st.epoch += 1;
        self.apply(st, input, |st| {
            st.credential = None;
            st.invalid_reason = Some(reason.clone());
            st.pending_refresh_deadline = None;
            st.refresh_due = false;
            st.protocol_failures = 0;
            st.profile = None;
        })?;
        self.wakeup.notify_one();

        warn!(reason = %reason, "Session invalidated");
        Ok(reason)
    }

    /// Returns true once the consecutive protocol error count reaches the limit.
    fn count_protocol_failure(&self, st: &mut SessionState) -> bool {
        st.protocol_failures = st.protocol_failures.saturating_add(1);
        st.protocol_failures >= self.config.max_protocol_errors
    }

    fn usable_credential(&self, st: &mut SessionState, now: DateTime<Utc>) -> Option<Credential> {
        if !holds_credential(st.machine.state()) {
            return None;
        }
        let credential = st.credential.as_ref()?;

        if credential.is_expired(now, self.config.clock_skew_tolerance) {
            if st.reachability == Reachability::Unreachable {
                st.refresh_due = true;
            } else if st.pending_refresh_deadline.is_none()
                && *st.machine.state() == SessionPhase::SignedIn
            {
                st.pending_refresh_deadline = Some(now);
                self.wakeup.notify_one();
            }
            debug!(identity = %credential.identity(), "Credential expired, refresh due");
            return None;
        }

        Some(credential.clone())
    }

    /// Deadline for the next proactive refresh. Without a refresh token the
    /// only thing left to do is notice expiry.
    fn deadline_for(
        &self,
        scheduler: &RefreshScheduler,
        credential: &Credential,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        if credential.refresh_token().is_some() {
            return scheduler.next_refresh_at(credential, now);
        }
        credential
            .expires_at()
            .checked_sub_signed(chrono_duration(self.config.clock_skew_tolerance))
            .unwrap_or(now)
            .max(now)
    }

    fn restored_deadline(
        &self,
        scheduler: &RefreshScheduler,
        credential: &Credential,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let window_start = credential
            .expires_at()
            .checked_sub_signed(chrono_duration(scheduler.config().safety_margin))
            .unwrap_or(now);
        if credential.refresh_token().is_some() && window_start <= now {
            now
        } else {
            self.deadline_for(scheduler, credential, now)
        }
    }

    fn sign_in_retry_delay(&self) -> Duration {
        let now = self.clock.now();
        self.lock()
            .sign_in_retry_at
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }
}

fn status_event(st: &SessionState, status: SessionStatus) -> SessionEvent {
    match status {
        SessionStatus::SignedIn => SessionEvent::SignedIn {
            identity: st
                .credential
                .as_ref()
                .map(|c| c.identity().to_string())
                .unwrap_or_default(),
        },
        SessionStatus::SignedOut => SessionEvent::SignedOut,
        SessionStatus::Invalid => SessionEvent::Invalid {
            reason: st
                .invalid_reason
                .clone()
                .unwrap_or(InvalidReason::InvalidGrant),
        },
    }
}

async fn sleep_or_forever(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending::<()>().await,
    }
}

/// Clears the in-progress marker when an unauthorization check ends, including
/// when its future is dropped. A marker owned by a later session is left alone.
struct UnauthorizationCheck<'a> {
    session: &'a SessionStateMachine,
    epoch: u64,
}

impl Drop for UnauthorizationCheck<'_> {
    fn drop(&mut self) {
        let mut st = self.session.lock();
        if st.unauthorization_check == Some(self.epoch) {
            st.unauthorization_check = None;
        }
    }
}

/// Handle to the background refresh task.
pub struct RefreshDriver {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl RefreshDriver {
    /// Stop the driver and wait for it to exit. A refresh already running is
    /// allowed to finish.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = (&mut self.handle).await;
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
