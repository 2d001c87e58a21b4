#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use identity_session::{
    AuthError, AuthResult, Credential, CredentialVault, IdentityProviderClient, ManualClock,
    Profile, SessionConfig, SessionEvent, SessionStateMachine,
};
use identity_storage::{MemoryStore, SecureStore, StorageError, StorageKeys, StorageResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

pub const NAMESPACE: &str = "test";
pub const IDENTITY: &str = "user-1";

/// Fixed start time so expiry arithmetic in tests is readable.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

pub fn at(offset_secs: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::seconds(offset_secs)
}

/// Credential issued at `t0 + issued` that lives for `lifetime` seconds.
pub fn credential(access: &str, refresh: Option<&str>, issued: i64, lifetime: u64) -> Credential {
    Credential::from_expires_in(
        access,
        refresh.map(str::to_string),
        at(issued),
        secs(lifetime),
        IDENTITY,
    )
    .expect("valid test credential")
}

/// Provider that replays queued responses and counts calls.
#[derive(Default)]
pub struct ScriptedProvider {
    exchange: Mutex<VecDeque<AuthResult<Credential>>>,
    refresh: Mutex<VecDeque<AuthResult<Credential>>>,
    profile: Mutex<VecDeque<AuthResult<Profile>>>,
    exchange_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    profile_calls: AtomicUsize,
    exchange_gate: Mutex<Option<Arc<Notify>>>,
    refresh_gate: Mutex<Option<Arc<Notify>>>,
    profile_gate: Mutex<Option<Arc<Notify>>>,
    /// Signalled when a gated exchange call has started.
    pub exchange_started: Notify,
    /// Signalled when a gated refresh call has started.
    pub refresh_started: Notify,
    /// Signalled when a gated profile fetch has started.
    pub profile_started: Notify,
    sign_up_calls: AtomicUsize,
    last_refresh_token: Mutex<Option<String>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_exchange(&self, result: AuthResult<Credential>) {
        self.exchange.lock().unwrap().push_back(result);
    }

    pub fn push_refresh(&self, result: AuthResult<Credential>) {
        self.refresh.lock().unwrap().push_back(result);
    }

    pub fn push_profile(&self, result: AuthResult<Profile>) {
        self.profile.lock().unwrap().push_back(result);
    }

    pub fn clear_exchange(&self) {
        self.exchange.lock().unwrap().clear();
    }

    pub fn clear_refresh(&self) {
        self.refresh.lock().unwrap().clear();
    }

    /// Make every code exchange wait until the returned notify is signalled.
    pub fn gate_exchange(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.exchange_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Make every refresh call wait until the returned notify is signalled.
    pub fn gate_refresh(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.refresh_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Make the next profile fetches wait until the returned notify is
    /// signalled. [`ungate_profile`](Self::ungate_profile) lets later calls through.
    pub fn gate_profile(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.profile_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn ungate_profile(&self) {
        *self.profile_gate.lock().unwrap() = None;
    }

    pub fn sign_up_calls(&self) -> usize {
        self.sign_up_calls.load(Ordering::SeqCst)
    }

    pub fn exchange_calls(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn profile_calls(&self) -> usize {
        self.profile_calls.load(Ordering::SeqCst)
    }

    pub fn last_refresh_token(&self) -> Option<String> {
        self.last_refresh_token.lock().unwrap().clone()
    }
}

fn unscripted<T>() -> AuthResult<T> {
    Err(AuthError::Network("no scripted response".to_string()))
}

#[async_trait]
impl IdentityProviderClient for ScriptedProvider {
    async fn exchange_auth_code(&self, _code: &str) -> AuthResult<Credential> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.exchange_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            self.exchange_started.notify_one();
            gate.notified().await;
        }

        let next = self.exchange.lock().unwrap().pop_front();
        next.unwrap_or_else(unscripted)
    }

    async fn refresh(&self, refresh_token: &str) -> AuthResult<Credential> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_refresh_token.lock().unwrap() = Some(refresh_token.to_string());

        let gate = self.refresh_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            self.refresh_started.notify_one();
            gate.notified().await;
        }

        let next = self.refresh.lock().unwrap().pop_front();
        next.unwrap_or_else(unscripted)
    }

    async fn exchange_password(&self, _email: &str, _password: &str) -> AuthResult<Credential> {
        self.exchange_auth_code("password").await
    }

    async fn sign_up(&self, _email: &str, _password: &str) -> AuthResult<Credential> {
        self.sign_up_calls.fetch_add(1, Ordering::SeqCst);
        self.exchange_auth_code("sign-up").await
    }

    async fn fetch_profile(&self, _access_token: &str) -> AuthResult<Profile> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.profile_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            self.profile_started.notify_one();
            gate.notified().await;
        }

        let next = self.profile.lock().unwrap().pop_front();
        next.unwrap_or_else(unscripted)
    }
}

/// Memory store whose writes and deletes can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_put: AtomicBool,
    fail_delete: AtomicBool,
    fail_profile_delete: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_put.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    /// Fail only deletes of the cached profile blob.
    pub fn fail_profile_deletes(&self, fail: bool) {
        self.fail_profile_delete.store(fail, Ordering::SeqCst);
    }
}

impl SecureStore for FlakyStore {
    fn put(&self, key: &str, blob: &[u8]) -> StorageResult<()> {
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("disk full".to_string()));
        }
        self.inner.put(key, blob)
    }

    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("keychain locked".to_string()));
        }
        if self.fail_profile_delete.load(Ordering::SeqCst)
            && key.ends_with(StorageKeys::SESSION_PROFILE)
        {
            return Err(StorageError::Backend("profile entry locked".to_string()));
        }
        self.inner.delete(key)
    }
}

pub struct Harness {
    pub session: Arc<SessionStateMachine>,
    pub clock: Arc<ManualClock>,
    pub provider: Arc<ScriptedProvider>,
    pub store: Arc<FlakyStore>,
    pub vault: CredentialVault,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        let store = Arc::new(FlakyStore::new());
        Self::with_store(config, store)
    }

    /// Build a session over an existing store, as a restart would.
    pub fn with_store(config: SessionConfig, store: Arc<FlakyStore>) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let provider = Arc::new(ScriptedProvider::new());
        let vault = CredentialVault::new(store.clone(), NAMESPACE);
        let session = Arc::new(SessionStateMachine::new(
            config,
            vault.clone(),
            provider.clone(),
            clock.clone(),
        ));
        Self {
            session,
            clock,
            provider,
            store,
            vault,
        }
    }

    /// Sign in with a credential issued now that lives for `lifetime` seconds.
    pub async fn signed_in(&self, access: &str, refresh: Option<&str>, lifetime: u64) -> Credential {
        let now = self.clock.now_offset();
        self.provider
            .push_exchange(Ok(credential(access, refresh, now, lifetime)));
        self.session.sign_in("code").await.expect("sign-in")
    }

    pub fn advance_to(&self, offset_secs: i64) {
        self.clock.set(at(offset_secs));
    }
}

/// Seconds since `t0` on a manual clock.
pub trait ClockOffset {
    fn now_offset(&self) -> i64;
}

impl ClockOffset for ManualClock {
    fn now_offset(&self) -> i64 {
        use identity_session::Clock;
        (self.now() - t0()).num_seconds()
    }
}

/// Drain everything currently buffered on an event receiver.
pub fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
