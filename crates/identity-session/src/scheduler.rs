//! Proactive refresh scheduling and retry backoff.

use crate::clock::chrono_duration;
use crate::credential::Credential;
use chrono::{DateTime, Utc};
use identity_config_and_utils::SessionSettings;
use rand::Rng;
use std::time::Duration;

/// Timing knobs for refresh scheduling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshConfig {
    /// Refresh this long before the credential expires.
    pub safety_margin: Duration,
    /// Never schedule a refresh sooner than this from now.
    pub min_interval: Duration,
    /// Backoff after the first failure.
    pub backoff_base: Duration,
    /// Backoff never grows past this.
    pub backoff_max: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self::from(&SessionSettings::default())
    }
}

impl From<&SessionSettings> for RefreshConfig {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            safety_margin: settings.safety_margin(),
            min_interval: settings.min_refresh_interval(),
            backoff_base: settings.backoff_base(),
            backoff_max: settings.backoff_max(),
        }
    }
}

/// Computes refresh deadlines and tracks the retry backoff.
///
/// The backoff is monotonically non-decreasing between resets and never
/// exceeds `backoff_max`. Each failure yields a delay drawn uniformly from
/// `[0, backoff]` (full jitter) before the backoff doubles.
#[derive(Debug, Clone)]
pub struct RefreshScheduler {
    config: RefreshConfig,
    backoff: Duration,
}

impl RefreshScheduler {
    pub fn new(config: RefreshConfig) -> Self {
        let backoff = config.backoff_base.min(config.backoff_max);
        Self { config, backoff }
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    /// When the next proactive refresh should fire:
    /// `max(expires_at - safety_margin, now + min_interval)`.
    pub fn next_refresh_at(&self, credential: &Credential, now: DateTime<Utc>) -> DateTime<Utc> {
        let proactive = credential
            .expires_at()
            .checked_sub_signed(chrono_duration(self.config.safety_margin))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let earliest = now
            .checked_add_signed(chrono_duration(self.config.min_interval))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        proactive.max(earliest)
    }

    /// Register a failed attempt using the thread RNG. Returns the jittered delay
    /// before the next attempt.
    pub fn on_failure(&mut self) -> Duration {
        self.on_failure_with_rng(&mut rand::thread_rng())
    }

    pub fn on_failure_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let delay = full_jitter(self.backoff, rng);
        self.backoff = self
            .backoff
            .saturating_mul(2)
            .min(self.config.backoff_max);
        delay
    }

    /// Absolute retry time for a failure observed at `now`.
    pub fn retry_at(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.on_failure();
        now.checked_add_signed(chrono_duration(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Back to base after a successful sign-in or refresh.
    pub fn reset(&mut self) {
        self.backoff = self.config.backoff_base.min(self.config.backoff_max);
    }

    /// Cap for the next jittered delay.
    pub fn current_backoff(&self) -> Duration {
        self.backoff
    }
}

/// Uniform random delay in `[0, cap]`.
pub fn full_jitter<R: Rng + ?Sized>(cap: Duration, rng: &mut R) -> Duration {
    if cap.is_zero() {
        return Duration::ZERO;
    }
    let cap_ms = u64::try_from(cap.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rng.gen_range(0..=cap_ms))
}
