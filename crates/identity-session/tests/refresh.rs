mod common;

use common::*;
use identity_session::{
    AuthError, CredentialVault, InvalidReason, Reachability, RefreshConfig, RefreshOutcome,
    SessionConfig, SessionEvent, SessionPhase, SessionStatus,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

#[tokio::test]
async fn test_refresh_inside_window_replaces_credential() {
    let h = Harness::new();
    h.signed_in("AT1", Some("RT1"), 3600).await;
    let mut rx = h.session.subscribe();

    h.advance_to(3550);
    h.provider
        .push_refresh(Ok(credential("AT2", Some("RT2"), 3550, 3650)));

    let outcome = h.session.on_refresh_due().await.unwrap();
    let refreshed = match outcome {
        RefreshOutcome::Refreshed(cred) => cred,
        other => panic!("expected refresh, got {:?}", other),
    };
    assert_eq!(refreshed.access_token(), "AT2");
    assert_eq!(refreshed.expires_at(), at(7200));
    assert_eq!(h.provider.last_refresh_token().as_deref(), Some("RT1"));

    let current = h.session.current_credential().unwrap();
    assert_eq!(current.access_token(), "AT2");
    assert_eq!(current.refresh_token(), Some("RT2"));
    assert_eq!(
        h.vault.raw_credential().unwrap(),
        Some(CredentialVault::encode(&current).unwrap())
    );
    assert_eq!(h.session.next_refresh_deadline(), Some(at(7140)));
    assert_eq!(
        drain(&mut rx),
        vec![SessionEvent::CredentialRefreshed {
            identity: IDENTITY.to_string(),
            expires_at: at(7200),
        }]
    );
}

#[tokio::test]
async fn test_refresh_without_new_refresh_token_keeps_old_one() {
    let h = Harness::new();
    h.signed_in("AT1", Some("RT1"), 3600).await;
    h.advance_to(3550);
    h.provider
        .push_refresh(Ok(credential("AT2", None, 3550, 3600)));

    h.session.on_refresh_due().await.unwrap();
    let current = h.session.current_credential().unwrap();
    assert_eq!(current.access_token(), "AT2");
    assert_eq!(current.refresh_token(), Some("RT1"));
    assert_eq!(h.vault.load().unwrap(), Some(current));
}

#[tokio::test]
async fn test_rejected_refresh_token_invalidates_once() {
    let h = Harness::new();
    h.signed_in("AT1", Some("RT1"), 3600).await;
    let mut rx = h.session.subscribe();

    h.advance_to(3550);
    h.provider.push_refresh(Err(AuthError::InvalidRefreshToken));

    let outcome = h.session.on_refresh_due().await.unwrap();
    assert!(matches!(
        outcome,
        RefreshOutcome::Invalidated(InvalidReason::RefreshTokenRejected)
    ));
    assert_eq!(h.session.status(), SessionStatus::Invalid);
    assert!(h.session.current_credential().is_none());
    assert!(h.vault.raw_credential().unwrap().is_none());
    assert!(h.session.next_refresh_deadline().is_none());

    assert!(matches!(
        h.session.on_refresh_due().await.unwrap(),
        RefreshOutcome::Skipped
    ));
    assert_eq!(
        drain(&mut rx),
        vec![SessionEvent::Invalid {
            reason: InvalidReason::RefreshTokenRejected
        }]
    );
}

#[tokio::test]
async fn test_second_refresh_while_in_flight_is_coalesced() {
    let h = Harness::new();
    h.signed_in("AT1", Some("RT1"), 3600).await;
    h.advance_to(3550);

    let gate = h.provider.gate_refresh();
    h.provider
        .push_refresh(Ok(credential("AT2", Some("RT2"), 3550, 3600)));

    let session = h.session.clone();
    let first = tokio::spawn(async move { session.on_refresh_due().await });
    h.provider.refresh_started.notified().await;

    assert_eq!(h.session.phase(), SessionPhase::Refreshing);
    assert_eq!(h.session.status(), SessionStatus::SignedIn);
    assert_eq!(
        h.session.current_credential().map(|c| c.access_token().to_string()),
        Some("AT1".to_string())
    );
    assert!(matches!(
        h.session.on_refresh_due().await.unwrap(),
        RefreshOutcome::AlreadyInFlight
    ));

    gate.notify_one();
    assert!(matches!(
        first.await.unwrap().unwrap(),
        RefreshOutcome::Refreshed(_)
    ));
    assert_eq!(h.provider.refresh_calls(), 1);
}

#[tokio::test]
async fn test_sign_out_during_refresh_discards_result() {
    let h = Harness::new();
    h.signed_in("AT1", Some("RT1"), 3600).await;
    h.advance_to(3550);

    let gate = h.provider.gate_refresh();
    h.provider
        .push_refresh(Ok(credential("AT2", Some("RT2"), 3550, 3600)));

    let session = h.session.clone();
    let refresh = tokio::spawn(async move { session.on_refresh_due().await });
    h.provider.refresh_started.notified().await;

    h.session.sign_out().unwrap();
    gate.notify_one();

    assert!(matches!(
        refresh.await.unwrap().unwrap(),
        RefreshOutcome::Superseded
    ));
    assert_eq!(h.session.status(), SessionStatus::SignedOut);
    assert!(h.vault.raw_credential().unwrap().is_none());
}

#[tokio::test]
async fn test_network_failure_keeps_credential_and_backs_off() {
    let h = Harness::new();
    let original = h.signed_in("AT1", Some("RT1"), 3600).await;
    h.advance_to(3550);
    h.provider
        .push_refresh(Err(AuthError::Network("connection refused".into())));

    let retry_at = match h.session.on_refresh_due().await.unwrap() {
        RefreshOutcome::RetryScheduled { retry_at, error } => {
            assert!(matches!(error, AuthError::Network(_)));
            retry_at
        }
        other => panic!("expected retry, got {:?}", other),
    };

    // First jittered delay is drawn from [0, base]
    assert!(retry_at >= at(3550) && retry_at <= at(3552));
    assert_eq!(h.session.next_refresh_deadline(), Some(retry_at));
    assert_eq!(h.session.current_backoff(), secs(4));
    assert_eq!(h.session.phase(), SessionPhase::SignedIn);
    assert_eq!(h.session.current_credential(), Some(original.clone()));
    assert_eq!(h.vault.load().unwrap(), Some(original));

    h.provider.push_refresh(Err(AuthError::Timeout));
    h.session.on_refresh_due().await.unwrap();
    assert_eq!(h.session.current_backoff(), secs(8));

    h.provider
        .push_refresh(Ok(credential("AT2", Some("RT2"), 3550, 3600)));
    h.session.on_refresh_due().await.unwrap();
    assert_eq!(h.session.current_backoff(), secs(2));
}

#[tokio::test]
async fn test_backoff_never_decreases_and_stays_capped() {
    let config = SessionConfig {
        refresh: RefreshConfig {
            backoff_base: secs(2),
            backoff_max: secs(10),
            ..RefreshConfig::default()
        },
        ..SessionConfig::default()
    };
    let h = Harness::with_config(config);
    h.signed_in("AT1", Some("RT1"), 3600).await;

    let mut previous = h.session.current_backoff();
    for _ in 0..8 {
        h.provider
            .push_refresh(Err(AuthError::Network("down".into())));
        if let RefreshOutcome::RetryScheduled { retry_at, .. } =
            h.session.on_refresh_due().await.unwrap()
        {
            assert!(retry_at - h.session.now() <= chrono::Duration::seconds(10));
        }
        let backoff = h.session.current_backoff();
        assert!(backoff >= previous);
        assert!(backoff <= secs(10));
        previous = backoff;
    }
    assert_eq!(previous, secs(10));
}

#[tokio::test]
async fn test_repeated_protocol_errors_invalidate() {
    let h = Harness::new();
    h.signed_in("AT1", Some("RT1"), 3600).await;
    h.advance_to(3550);

    for _ in 0..2 {
        h.provider
            .push_refresh(Err(AuthError::Protocol("garbage".into())));
        assert!(matches!(
            h.session.on_refresh_due().await.unwrap(),
            RefreshOutcome::RetryScheduled { .. }
        ));
    }

    h.provider
        .push_refresh(Err(AuthError::Protocol("garbage".into())));
    assert!(matches!(
        h.session.on_refresh_due().await.unwrap(),
        RefreshOutcome::Invalidated(InvalidReason::RepeatedProtocolErrors { count: 3 })
    ));
    assert_eq!(h.session.status(), SessionStatus::Invalid);
}

#[tokio::test]
async fn test_protocol_error_count_resets_after_network_error() {
    let h = Harness::new();
    h.signed_in("AT1", Some("RT1"), 3600).await;
    h.advance_to(3550);

    let script = [
        AuthError::Protocol("garbage".into()),
        AuthError::Protocol("garbage".into()),
        AuthError::Network("down".into()),
        AuthError::Protocol("garbage".into()),
        AuthError::Protocol("garbage".into()),
    ];
    for error in script {
        h.provider.push_refresh(Err(error));
        h.session.on_refresh_due().await.unwrap();
    }
    assert_eq!(h.session.status(), SessionStatus::SignedIn);
}

#[tokio::test]
async fn test_identity_mismatch_is_protocol_error() {
    let h = Harness::new();
    h.signed_in("AT1", Some("RT1"), 3600).await;
    h.advance_to(3550);

    let stranger = identity_session::Credential::from_expires_in(
        "AT2",
        Some("RT2".into()),
        at(3550),
        secs(3600),
        "someone-else",
    )
    .unwrap();
    h.provider.push_refresh(Ok(stranger));

    match h.session.on_refresh_due().await.unwrap() {
        RefreshOutcome::RetryScheduled { error, .. } => {
            assert!(matches!(error, AuthError::Protocol(_)))
        }
        other => panic!("expected retry, got {:?}", other),
    }
    assert_eq!(h.session.current_credential().unwrap().access_token(), "AT1");
}

#[tokio::test]
async fn test_storage_failure_during_refresh_keeps_previous() {
    let h = Harness::new();
    let original = h.signed_in("AT1", Some("RT1"), 3600).await;
    h.advance_to(3550);

    h.store.fail_puts(true);
    h.provider
        .push_refresh(Ok(credential("AT2", Some("RT2"), 3550, 3600)));

    let err = h.session.on_refresh_due().await.unwrap_err();
    assert!(matches!(err, AuthError::Storage(_)));
    assert_eq!(h.session.phase(), SessionPhase::SignedIn);
    assert_eq!(h.session.current_credential(), Some(original.clone()));
    assert_eq!(h.vault.load().unwrap(), Some(original));
    assert!(h.session.next_refresh_deadline().unwrap() >= at(3550));
}

#[tokio::test]
async fn test_delete_failure_rolls_back_invalidation() {
    let h = Harness::new();
    let original = h.signed_in("AT1", Some("RT1"), 3600).await;
    let mut rx = h.session.subscribe();
    h.advance_to(3550);

    h.store.fail_deletes(true);
    h.provider.push_refresh(Err(AuthError::InvalidRefreshToken));

    let err = h.session.on_refresh_due().await.unwrap_err();
    assert!(matches!(err, AuthError::Storage(_)));
    assert_eq!(h.session.status(), SessionStatus::SignedIn);
    assert_eq!(h.session.current_credential(), Some(original));
    assert!(h.session.next_refresh_deadline().is_some());
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_credential_without_refresh_token_expires_to_invalid() {
    let h = Harness::new();
    h.signed_in("AT1", None, 3600).await;
    // Only expiry is left to watch for: expires_at - skew
    assert_eq!(h.session.next_refresh_deadline(), Some(at(3595)));

    h.advance_to(3000);
    assert!(matches!(
        h.session.on_refresh_due().await.unwrap(),
        RefreshOutcome::Skipped
    ));
    assert_eq!(h.provider.refresh_calls(), 0);

    h.advance_to(3595);
    assert!(matches!(
        h.session.on_refresh_due().await.unwrap(),
        RefreshOutcome::Invalidated(InvalidReason::ExpiredWithoutRefreshToken)
    ));
    assert!(h.vault.raw_credential().unwrap().is_none());
}

#[tokio::test]
async fn test_refresh_skipped_when_signed_out() {
    let h = Harness::new();
    assert!(matches!(
        h.session.on_refresh_due().await.unwrap(),
        RefreshOutcome::Skipped
    ));
    assert_eq!(h.provider.refresh_calls(), 0);
}

#[tokio::test]
async fn test_refresh_driver_runs_due_refresh() {
    let h = Harness::new();
    h.signed_in("AT1", Some("RT1"), 3600).await;
    let mut rx = h.session.subscribe();

    h.advance_to(3550);
    h.provider
        .push_refresh(Ok(credential("AT2", Some("RT2"), 3550, 3650)));
    let driver = h.session.spawn_refresh_driver();

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, SessionEvent::CredentialRefreshed { .. }));
    assert_eq!(h.session.current_credential().unwrap().access_token(), "AT2");
    assert_eq!(h.session.next_refresh_deadline(), Some(at(7140)));

    driver.stop().await;
}

#[tokio::test]
async fn test_expired_credential_is_withheld_and_refresh_made_due() {
    let h = Harness::new();
    h.signed_in("AT1", Some("RT1"), 3600).await;
    h.provider.push_refresh(Err(AuthError::Network("down".into())));
    h.session.on_refresh_due().await.unwrap();

    // Skew counts: 5s before expires_at is already expired
    h.advance_to(3595);
    assert!(h.session.current_credential().is_none());
    assert!(h.session.next_refresh_deadline().unwrap() <= at(3595));
}

#[tokio::test]
async fn test_refresh_driver_stops() {
    let h = Harness::new();
    let driver = h.session.spawn_refresh_driver();
    assert!(!driver.is_finished());
    tokio::time::timeout(Duration::from_secs(5), driver.stop())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_randomized_interleaving_never_exposes_expired_credential() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let h = Harness::new();
    let skew = h.session.config().clock_skew_tolerance;
    h.signed_in("AT0", Some("RT0"), 3600).await;

    for step in 0..500 {
        match rng.gen_range(0..10) {
            0..=2 => h.clock.advance(secs(rng.gen_range(0..1800))),
            3..=5 => {
                let now = h.clock.now_offset();
                let result = match rng.gen_range(0..10) {
                    0..=1 => Err(AuthError::Network("down".into())),
                    2 => Err(AuthError::Timeout),
                    3 => Err(AuthError::Protocol("garbage".into())),
                    4 => Err(AuthError::InvalidRefreshToken),
                    _ => Ok(credential(
                        &format!("AT{}", step),
                        Some(&format!("RT{}", step)),
                        now,
                        rng.gen_range(60..7200),
                    )),
                };
                h.provider.clear_refresh();
                h.provider.push_refresh(result);
                let _ = h.session.on_refresh_due().await;
            }
            6 => {
                let reachability = if rng.gen_bool(0.5) {
                    Reachability::Reachable
                } else {
                    Reachability::Unreachable
                };
                h.session.on_reachability_change(reachability);
            }
            7..=8 => {
                if h.session.status() != SessionStatus::SignedIn {
                    let now = h.clock.now_offset();
                    h.provider.clear_exchange();
                    h.provider.push_exchange(Ok(credential(
                        &format!("AT{}", step),
                        Some(&format!("RT{}", step)),
                        now,
                        rng.gen_range(60..7200),
                    )));
                    let _ = h.session.sign_in("code").await;
                }
            }
            _ => {
                if rng.gen_bool(0.2) {
                    h.session.sign_out().unwrap();
                }
            }
        }

        let now = h.session.now();
        if let Some(cred) = h.session.current_credential() {
            assert!(
                !cred.is_expired(now, skew),
                "step {}: expired credential handed out",
                step
            );
            assert_eq!(h.session.status(), SessionStatus::SignedIn);
        }

        let persisted = h.vault.raw_credential().unwrap();
        match h.session.status() {
            SessionStatus::SignedIn => assert!(persisted.is_some(), "step {}", step),
            _ => assert!(persisted.is_none(), "step {}", step),
        }
    }
}
