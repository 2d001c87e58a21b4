//! Command implementations.

use std::error::Error;
use std::sync::Arc;

use identity_config_and_utils::{Config, Paths};
use identity_session::{
    forward_reachability, AuthError, CredentialVault, OAuthProviderClient, SessionConfig,
    SessionStateMachine, SessionStatus, SystemClock, TcpProbe,
};
use identity_storage::create_store;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

type AppResult<T> = Result<T, Box<dyn Error>>;

pub enum Grant {
    Code { code: String, attempts: u32 },
    Password { email: String, password: String },
    SignUp { email: String, password: String },
}

/// Wire the session from configuration and resume any persisted credential.
pub fn build_session(config: &Config, paths: &Paths) -> AppResult<Arc<SessionStateMachine>> {
    let store = create_store(&paths.credentials_dir())?;
    let vault = CredentialVault::new(store, &config.storage_namespace);
    let clock = Arc::new(SystemClock);
    let client = Arc::new(OAuthProviderClient::new(&config.provider, clock.clone())?);

    let session = Arc::new(SessionStateMachine::new(
        SessionConfig::from(&config.session),
        vault,
        client,
        clock,
    ));

    if let Some(credential) = session.restore()? {
        info!(identity = %credential.identity(), "Resumed session");
    }
    Ok(session)
}

pub async fn sign_in(session: &SessionStateMachine, grant: Grant) -> AppResult<()> {
    if session.status().is_signed_in() {
        return Err(AuthError::AlreadySignedIn.into());
    }

    let credential = match grant {
        Grant::Code { code, attempts } => session.sign_in_with_retry(&code, attempts).await?,
        Grant::Password { email, password } => {
            session.sign_in_with_password(&email, &password).await?
        }
        // Fetches the profile itself
        Grant::SignUp { email, password } => session.sign_up(&email, &password).await?,
    };

    // A failed profile fetch leaves the sign-in in place
    if session.profile().is_none() {
        if let Err(e) = session.update_profile().await {
            warn!(error = %e, "Could not fetch profile after sign-in");
        }
    }

    let name = session
        .profile()
        .and_then(|p| p.preferred_name())
        .unwrap_or_else(|| credential.identity().to_string());
    println!("Signed in as {}", name);
    println!("Access token expires at {}", credential.expires_at());
    Ok(())
}

pub fn status(session: &SessionStateMachine, json: bool) -> AppResult<()> {
    let snapshot = session.snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    match snapshot.status {
        SessionStatus::SignedOut => println!("Signed out"),
        SessionStatus::SignedIn => {
            println!(
                "Signed in as {}",
                snapshot
                    .email_address
                    .or(snapshot.identity)
                    .unwrap_or_default()
            );
            if let Some(expires_at) = snapshot.expires_at {
                println!("  expires at:   {}", expires_at);
            }
            if let Some(deadline) = snapshot.pending_refresh_deadline {
                println!("  next refresh: {}", deadline);
            }
        }
        SessionStatus::Invalid => match snapshot.invalid_reason {
            Some(reason) => println!("Session invalid: {}", reason),
            None => println!("Session invalid"),
        },
    }
    Ok(())
}

pub fn sign_out(session: &SessionStateMachine) -> AppResult<()> {
    if session.sign_out()? {
        println!("Signed out");
    } else {
        println!("Nobody was signed in");
    }
    Ok(())
}

pub async fn profile(session: &SessionStateMachine) -> AppResult<()> {
    let profile = session.update_profile().await?;
    println!("{}", serde_json::to_string_pretty(&profile)?);
    Ok(())
}

/// Run the refresh driver, optionally fed by a TCP reachability probe, and
/// print every session event as a JSON line until ctrl-c.
pub async fn watch(
    session: Arc<SessionStateMachine>,
    config: &Config,
    probe: bool,
) -> AppResult<()> {
    let mut events = session.subscribe();
    let driver = session.spawn_refresh_driver();

    let forwarder = match config.probe_host().filter(|_| probe) {
        Some(host) => {
            info!(host = %host, port = config.reachability.probe_port, "Probing reachability");
            let (rx, _probe_task) = TcpProbe::from_settings(host, &config.reachability).spawn();
            Some(forward_reachability(session.clone(), rx))
        }
        None => None,
    };

    println!("{}", serde_json::to_string(&session.snapshot())?);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event feed lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
    driver.stop().await;
    Ok(())
}
