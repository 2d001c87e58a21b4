//! Network reachability signal.
//!
//! Any source can drive the session through
//! [`SessionStateMachine::on_reachability_change`]. [`TcpProbe`] is a simple
//! built-in source that dials the provider host periodically.

use crate::session::SessionStateMachine;
use identity_config_and_utils::ReachabilitySettings;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    Reachable,
    Unreachable,
}

/// Periodic TCP connect probe.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
    interval: Duration,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let defaults = ReachabilitySettings::default();
        Self {
            host: host.into(),
            port,
            interval: Duration::from_secs(defaults.probe_interval_secs),
            timeout: Duration::from_secs(defaults.probe_timeout_secs),
        }
    }

    pub fn from_settings(host: impl Into<String>, settings: &ReachabilitySettings) -> Self {
        Self::new(host, settings.probe_port)
            .with_interval(Duration::from_secs(settings.probe_interval_secs))
            .with_timeout(Duration::from_secs(settings.probe_timeout_secs))
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// One probe: can a TCP connection be opened within the timeout?
    pub async fn check(&self) -> Reachability {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(_)) => Reachability::Reachable,
            Ok(Err(e)) => {
                debug!(host = %self.host, port = self.port, error = %e, "Probe connect failed");
                Reachability::Unreachable
            }
            Err(_) => {
                debug!(host = %self.host, port = self.port, "Probe timed out");
                Reachability::Unreachable
            }
        }
    }

    /// Probe every interval and publish changes. The task ends once every
    /// receiver is dropped.
    pub fn spawn(self) -> (watch::Receiver<Reachability>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(Reachability::Reachable);

        let handle = tokio::spawn(async move {
            loop {
                let observed = self.check().await;
                tx.send_if_modified(|current| {
                    if *current == observed {
                        false
                    } else {
                        *current = observed;
                        true
                    }
                });

                tokio::select! {
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
            debug!("Reachability probe stopped");
        });

        (rx, handle)
    }
}

/// Feed every value published on `rx` into the session, starting with the
/// current one. Ends when the sender is dropped.
pub fn forward_reachability(
    session: Arc<SessionStateMachine>,
    mut rx: watch::Receiver<Reachability>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let initial = *rx.borrow_and_update();
        session.on_reachability_change(initial);

        while rx.changed().await.is_ok() {
            let reachability = *rx.borrow_and_update();
            session.on_reachability_change(reachability);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_probe_reachable_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = TcpProbe::new("127.0.0.1", port).with_timeout(Duration::from_secs(1));
        assert_eq!(probe.check().await, Reachability::Reachable);
    }

    #[tokio::test]
    async fn test_probe_closed_port_is_unreachable() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let probe = TcpProbe::new("127.0.0.1", port).with_timeout(Duration::from_secs(1));
        assert_eq!(probe.check().await, Reachability::Unreachable);
    }

    #[tokio::test]
    async fn test_spawned_probe_publishes_changes() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let probe = TcpProbe::new("127.0.0.1", port)
            .with_interval(Duration::from_millis(20))
            .with_timeout(Duration::from_millis(200));
        let (mut rx, handle) = probe.spawn();

        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*rx.borrow(), Reachability::Unreachable);

        drop(rx);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
