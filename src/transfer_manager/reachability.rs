//! Network reachability monitoring.
//!
//! Publishes a coalesced stream of reachability changes to a single
//! subscriber (the manager's event loop). The HTTP probe polls the service
//! endpoint on an interval and reports flips; tests publish directly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Network status as observed by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityStatus {
    Unreachable,
    ReachableWifi,
    ReachableCellular,
}

impl ReachabilityStatus {
    pub fn is_reachable(&self) -> bool {
        !matches!(self, ReachabilityStatus::Unreachable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReachabilityStatus::Unreachable => "unreachable",
            ReachabilityStatus::ReachableWifi => "reachable-wifi",
            ReachabilityStatus::ReachableCellular => "reachable-cellular",
        }
    }
}

/// Shared reachability state.
///
/// Clones share one underlying channel. Duplicate publishes are coalesced:
/// the subscriber only wakes on actual status flips.
#[derive(Clone)]
pub struct Reachability {
    tx: Arc<watch::Sender<ReachabilityStatus>>,
}

impl Reachability {
    pub fn new(initial: ReachabilityStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Publish a status. Returns true if it differed from the current one.
    pub fn publish(&self, status: ReachabilityStatus) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
        if changed {
            info!("Reachability changed to {}", status.as_str());
        }
        changed
    }

    pub fn status(&self) -> ReachabilityStatus {
        *self.tx.borrow()
    }

    pub fn is_reachable(&self) -> bool {
        self.status().is_reachable()
    }

    /// The subscriber half. The manager is the single consumer.
    pub fn subscribe(&self) -> watch::Receiver<ReachabilityStatus> {
        self.tx.subscribe()
    }
}

impl Default for Reachability {
    fn default() -> Self {
        Self::new(ReachabilityStatus::ReachableWifi)
    }
}

/// Polls an HTTP endpoint to detect connectivity loss.
///
/// Interface classification (wifi vs cellular) is platform-specific and not
/// observable from a plain socket; a successful probe reports wifi. The
/// manager only consumes `is_reachable`.
pub struct ReachabilityProbe {
    client: reqwest::Client,
    url: String,
    interval: Duration,
}

impl ReachabilityProbe {
    pub fn new(url: String, interval: Duration, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url,
            interval,
        }
    }

    /// Probe loop. Publishes flips through `reachability` until shutdown.
    pub async fn run(&self, reachability: Reachability, shutdown: CancellationToken) {
        info!(
            "Reachability probe starting against {} (interval={}s)",
            self.url,
            self.interval.as_secs()
        );

        loop {
            let status = match self.client.head(&self.url).send().await {
                Ok(_) => ReachabilityStatus::ReachableWifi,
                Err(e) => {
                    debug!("Reachability probe failed: {}", e);
                    ReachabilityStatus::Unreachable
                }
            };
            reachability.publish(status);

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.cancelled() => {
                    info!("Reachability probe shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_reachable() {
        assert!(!ReachabilityStatus::Unreachable.is_reachable());
        assert!(ReachabilityStatus::ReachableWifi.is_reachable());
        assert!(ReachabilityStatus::ReachableCellular.is_reachable());
    }

    #[tokio::test]
    async fn test_duplicate_publishes_are_coalesced() {
        let reachability = Reachability::new(ReachabilityStatus::ReachableWifi);
        let mut rx = reachability.subscribe();

        // Same status again: no wakeup for the subscriber
        assert!(!reachability.publish(ReachabilityStatus::ReachableWifi));
        assert!(!rx.has_changed().unwrap());

        assert!(reachability.publish(ReachabilityStatus::Unreachable));
        assert!(rx.has_changed().unwrap());
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ReachabilityStatus::Unreachable);

        // Flapping to the same value twice only signals once
        assert!(reachability.publish(ReachabilityStatus::ReachableCellular));
        assert!(!reachability.publish(ReachabilityStatus::ReachableCellular));
    }

    #[test]
    fn test_status_reflects_last_publish() {
        let reachability = Reachability::new(ReachabilityStatus::Unreachable);
        assert!(!reachability.is_reachable());

        reachability.publish(ReachabilityStatus::ReachableCellular);
        assert!(reachability.is_reachable());
        assert_eq!(
            reachability.status(),
            ReachabilityStatus::ReachableCellular
        );
    }
}
