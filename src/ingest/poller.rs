//! Perpetual poll loop: One ingestion run per tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::ingest::IngestService;

/// Spawn a background task that runs ingestion every `interval`.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop polling;
/// the loop exits at the next tick. A failed run is logged and the loop
/// carries on.
pub fn spawn_poller(
    service: Arc<IngestService>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Mail poller started, polling every {}ms", interval.as_millis());

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Mail poller shutting down");
                return;
            }

            if let Err(e) = service.run_once().await {
                error!("Ingestion run failed: {e}");
            }
        }
    });

    (handle, shutdown_flag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use crate::config::IngestPolicy;
    use crate::error::MailboxError;
    use crate::mail::{Mailbox, MailboxConnector};
    use crate::store::{LibSqlBackend, StoreHandle};

    /// Always refuses, counting attempts.
    struct CountingConnector(Arc<AtomicUsize>);

    #[async_trait]
    impl MailboxConnector for CountingConnector {
        async fn connect(&self) -> Result<Box<dyn Mailbox>, MailboxError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(MailboxError::ConnectFailed {
                host: "imap.test".into(),
                reason: "refused".into(),
            })
        }
    }

    #[tokio::test]
    async fn keeps_polling_after_failed_runs_and_stops_on_flag() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let service = Arc::new(IngestService::new(
            Arc::new(StoreHandle::from_backend(backend)),
            Arc::new(CountingConnector(Arc::clone(&attempts))),
            "INBOX",
            IngestPolicy::default(),
        ));

        let (handle, shutdown) = spawn_poller(service, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(80)).await;
        shutdown.store(true, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(attempts.load(Ordering::SeqCst) >= 2);
    }
}
