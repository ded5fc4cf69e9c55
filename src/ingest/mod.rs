//! Ingestion: The run orchestrator and the two ways of triggering it.

pub mod orchestrator;
pub mod poller;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::IngestPolicy;
use crate::error::IngestError;
use crate::mail::MailboxConnector;
use crate::store::{IngestionLog, StoreHandle};

pub use orchestrator::{Ingestor, RunSummary};
pub use poller::spawn_poller;

/// Everything a run needs, shared by the poll loop and the HTTP trigger.
pub struct IngestService {
    store: Arc<StoreHandle>,
    connector: Arc<dyn MailboxConnector>,
    mailbox: String,
    policy: IngestPolicy,
    log_retention: Option<Duration>,
}

impl IngestService {
    pub fn new(
        store: Arc<StoreHandle>,
        connector: Arc<dyn MailboxConnector>,
        mailbox: impl Into<String>,
        policy: IngestPolicy,
    ) -> Self {
        Self {
            store,
            connector,
            mailbox: mailbox.into(),
            policy,
            log_retention: None,
        }
    }

    /// Prune audit entries older than `retention` before each run.
    pub fn with_log_retention(mut self, retention: Option<Duration>) -> Self {
        self.log_retention = retention;
        self
    }

    pub fn store(&self) -> &Arc<StoreHandle> {
        &self.store
    }

    /// Run one batch.
    pub async fn run_once(&self) -> Result<RunSummary, IngestError> {
        let backend = self.store.get().await?;

        if let Some(retention) = self.log_retention {
            self.prune(backend.as_ref(), retention).await;
        }

        let summary = Ingestor {
            connector: self.connector.as_ref(),
            conversations: backend.as_ref(),
            log: backend.as_ref(),
            mailbox: &self.mailbox,
            policy: self.policy,
        }
        .run()
        .await?;

        info!(
            processed = summary.processed,
            appended = summary.appended,
            skipped = summary.skipped,
            errors = summary.errors.len(),
            "Ingestion run complete"
        );
        Ok(summary)
    }

    async fn prune(&self, log: &dyn IngestionLog, retention: Duration) {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            warn!(?retention, "Log retention out of range, not pruning");
            return;
        };
        match log.prune_older_than(Utc::now() - retention).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Pruned expired ingestion log entries"),
            Err(e) => warn!("Failed to prune ingestion log: {e}"),
        }
    }
}
