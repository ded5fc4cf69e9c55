//! Persistence layer: LibSQL-backed conversations, ingestion log and
//! operator sessions.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::info;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    ConversationStore, IngestionLog, IngestionLogEntry, LogPage, NewLogEntry, OperatorSession,
    OutcomePatch, SessionStore,
};

use crate::error::DatabaseError;

/// Process-wide store handle.
///
/// The backend is opened on first use and reused by every later run. A failed
/// open leaves the cell empty so the next call retries.
pub struct StoreHandle {
    path: PathBuf,
    backend: OnceCell<Arc<LibSqlBackend>>,
}

impl StoreHandle {
    /// A handle that opens `path` lazily.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backend: OnceCell::new(),
        }
    }

    /// A handle around an already-open backend.
    pub fn from_backend(backend: Arc<LibSqlBackend>) -> Self {
        Self {
            path: PathBuf::new(),
            backend: OnceCell::new_with(Some(backend)),
        }
    }

    /// The shared backend, opening it if this is the first call.
    pub async fn get(&self) -> Result<Arc<LibSqlBackend>, DatabaseError> {
        self.backend
            .get_or_try_init(|| async {
                info!(path = %self.path.display(), "Opening store");
                LibSqlBackend::new_local(&self.path).await.map(Arc::new)
            })
            .await
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_lazily_and_reuses_backend() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data").join("store.db");
        let handle = StoreHandle::new(&path);
        assert!(!path.exists());

        let first = handle.get().await.unwrap();
        let second = handle.get().await.unwrap();
        assert!(path.exists());
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn first_open_can_run_on_a_spawned_task() {
        let tmp = tempfile::tempdir().unwrap();
        let handle = Arc::new(StoreHandle::new(tmp.path().join("spawned.db")));

        let opener = Arc::clone(&handle);
        let backend = tokio::spawn(async move { opener.get().await })
            .await
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&backend, &handle.get().await.unwrap()));
    }

    #[tokio::test]
    async fn wraps_existing_backend() {
        let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let handle = StoreHandle::from_backend(Arc::clone(&backend));
        assert!(Arc::ptr_eq(&handle.get().await.unwrap(), &backend));
    }
}
