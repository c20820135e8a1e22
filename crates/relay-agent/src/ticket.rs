//! On-disk session ticket
//!
//! The relay hands out a fresh ticket on every successful register or
//! resume. It is persisted so a restarted agent can still resume, and taken
//! (read and deleted) at the start of each attempt so a ticket is never
//! presented twice.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("Failed to access ticket file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to encode ticket: {0}")]
    Encode(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTicket {
    pub ticket: Vec<u8>,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TicketFile {
    backend_id: String,
    ticket: String,
    issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionTicketStore {
    path: PathBuf,
    backend_id: String,
}

impl SessionTicketStore {
    pub fn new(path: impl Into<PathBuf>, backend_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            backend_id: backend_id.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> TicketError {
        TicketError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// The stored ticket for this backend, if any
    ///
    /// A file that cannot be parsed, or that belongs to another backend id,
    /// counts as no ticket.
    pub async fn load(&self) -> Result<Option<StoredTicket>, TicketError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };

        let file: TicketFile = match serde_yaml::from_str(&contents) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Ignoring unreadable session ticket");
                return Ok(None);
            }
        };
        if file.backend_id != self.backend_id {
            debug!(
                stored = %file.backend_id,
                expected = %self.backend_id,
                "Ignoring session ticket of another backend"
            );
            return Ok(None);
        }
        match STANDARD.decode(file.ticket.as_bytes()) {
            Ok(ticket) => Ok(Some(StoredTicket {
                ticket,
                issued_at: file.issued_at,
            })),
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Ignoring malformed session ticket");
                Ok(None)
            }
        }
    }

    /// Replace the stored ticket; written to a temp file and renamed into place
    pub async fn save(&self, ticket: &[u8]) -> Result<(), TicketError> {
        let file = TicketFile {
            backend_id: self.backend_id.clone(),
            ticket: STANDARD.encode(ticket),
            issued_at: Utc::now(),
        };
        let contents = serde_yaml::to_string(&file)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        debug!(path = ?self.path, "Session ticket saved");
        Ok(())
    }

    /// Load and delete in one step
    pub async fn take(&self) -> Result<Option<StoredTicket>, TicketError> {
        let ticket = self.load().await?;
        self.clear().await?;
        Ok(ticket)
    }

    pub async fn clear(&self) -> Result<(), TicketError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir, backend_id: &str) -> SessionTicketStore {
        SessionTicketStore::new(dir.path().join("session.ticket"), backend_id)
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(store(&dir, "api").load().await.unwrap(), None);
        assert!(store(&dir, "api").clear().await.is_ok());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, "api");
        store.save(&[1, 2, 3, 255]).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.ticket, vec![1, 2, 3, 255]);
        // No temp file left behind
        assert!(!dir.path().join("session.ticket.tmp").exists());
    }

    #[tokio::test]
    async fn test_take_consumes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, "api");
        store.save(b"ticket").await.unwrap();

        assert!(store.take().await.unwrap().is_some());
        assert!(store.take().await.unwrap().is_none());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_save_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, "api");
        store.save(b"first").await.unwrap();
        store.save(b"second").await.unwrap();
        assert_eq!(store.load().await.unwrap().unwrap().ticket, b"second".to_vec());
    }

    #[tokio::test]
    async fn test_other_backend_ignored() {
        let dir = tempfile::tempdir().unwrap();
        store(&dir, "api").save(b"ticket").await.unwrap();
        assert_eq!(store(&dir, "web").load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_file_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, "api");
        std::fs::write(store.path(), "{{not yaml").unwrap();
        assert_eq!(store.load().await.unwrap(), None);

        std::fs::write(
            store.path(),
            "backend_id: api\nticket: '%%%'\nissued_at: 2024-01-01T00:00:00Z\n",
        )
        .unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionTicketStore::new(dir.path().join("nested/dir/ticket"), "api");
        store.save(b"x").await.unwrap();
        assert!(store.load().await.unwrap().is_some());
    }
}
