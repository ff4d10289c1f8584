use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::types::RootStore;

const LOG_TARGET: &str = "referral_ledger.store";

/// Whole-document persistence for the ledger.
///
/// Implementations never hand out a snapshot that fails [`RootStore::validate`]
/// and never persist one either.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn load(&self) -> Result<RootStore, LedgerError>;

    async fn save(&self, store: &RootStore) -> Result<(), LedgerError>;
}

pub fn json_file(path: impl Into<PathBuf>, total_spots: u64) -> Arc<dyn LedgerStore> {
    Arc::new(JsonFileLedgerStore {
        path: path.into(),
        total_spots,
    })
}

pub fn memory(total_spots: u64) -> Arc<dyn LedgerStore> {
    Arc::new(MemoryLedgerStore {
        total_spots,
        inner: Mutex::new(None),
    })
}

fn validated(store: &RootStore) -> Result<(), LedgerError> {
    store.validate().map_err(LedgerError::corrupt)
}

struct JsonFileLedgerStore {
    path: PathBuf,
    total_spots: u64,
}

#[async_trait]
impl LedgerStore for JsonFileLedgerStore {
    async fn load(&self) -> Result<RootStore, LedgerError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                let fresh = RootStore::empty(self.total_spots);
                self.save(&fresh).await?;
                tracing::info!(
                    target: LOG_TARGET,
                    path = %self.path.display(),
                    total_spots = self.total_spots,
                    "created initial ledger store"
                );
                return Ok(fresh);
            }
            Err(error) => {
                return Err(LedgerError::Persistence {
                    message: format!(
                        "failed to read ledger store {}: {error}",
                        self.path.display()
                    ),
                });
            }
        };

        let store = serde_json::from_str::<RootStore>(&raw).map_err(|error| {
            tracing::error!(
                target: LOG_TARGET,
                path = %self.path.display(),
                error = %error,
                "failed to parse ledger store"
            );
            LedgerError::corrupt(format!(
                "failed to parse {}: {error}",
                self.path.display()
            ))
        })?;
        validated(&store)?;
        Ok(store)
    }

    async fn save(&self, store: &RootStore) -> Result<(), LedgerError> {
        validated(store)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|error| {
                    LedgerError::Persistence {
                        message: format!("failed to prepare ledger store directory: {error}"),
                    }
                })?;
            }
        }

        let payload =
            serde_json::to_vec_pretty(store).map_err(|error| LedgerError::Persistence {
                message: format!("failed to encode ledger store payload: {error}"),
            })?;

        let temp_path = self
            .path
            .with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        if let Err(error) = write_synced(&temp_path, &payload).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(LedgerError::Persistence {
                message: format!("failed to write ledger store payload: {error}"),
            });
        }

        if let Err(error) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(LedgerError::Persistence {
                message: format!("failed to finalize ledger store payload: {error}"),
            });
        }

        tracing::debug!(
            target: LOG_TARGET,
            path = %self.path.display(),
            users = store.users.len(),
            used_spots = store.used_spots,
            "ledger store saved"
        );
        Ok(())
    }
}

/// Writes `payload` and flushes it to disk before the caller renames it.
async fn write_synced(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(payload).await?;
    file.sync_all().await
}

struct MemoryLedgerStore {
    total_spots: u64,
    inner: Mutex<Option<RootStore>>,
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn load(&self) -> Result<RootStore, LedgerError> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .get_or_insert_with(|| RootStore::empty(self.total_spots))
            .clone())
    }

    async fn save(&self, store: &RootStore) -> Result<(), LedgerError> {
        validated(store)?;
        *self.inner.lock().await = Some(store.clone());
        Ok(())
    }
}
