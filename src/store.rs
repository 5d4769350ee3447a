//! Durable host record store.
//!
//! CRUD over a vector of [`HostRecord`]s persisted as pretty JSON at
//! `<data_dir>/hosts.json`. Writes go through a temp file and an atomic
//! rename so readers never observe a partial file. Deletes run a registered
//! pre-delete hook to completion before the record is removed, which is how
//! the session multiplexer gets to tear down live sessions for the host.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;

use crate::host::{HostCandidate, HostId, HostRecord, ValidationError};

/// File name for the persisted host list inside the data directory.
pub const HOSTS_FILE: &str = "hosts.json";

/// Async hook invoked with the record about to be deleted.
pub type PreDeleteHook = dyn Fn(&HostRecord) -> BoxFuture<'static, ()> + Send + Sync;

/// Errors that can occur in store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid host: {0}")]
    Validation(#[from] ValidationError),
    #[error("no host exists with id {0}")]
    NotFound(HostId),
    #[error("failed to read host store {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse host store {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write host store {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize host store: {0}")]
    Serialize(#[from] serde_json::Error),
}

struct StoreInner {
    hosts: Vec<HostRecord>,
}

/// Shared handle to the host record store.
#[derive(Clone)]
pub struct HostStore {
    inner: Arc<RwLock<StoreInner>>,
    path: Option<PathBuf>,
    pre_delete: Arc<RwLock<Option<Arc<PreDeleteHook>>>>,
}

impl std::fmt::Debug for HostStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl HostStore {
    /// Open the store backed by `<data_dir>/hosts.json`, loading any
    /// existing records. A missing file means an empty store.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let path = data_dir.join(HOSTS_FILE);
        let hosts = if path.exists() {
            check_store_permissions(&path);
            let contents = std::fs::read_to_string(&path).map_err(|e| StoreError::Read {
                path: path.clone(),
                source: e,
            })?;
            serde_json::from_str(&contents).map_err(|e| StoreError::Parse {
                path: path.clone(),
                source: e,
            })?
        } else {
            Vec::new()
        };
        tracing::info!(path = %path.display(), hosts = hosts.len(), "host store opened");
        Ok(Self {
            inner: Arc::new(RwLock::new(StoreInner { hosts })),
            path: Some(path),
            pre_delete: Arc::new(RwLock::new(None)),
        })
    }

    /// An unpersisted store. Used by tests and ephemeral setups.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner { hosts: Vec::new() })),
            path: None,
            pre_delete: Arc::new(RwLock::new(None)),
        }
    }

    /// Register the hook run before any record is removed. Replaces a
    /// previously registered hook.
    pub fn on_pre_delete<F>(&self, hook: F)
    where
        F: Fn(&HostRecord) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        *self.pre_delete.write() = Some(Arc::new(hook));
    }

    /// All records in insertion order.
    pub fn list(&self) -> Vec<HostRecord> {
        self.inner.read().hosts.clone()
    }

    /// Validate a candidate, assign it a fresh id, persist, and return the
    /// stored record. The store is unchanged on any failure.
    pub fn add(&self, candidate: HostCandidate) -> Result<HostRecord, StoreError> {
        let record = candidate.into_record()?;
        let mut inner = self.inner.write();
        inner.hosts.push(record.clone());
        if let Err(e) = self.persist(&inner.hosts) {
            inner.hosts.pop();
            return Err(e);
        }
        tracing::info!(id = %record.id, name = %record.name, "host added");
        Ok(record)
    }

    /// Fetch one record by id.
    pub fn get(&self, id: HostId) -> Result<HostRecord, StoreError> {
        self.inner
            .read()
            .hosts
            .iter()
            .find(|h| h.id == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    /// Delete a record. Runs the pre-delete hook to completion first, so
    /// any live session for the host is torn down before the record goes.
    pub async fn delete(&self, id: HostId) -> Result<(), StoreError> {
        let record = self.get(id)?;

        // Clone the hook out of the guard; the await must not hold a lock.
        let hook = self.pre_delete.read().clone();
        if let Some(hook) = hook {
            hook(&record).await;
        }

        let mut inner = self.inner.write();
        let Some(pos) = inner.hosts.iter().position(|h| h.id == id) else {
            // Removed concurrently while the hook ran.
            return Err(StoreError::NotFound(id));
        };
        let removed = inner.hosts.remove(pos);
        if let Err(e) = self.persist(&inner.hosts) {
            inner.hosts.insert(pos, removed);
            return Err(e);
        }
        tracing::info!(id = %id, "host deleted");
        Ok(())
    }

    /// Write the full record list to disk via temp-file-then-rename.
    fn persist(&self, hosts: &[HostRecord]) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let contents = serde_json::to_string_pretty(hosts)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Write {
                path: path.clone(),
                source: e,
            })?;
        }
        let tmp = path.with_extension("json.tmp");
        write_restricted(&tmp, &contents).map_err(|e| StoreError::Write {
            path: tmp.clone(),
            source: e,
        })?;
        std::fs::rename(&tmp, path).map_err(|e| StoreError::Write {
            path: path.clone(),
            source: e,
        })?;
        Ok(())
    }
}

/// Write a file readable only by the owner. Host records carry passwords.
#[cfg(unix)]
fn write_restricted(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents.as_bytes())?;
    file.flush()
}

#[cfg(not(unix))]
fn write_restricted(path: &Path, contents: &str) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

/// Check permissions on the hosts file and warn if world-readable.
///
/// On Unix, checks `st_mode & 0o004` (world-readable bit). If set, logs a
/// warning because the file may contain passwords.
#[cfg(unix)]
fn check_store_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if mode & 0o004 != 0 {
        tracing::warn!(
            "Host store file {} is world-readable (mode {:o}). \
             It may contain passwords -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
fn check_store_permissions(_path: &Path) {}
