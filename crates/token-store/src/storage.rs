//! Durable key-value storage for credential entries
//!
//! `TokenStore` talks to storage through the [`TokenStorage`] trait so the
//! same store runs on a JSON file (CLI, daemons) or an in-process map (tests,
//! ephemeral clients). Backends may also offer a change feed that fires when
//! another execution context writes the same storage.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Raw string entries as they sit in storage.
pub type StorageEntries = BTreeMap<String, String>;

/// Boxed future returned by storage operations (dyn-compatible trait).
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Notifications that the underlying storage changed.
///
/// Holds whatever keeps the notification source alive (e.g. a file watcher);
/// dropping the feed stops notifications.
pub struct ChangeFeed {
    rx: mpsc::UnboundedReceiver<()>,
    _watcher: Option<RecommendedWatcher>,
}

impl ChangeFeed {
    /// Wait for the next change. Returns `None` once the source is gone.
    pub async fn changed(&mut self) -> Option<()> {
        self.rx.recv().await?;
        // Coalesce bursts (temp write + rename) into one notification.
        while self.rx.try_recv().is_ok() {}
        Some(())
    }
}

/// Backend for the credential entries.
pub trait TokenStorage: Send + Sync {
    /// Read every entry. A missing backing store reads as empty.
    fn load(&self) -> StorageFuture<'_, StorageEntries>;

    /// Replace every entry with `entries`. An empty map removes all state.
    fn persist(&self, entries: StorageEntries) -> StorageFuture<'_, ()>;

    /// Subscribe to external changes, if the backend can report them.
    ///
    /// `Ok(None)` means the caller has to poll.
    fn watch(&self) -> Result<Option<ChangeFeed>> {
        Ok(None)
    }

    /// Short label for logs.
    fn describe(&self) -> String;
}

/// JSON file holding the entries as a flat string map.
///
/// Writes use temp file + rename so readers in other processes never see a
/// torn file; the file is created 0600 on unix since it holds tokens.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStorage for FileStorage {
    fn load(&self) -> StorageFuture<'_, StorageEntries> {
        Box::pin(async move {
            let contents = match tokio::fs::read_to_string(&self.path).await {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %self.path.display(), "token file not found, no stored credentials");
                    return Ok(StorageEntries::new());
                }
                Err(e) => return Err(Error::Io(format!("reading token file: {e}"))),
            };
            if contents.trim().is_empty() {
                return Ok(StorageEntries::new());
            }
            let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(&contents)
                .map_err(|e| Error::StorageParse(format!("parsing token file: {e}")))?;

            // Non-string values (e.g. a JSON null written by another client)
            // are kept as their serialized text and rejected later as placeholders.
            Ok(raw
                .into_iter()
                .map(|(k, v)| match v {
                    serde_json::Value::String(s) => (k, s),
                    other => (k, other.to_string()),
                })
                .collect())
        })
    }

    fn persist(&self, entries: StorageEntries) -> StorageFuture<'_, ()> {
        Box::pin(async move { write_atomic(&self.path, &entries).await })
    }

    fn watch(&self) -> Result<Option<ChangeFeed>> {
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| Error::Watch("token path has no file name".into()))?
            .to_os_string();
        // Watch the directory: atomic renames replace the inode, which a
        // watch on the file itself would lose.
        let dir = parent_dir(&self.path)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    let relevant = matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) && event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(file_name.as_os_str()));
                    if relevant {
                        let _ = tx.send(());
                    }
                }
                Err(e) => warn!(error = %e, "token file watcher error"),
            },
        )
        .map_err(|e| Error::Watch(format!("creating file watcher: {e}")))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Watch(format!("watching {}: {e}", dir.display())))?;
        info!(path = %self.path.display(), "watching token file for external changes");

        Ok(Some(ChangeFeed {
            rx,
            _watcher: Some(watcher),
        }))
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// In-process storage. Clones share the same entries, which lets several
/// independently constructed stores act like separate contexts over one
/// durable backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    shared: Arc<Mutex<MemoryShared>>,
}

#[derive(Debug, Default)]
struct MemoryShared {
    entries: StorageEntries,
    subscribers: Vec<mpsc::UnboundedSender<()>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-populated with raw entries.
    pub fn with_entries(entries: StorageEntries) -> Self {
        let storage = Self::default();
        storage.lock().entries = entries;
        storage
    }

    /// Current raw entries.
    pub fn snapshot(&self) -> StorageEntries {
        self.lock().entries.clone()
    }

    /// Write one raw entry directly, bypassing any `TokenStore`, as another
    /// context sharing the storage would.
    pub fn set_raw(&self, key: &str, value: &str) {
        let mut shared = self.lock();
        shared.entries.insert(key.to_string(), value.to_string());
        notify_subscribers(&mut shared);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn notify_subscribers(shared: &mut MemoryShared) {
    shared.subscribers.retain(|tx| tx.send(()).is_ok());
}

impl TokenStorage for MemoryStorage {
    fn load(&self) -> StorageFuture<'_, StorageEntries> {
        let entries = self.snapshot();
        Box::pin(async move { Ok(entries) })
    }

    fn persist(&self, entries: StorageEntries) -> StorageFuture<'_, ()> {
        {
            let mut shared = self.lock();
            shared.entries = entries;
            notify_subscribers(&mut shared);
        }
        Box::pin(async { Ok(()) })
    }

    fn watch(&self) -> Result<Option<ChangeFeed>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        Ok(Some(ChangeFeed { rx, _watcher: None }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

fn parent_dir(path: &Path) -> Result<PathBuf> {
    match path.parent() {
        Some(p) if p.as_os_str().is_empty() => Ok(PathBuf::from(".")),
        Some(p) => Ok(p.to_path_buf()),
        None => Err(Error::Io("token path has no parent directory".into())),
    }
}

/// Distinguishes temp files of concurrent writers within one process.
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write entries to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target, so a crash mid-write never leaves a torn token file.
async fn write_atomic(path: &Path, entries: &StorageEntries) -> Result<()> {
    let json = serde_json::to_string_pretty(entries)
        .map_err(|e| Error::StorageParse(format!("serializing token entries: {e}")))?;

    let dir = parent_dir(path)?;
    let tmp_path = dir.join(format!(
        ".tokens.tmp.{}.{}",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp token file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting token file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp token file: {e}")))?;

    debug!(path = %path.display(), entries = entries.len(), "persisted token entries");
    Ok(())
}
