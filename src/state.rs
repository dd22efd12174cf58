//! Durable per-channel delivery cursors.
//!
//! One JSON file holds the last fully delivered message id of every channel:
//!
//! ```json
//! { "last_message_ids": { "123456": "987654321" } }
//! ```
//!
//! Writes go to a sibling `.tmp` file that is renamed over the target, so a
//! crash leaves either the old or the new file readable.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::StateError;
use crate::pipeline::types::MessageId;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    last_message_ids: BTreeMap<String, String>,
}

/// File-backed cursor store shared by all channels.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    cursors: Mutex<BTreeMap<String, MessageId>>,
    channel_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Bumped on every in-memory change.
    generation: AtomicU64,
    /// Generation last written to disk. Held while writing.
    written: tokio::sync::Mutex<u64>,
}

impl StateStore {
    /// Load cursors from `path`.
    ///
    /// A missing file yields no cursors. A file that does not parse is moved
    /// aside to `<name>.bak` and loading continues empty. A file that cannot
    /// be read is an error.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let cursors = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<StateFile>(&raw) {
                Ok(file) => parse_cursors(file),
                Err(e) => {
                    let backup = backup_path(&path);
                    warn!(
                        path = %path.display(),
                        backup = %backup.display(),
                        error = %e,
                        "State file is corrupted; moving it aside and starting fresh"
                    );
                    tokio::fs::rename(&path, &backup)
                        .await
                        .map_err(|source| StateError::Write {
                            path: backup.clone(),
                            source,
                        })?;
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StateError::Read { path, source }),
        };

        debug!(path = %path.display(), channels = cursors.len(), "Loaded delivery cursors");

        Ok(Self {
            path,
            cursors: Mutex::new(cursors),
            channel_locks: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            written: tokio::sync::Mutex::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last persisted cursor of a channel.
    pub fn get(&self, channel: &str) -> Option<MessageId> {
        self.cursors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .copied()
    }

    /// All cursors.
    pub fn snapshot(&self) -> BTreeMap<String, MessageId> {
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Advance a channel's cursor to `id` and persist it.
    ///
    /// Cursors never move backwards: an id at or below the current cursor is
    /// ignored and `Ok(false)` returned. Advances of one channel are
    /// serialized; advances of different channels share a single file write
    /// when they overlap.
    pub async fn advance(&self, channel: &str, id: MessageId) -> Result<bool, StateError> {
        let lock = self.channel_lock(channel);
        let _guard = lock.lock().await;

        let target = {
            let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
            if cursors.get(channel).is_some_and(|current| *current >= id) {
                return Ok(false);
            }
            cursors.insert(channel.to_string(), id);
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        let mut written = self.written.lock().await;
        if *written >= target {
            // A concurrent advance already wrote a snapshot containing ours.
            return Ok(true);
        }

        let (snapshot, generation) = {
            let cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
            (cursors.clone(), self.generation.load(Ordering::SeqCst))
        };
        self.write(&snapshot).await?;
        *written = generation;

        debug!(channel, message_id = %id, "Cursor advanced");
        Ok(true)
    }

    fn channel_lock(&self, channel: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.channel_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel.to_string())
            .or_default()
            .clone()
    }

    async fn write(&self, cursors: &BTreeMap<String, MessageId>) -> Result<(), StateError> {
        let file = StateFile {
            last_message_ids: cursors.iter().map(|(k, v)| (k.clone(), v.to_string())).collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(write_error(parent))?;
        }

        let tmp = sibling(&self.path, "tmp");
        let mut out = tokio::fs::File::create(&tmp).await.map_err(write_error(&tmp))?;
        out.write_all(json.as_bytes()).await.map_err(write_error(&tmp))?;
        out.sync_all().await.map_err(write_error(&tmp))?;
        drop(out);

        if let Err(source) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StateError::Write {
                path: self.path.clone(),
                source,
            });
        }
        Ok(())
    }
}

fn parse_cursors(file: StateFile) -> BTreeMap<String, MessageId> {
    let mut cursors = BTreeMap::new();
    for (channel, raw) in file.last_message_ids {
        match raw.parse::<MessageId>() {
            Ok(id) => {
                cursors.insert(channel, id);
            }
            Err(_) => warn!(channel = %channel, value = %raw, "Ignoring unparsable cursor in state file"),
        }
    }
    cursors
}

fn write_error(path: &Path) -> impl FnOnce(std::io::Error) -> StateError {
    let path = path.to_path_buf();
    move |source| StateError::Write { path, source }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{suffix}"));
    path.with_file_name(name)
}

fn backup_path(path: &Path) -> PathBuf {
    sibling(path, "bak")
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::load(dir.path().join("state.json")).await.unwrap();
        assert!(store.snapshot().is_empty());
        assert_eq!(store.get("c1"), None);
    }

    #[tokio::test]
    async fn advance_persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::load(&path).await.unwrap();
        assert!(store.advance("c1", MessageId(100)).await.unwrap());
        assert!(store.advance("c2", MessageId(7)).await.unwrap());

        let reloaded = StateStore::load(&path).await.unwrap();
        assert_eq!(reloaded.get("c1"), Some(MessageId(100)));
        assert_eq!(reloaded.get("c2"), Some(MessageId(7)));

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"last_message_ids\""));
        assert!(raw.contains("\"100\""));
        assert!(!sibling(&path, "tmp").exists());
    }

    #[tokio::test]
    async fn cursor_never_moves_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::load(dir.path().join("state.json")).await.unwrap();
        store.advance("c1", MessageId(50)).await.unwrap();
        assert!(!store.advance("c1", MessageId(40)).await.unwrap());
        assert!(!store.advance("c1", MessageId(50)).await.unwrap());
        assert_eq!(store.get("c1"), Some(MessageId(50)));
    }

    #[tokio::test]
    async fn corrupted_file_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = StateStore::load(&path).await.unwrap();
        assert!(store.snapshot().is_empty());
        assert!(!path.exists());
        assert_eq!(
            std::fs::read_to_string(backup_path(&path)).unwrap(),
            "{ not json"
        );
    }

    #[tokio::test]
    async fn unreadable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory at the state path cannot be read as a file.
        let path = dir.path().join("state.json");
        std::fs::create_dir(&path).unwrap();

        let err = StateStore::load(&path).await.unwrap_err();
        assert!(matches!(err, StateError::Read { .. }));
    }

    #[tokio::test]
    async fn unparsable_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"last_message_ids": {"a": "12", "b": "oops"}}"#).unwrap();

        let store = StateStore::load(&path).await.unwrap();
        assert_eq!(store.get("a"), Some(MessageId(12)));
        assert_eq!(store.get("b"), None);
    }

    #[tokio::test]
    async fn concurrent_advances_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let store = Arc::new(StateStore::load(&path).await.unwrap());

        let tasks = (0..20u64).map(|i| {
            let store = store.clone();
            tokio::spawn(async move { store.advance(&format!("c{}", i % 5), MessageId(i)).await })
        });
        for result in join_all(tasks).await {
            result.unwrap().unwrap();
        }

        let reloaded = StateStore::load(&path).await.unwrap();
        for c in 0..5u64 {
            assert_eq!(reloaded.get(&format!("c{c}")), Some(MessageId(15 + c)));
        }
    }
}
