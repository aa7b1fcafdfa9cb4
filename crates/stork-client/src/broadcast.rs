//! Same-device fallback tier.
//!
//! When neither a direct channel nor the relay is available, frames are
//! written to a store shared by every client instance on the machine.
//! Each instance polls the store and claims entries addressed to its own
//! identity; claiming removes the entry so it is delivered exactly once.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stork_shared::{ClientFrame, PeerId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEntry {
    pub target_peer_id: PeerId,
    pub from_peer_id: PeerId,
    pub frame: ClientFrame,
}

pub trait BroadcastStore: Send + Sync {
    fn publish(&self, key: &str, entry: &BroadcastEntry) -> Result<()>;

    /// Remove and return every entry addressed to `identity`, oldest first.
    fn take_for(&self, identity: &PeerId) -> Result<Vec<BroadcastEntry>>;
}

/// Store key for a frame: kind prefix, publish time, then a random suffix,
/// so lexical order follows publish order.
pub fn entry_key(frame: &ClientFrame) -> String {
    let prefix = match frame {
        ClientFrame::GroupUpdate { .. } => "group_update",
        ClientFrame::AvatarUpdate { .. } => "avatar_update",
        _ => "message",
    };
    format!(
        "{}_{:013}_{}",
        prefix,
        chrono::Utc::now().timestamp_millis().max(0),
        Uuid::new_v4().simple()
    )
}

/// Claim entries addressed to `identity` every `interval` and forward each
/// non-empty batch on `batches`.
///
/// Store access runs on the blocking pool. `batches` is bounded, so a busy
/// consumer holds the poller back instead of letting claimed entries pile
/// up. The task ends once the receiver is dropped.
pub fn spawn_poller(
    store: Arc<dyn BroadcastStore>,
    identity: PeerId,
    interval: Duration,
    batches: mpsc::Sender<Vec<BroadcastEntry>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !batches.is_closed() {
            ticker.tick().await;
            let store = store.clone();
            let identity = identity.clone();
            match tokio::task::spawn_blocking(move || store.take_for(&identity)).await {
                Ok(Ok(entries)) if entries.is_empty() => {}
                Ok(Ok(entries)) => {
                    if batches.send(entries).await.is_err() {
                        break;
                    }
                }
                Ok(Err(e)) => warn!(error = %e, "Local broadcast poll failed"),
                Err(e) => warn!(error = %e, "Local broadcast poll aborted"),
            }
        }
        debug!("Local broadcast poller stopped");
    })
}

/// In-process store; clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroadcastStore {
    entries: Arc<Mutex<BTreeMap<String, BroadcastEntry>>>,
}

impl MemoryBroadcastStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BroadcastStore for MemoryBroadcastStore {
    fn publish(&self, key: &str, entry: &BroadcastEntry) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), entry.clone());
        Ok(())
    }

    fn take_for(&self, identity: &PeerId) -> Result<Vec<BroadcastEntry>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let keys: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| &entry.target_peer_id == identity)
            .map(|(key, _)| key.clone())
            .collect();
        Ok(keys
            .into_iter()
            .filter_map(|key| entries.remove(&key))
            .collect())
    }
}

/// Directory-backed store shared between processes: one JSON file per
/// entry. A reader claims an entry by deleting its file; whoever deletes
/// it first owns it.
#[derive(Debug, Clone)]
pub struct DirBroadcastStore {
    dir: PathBuf,
}

impl DirBroadcastStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "Opened local broadcast store");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl BroadcastStore for DirBroadcastStore {
    fn publish(&self, key: &str, entry: &BroadcastEntry) -> Result<()> {
        let json = serde_json::to_vec(entry)?;
        // Write then rename, so readers never see a partial file.
        let staging = self.dir.join(format!(".{key}.tmp"));
        fs::write(&staging, json)?;
        fs::rename(&staging, self.dir.join(format!("{key}.json")))?;
        Ok(())
    }

    fn take_for(&self, identity: &PeerId) -> Result<Vec<BroadcastEntry>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut taken = Vec::new();
        for path in paths {
            let raw = match fs::read(&path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let entry: BroadcastEntry = match serde_json::from_slice(&raw) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Skipping unreadable broadcast entry"
                    );
                    continue;
                }
            };
            if &entry.target_peer_id != identity {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => taken.push(entry),
                // Another instance claimed it first.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(taken)
    }
}
