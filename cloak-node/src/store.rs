//! Durable per-identity message logs and the contact cache.
//!
//! One JSON file per identity under the data dir. Writes are serialized by a
//! process-wide lock; a writer that finds the lock held retries after a short
//! delay instead of interleaving with the holder. Reads never fail past this
//! boundary: missing, empty or corrupt files yield empty sequences.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cloak_core::identity::PeerId;
use cloak_core::store::{self, ContactCache, ContactMeta, Message};
use tokio::sync::Mutex;
use tracing::warn;

const WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum StoreIoError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] store::StoreError),
}

pub struct MessageStore {
    data_dir: PathBuf,
    zero_trace: bool,
    write_lock: Arc<Mutex<()>>,
}

impl MessageStore {
    pub fn new(data_dir: PathBuf, zero_trace: bool) -> Self {
        MessageStore {
            data_dir,
            zero_trace,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn zero_trace(&self) -> bool {
        self.zero_trace
    }

    fn chat_path(&self, peer: &PeerId) -> PathBuf {
        self.data_dir.join(format!("chat_{}.json", sanitize(peer.as_str())))
    }

    fn contacts_path(&self) -> PathBuf {
        self.data_dir.join("contacts.json")
    }

    async fn acquire_write(&self) -> tokio::sync::OwnedMutexGuard<()> {
        loop {
            match self.write_lock.clone().try_lock_owned() {
                Ok(guard) => return guard,
                Err(_) => tokio::time::sleep(WRITE_RETRY_DELAY).await,
            }
        }
    }

    /// Load the durable log for `peer`. Never fails: tolerant of missing,
    /// empty and corrupt files.
    pub async fn load_history(&self, peer: &PeerId) -> Vec<Message> {
        match tokio::fs::read(self.chat_path(peer)).await {
            Ok(bytes) => store::decode_history(&bytes),
            Err(_) => Vec::new(),
        }
    }

    /// Append one message. A no-op in no-trace mode.
    pub async fn append(&self, peer: &PeerId, msg: &Message) -> Result<(), StoreIoError> {
        if self.zero_trace {
            return Ok(());
        }
        let _guard = self.acquire_write().await;
        tokio::fs::create_dir_all(&self.data_dir).await?;
        let mut history = self.load_history(peer).await;
        history.push(msg.clone());
        let bytes = store::encode_history(&history)?;
        tokio::fs::write(self.chat_path(peer), bytes).await?;
        Ok(())
    }

    /// Rewrite the whole log, used after a replay marks entries delivered.
    pub async fn replace_history(
        &self,
        peer: &PeerId,
        history: &[Message],
    ) -> Result<(), StoreIoError> {
        if self.zero_trace {
            return Ok(());
        }
        let _guard = self.acquire_write().await;
        tokio::fs::create_dir_all(&self.data_dir).await?;
        let bytes = store::encode_history(history)?;
        tokio::fs::write(self.chat_path(peer), bytes).await?;
        Ok(())
    }

    /// Identities with stored chats, most recently written first.
    pub async fn recent_chats(&self) -> Vec<PeerId> {
        let mut entries: Vec<(PeerId, std::time::SystemTime)> = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.data_dir).await {
            Ok(d) => d,
            Err(_) => return Vec::new(),
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let peer = match name
                .strip_prefix("chat_")
                .and_then(|n| n.strip_suffix(".json"))
            {
                Some(p) if !p.is_empty() => PeerId::new(p),
                _ => continue,
            };
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(_) => continue,
            };
            entries.push((peer, modified));
        }
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.into_iter().map(|(p, _)| p).collect()
    }

    pub async fn delete_chat(&self, peer: &PeerId) -> bool {
        let _guard = self.acquire_write().await;
        tokio::fs::remove_file(self.chat_path(peer)).await.is_ok()
    }

    pub async fn clear_all(&self) {
        let _guard = self.acquire_write().await;
        let mut dir = match tokio::fs::read_dir(&self.data_dir).await {
            Ok(d) => d,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("chat_") || name == "contacts.json" {
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    warn!(file = %name, error = %e, "failed to remove log file");
                }
            }
        }
    }

    pub async fn load_contacts(&self) -> ContactCache {
        match tokio::fs::read(self.contacts_path()).await {
            Ok(bytes) => store::decode_contacts(&bytes),
            Err(_) => ContactCache::new(),
        }
    }

    /// Merge one contact's metadata into the cache file. Skipped in no-trace
    /// mode like everything else.
    pub async fn save_contact(&self, peer: &PeerId, meta: ContactMeta) -> Result<(), StoreIoError> {
        if self.zero_trace {
            return Ok(());
        }
        let _guard = self.acquire_write().await;
        tokio::fs::create_dir_all(&self.data_dir).await?;
        let mut cache = self.load_contacts().await;
        cache.insert(peer.clone(), meta);
        let bytes = store::encode_contacts(&cache)?;
        tokio::fs::write(self.contacts_path(), bytes).await?;
        Ok(())
    }
}

/// Peer IDs and announced file names become file name components; keep only
/// filesystem-safe bytes.
pub(crate) fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
