//! 待上传记录的内存登记表：容量上限 + 过期时间。
//!
//! Entries expire a fixed TTL after insertion; lookups never refresh them.
//! Expired entries are treated as absent immediately and physically removed
//! on the next write or by [`UploadRegistry::prune_expired`]. When the
//! registry is full, the entry with the oldest insertion time is evicted.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::pending::PendingUpload;

#[derive(Debug)]
struct RegistryEntry {
    upload: PendingUpload,
    inserted_at: Instant,
}

#[derive(Debug)]
pub struct UploadRegistry {
    entries: Mutex<HashMap<String, RegistryEntry>>,
    capacity: usize,
    ttl: Duration,
}

impl UploadRegistry {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// 生成新令牌并登记。
    pub async fn insert(&self, upload: PendingUpload) -> String {
        let token = Uuid::new_v4().to_string();
        self.put(token.clone(), upload).await;
        token
    }

    /// 登记（或覆盖）令牌对应的记录。
    pub async fn put(&self, token: String, upload: PendingUpload) {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, entry| !self.is_expired(entry, now));

        if !entries.contains_key(&token) {
            while entries.len() >= self.capacity {
                let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.inserted_at)
                    .map(|(key, _)| key.clone())
                else {
                    break;
                };
                entries.remove(&oldest);
                debug!(token = %oldest, "evicted oldest pending upload");
            }
        }

        entries.insert(
            token,
            RegistryEntry {
                upload,
                inserted_at: now,
            },
        );
    }

    /// 查询记录（不移除、不续期）。上传处理使用 [`Self::take`]。
    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn get(&self, token: &str) -> Option<PendingUpload> {
        let entries = self.entries.lock().await;
        let now = Instant::now();
        entries
            .get(token)
            .filter(|entry| !self.is_expired(entry, now))
            .map(|entry| entry.upload.clone())
    }

    /// 取出记录；令牌随之失效。
    pub async fn take(&self, token: &str) -> Option<PendingUpload> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let entry = entries.remove(token)?;
        if self.is_expired(&entry, now) {
            return None;
        }
        Some(entry.upload)
    }

    /// 物理删除所有已过期记录，返回删除数量。
    pub async fn prune_expired(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry, now));
        before - entries.len()
    }

    /// Physically stored entries, including expired ones not yet pruned.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    fn is_expired(&self, entry: &RegistryEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.inserted_at) >= self.ttl
    }
}
