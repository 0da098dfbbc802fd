//! 待上传记录的定期清理任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::REGISTRY_PRUNE_INTERVAL_SECS;
use crate::registry::UploadRegistry;

/// 启动后台任务（过期待上传记录清理）。
pub fn spawn_background_tasks(registry: Arc<UploadRegistry>) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(REGISTRY_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let removed = registry.prune_expired().await;
            if removed > 0 {
                debug!(removed, "pruned expired pending uploads");
            }
        }
    });
}
