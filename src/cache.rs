use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::delegate::DelegateConf;
use crate::error::Error;

/// Per-container record of the resolved delegate set and device bindings,
/// written at ADD so DEL/CHECK can be replayed after the workload (or the
/// whole cluster connection) is gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub cni_version: String,
    pub container_id: String,
    pub ifname: String,
    pub delegates: Vec<DelegateConf>,
    #[serde(default)]
    pub bindings: Vec<DeviceBinding>,
}

/// What one successful delegate ADD bound: enough to replay its DEL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceBinding {
    pub index: usize,
    pub ifname: String,
    pub netns: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// One JSON file per container id under the configured directory. Writes
/// are temp-file + rename and fsynced before ADD reports success; readers
/// treat partial or corrupt files as absent.
#[derive(Debug, Clone)]
pub struct ScratchCache {
    dir: PathBuf,
}

impl ScratchCache {
    pub fn new(dir: impl Into<PathBuf>) -> ScratchCache {
        ScratchCache { dir: dir.into() }
    }

    pub async fn put(&self, entry: &CacheEntry) -> Result<(), Error> {
        let key = cache_key(&entry.container_id)?;
        let data =
            serde_json::to_vec(entry).map_err(|e| Error::CachePersist(e.to_string()))?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::CachePersist(format!("{}: {e}", self.dir.display())))?;
        let tmp = self.dir.join(format!(".{key}.tmp"));
        let path = self.dir.join(&key);
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| Error::CachePersist(format!("{}: {e}", tmp.display())))?;
        file.write_all(&data)
            .await
            .map_err(|e| Error::CachePersist(format!("{}: {e}", tmp.display())))?;
        file.sync_all()
            .await
            .map_err(|e| Error::CachePersist(format!("{}: {e}", tmp.display())))?;
        drop(file);
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::CachePersist(format!("{}: {e}", path.display())))?;
        // Make the rename itself durable.
        let _ = std::fs::File::open(&self.dir).and_then(|d| d.sync_all());
        Ok(())
    }

    pub async fn get(&self, container_id: &str) -> Option<CacheEntry> {
        let key = cache_key(container_id).ok()?;
        let path = self.dir.join(&key);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read scratch cache");
                return None;
            }
        };
        match serde_json::from_slice(&data) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt scratch cache entry");
                None
            }
        }
    }

    pub async fn delete(&self, container_id: &str) -> Result<(), Error> {
        let key = cache_key(container_id)?;
        let path = self.dir.join(&key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::CachePersist(format!("{}: {e}", path.display()))),
        }
    }
}

// Container ids become file names; refuse anything that could escape the
// cache directory.
fn cache_key(container_id: &str) -> Result<String, Error> {
    if container_id.is_empty()
        || container_id == "."
        || container_id == ".."
        || !container_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::InvalidEnv(format!(
            "container id {container_id:?} is not usable as a cache key"
        )));
    }
    Ok(container_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::DelegateConf;
    use serde_json::json;

    fn entry(container_id: &str) -> CacheEntry {
        let delegate = DelegateConf::normalize(
            json!({"name": "weave1", "cniVersion": "0.2.0", "type": "weave-net"}),
            "0.2.0",
        )
        .unwrap();
        CacheEntry {
            cni_version: "0.2.0".to_string(),
            container_id: container_id.to_string(),
            ifname: "eth0".to_string(),
            delegates: vec![delegate],
            bindings: vec![DeviceBinding {
                index: 0,
                ifname: "eth0".to_string(),
                netns: "/var/run/netns/x".to_string(),
                sandbox: None,
            }],
        }
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ScratchCache::new(dir.path());
        cache.put(&entry("123456789")).await.unwrap();

        let got = cache.get("123456789").await.unwrap();
        assert_eq!(got.cni_version, "0.2.0");
        assert_eq!(got.ifname, "eth0");
        assert_eq!(got.delegates.len(), 1);
        assert_eq!(got.delegates[0].name, "weave1");
        assert_eq!(got.bindings[0].ifname, "eth0");
    }

    #[tokio::test]
    async fn missing_entry_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ScratchCache::new(dir.path());
        assert!(cache.get("123456789").await.is_none());
    }

    #[tokio::test]
    async fn corrupt_entry_is_none() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("123456789"), b"{truncated").unwrap();
        let cache = ScratchCache::new(dir.path());
        assert!(cache.get("123456789").await.is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ScratchCache::new(dir.path());
        cache.put(&entry("123456789")).await.unwrap();
        cache.delete("123456789").await.unwrap();
        assert!(cache.get("123456789").await.is_none());
        cache.delete("123456789").await.unwrap();
    }

    #[tokio::test]
    async fn hostile_container_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ScratchCache::new(dir.path());
        assert!(cache.put(&entry("../escape")).await.is_err());
        assert!(cache.get("../escape").await.is_none());
    }
}
