//! JSON file persistence.
//!
//! All records live in one JSON object keyed by server id. Every save rewrites
//! the whole document to a sibling temp file, syncs it, and renames it over the
//! target, so readers only ever observe a complete document.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use tokio::{io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, info, instrument};

use crate::{
    base::types::{Res, ServerId, Void},
    digest::store::ServerConfig,
};

use super::{ConfigPersistence, GenericConfigPersistence};

// Extra methods on `ConfigPersistence` applied by the json implementation.

impl ConfigPersistence {
    /// Creates a persistence backed by the JSON file at `path`.
    pub fn json_file(path: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(JsonFilePersistence::new(path)))
    }
}

// Specific implementations.

/// JSON file persistence implementation.
pub struct JsonFilePersistence {
    path: PathBuf,
    /// Mirror of the document on disk; the lock also serializes file writes.
    records: Mutex<BTreeMap<ServerId, ServerConfig>>,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Mutex::new(BTreeMap::new()),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_else(|| "config.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl GenericConfigPersistence for JsonFilePersistence {
    #[instrument(name = "JsonFilePersistence::load_all", skip(self), fields(path = %self.path.display()))]
    async fn load_all(&self) -> Res<Vec<ServerConfig>> {
        let mut records = self.records.lock().await;

        if !tokio::fs::try_exists(&self.path).await? {
            info!("Config file does not exist, creating an empty one.");

            write_atomic(&self.path, &self.temp_path(), b"{}").await?;
            records.clear();

            return Ok(Vec::new());
        }

        let raw = tokio::fs::read(&self.path).await.with_context(|| format!("Failed to read `{}`", self.path.display()))?;
        let loaded: BTreeMap<ServerId, ServerConfig> = serde_json::from_slice(&raw).with_context(|| format!("Failed to parse `{}`", self.path.display()))?;

        info!("Loaded {} server configuration(s).", loaded.len());

        *records = loaded;

        Ok(records.values().cloned().collect())
    }

    #[instrument(name = "JsonFilePersistence::save", skip_all, fields(server_id = %record.server_id))]
    async fn save(&self, record: &ServerConfig) -> Void {
        let mut records = self.records.lock().await;

        let mut next = records.clone();
        next.insert(record.server_id.clone(), record.clone());

        let bytes = serde_json::to_vec_pretty(&next)?;
        write_atomic(&self.path, &self.temp_path(), &bytes).await?;

        *records = next;

        debug!("Configuration saved.");

        Ok(())
    }
}

// Helpers.

/// Write `bytes` to `temp`, flush it to disk, then move it over `path`.
async fn write_atomic(path: &Path, temp: &Path, bytes: &[u8]) -> Void {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = tokio::fs::File::create(temp).await.with_context(|| format!("Failed to create `{}`", temp.display()))?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(temp, path).await.with_context(|| format!("Failed to replace `{}`", path.display()))?;

    Ok(())
}

// Tests.

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, TimeZone, Utc};

    use super::*;

    fn record(server_id: &str) -> ServerConfig {
        let mut record = ServerConfig::new(server_id, TimeDelta::minutes(30), Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap());
        record.monitored_channels.insert("C1".to_string());
        record.recipient_emails.insert("team@example.com".to_string());
        record
    }

    #[tokio::test]
    async fn test_missing_file_is_created_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bot_config.json");

        let persistence = ConfigPersistence::json_file(&path);
        let records = persistence.load_all().await.unwrap();

        assert!(records.is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_save_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot_config.json");

        let persistence = ConfigPersistence::json_file(&path);
        persistence.load_all().await.unwrap();
        persistence.save(&record("T1")).await.unwrap();
        persistence.save(&record("T2")).await.unwrap();

        // A fresh instance sees both records.
        let reopened = ConfigPersistence::json_file(&path);
        let mut records = reopened.load_all().await.unwrap();
        records.sort_by(|a, b| a.server_id.cmp(&b.server_id));

        assert_eq!(records, vec![record("T1"), record("T2")]);
        assert!(!dir.path().join("bot_config.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_save_replaces_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot_config.json");

        let persistence = ConfigPersistence::json_file(&path);
        persistence.load_all().await.unwrap();
        persistence.save(&record("T1")).await.unwrap();

        let mut updated = record("T1");
        updated.monitored_channels.clear();
        persistence.save(&updated).await.unwrap();

        let records = ConfigPersistence::json_file(&path).load_all().await.unwrap();

        assert_eq!(records, vec![updated]);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot_config.json");
        std::fs::write(&path, "not json").unwrap();

        let persistence = ConfigPersistence::json_file(&path);

        assert!(persistence.load_all().await.is_err());
    }
}
