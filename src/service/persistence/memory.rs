//! In-memory persistence, for tests and ephemeral runs.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    base::types::{Res, ServerId, Void},
    digest::store::ServerConfig,
};

use super::{ConfigPersistence, GenericConfigPersistence};

impl ConfigPersistence {
    /// Creates a persistence that keeps records in memory only.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryPersistence::default()))
    }

    /// Creates an in-memory persistence pre-populated with `records`.
    pub fn memory_with(records: impl IntoIterator<Item = ServerConfig>) -> Self {
        let records = records.into_iter().map(|r| (r.server_id.clone(), r)).collect();
        Self::new(Arc::new(MemoryPersistence { records: Mutex::new(records) }))
    }
}

#[derive(Default)]
pub struct MemoryPersistence {
    records: Mutex<BTreeMap<ServerId, ServerConfig>>,
}

#[async_trait]
impl GenericConfigPersistence for MemoryPersistence {
    async fn load_all(&self) -> Res<Vec<ServerConfig>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }

    async fn save(&self, record: &ServerConfig) -> Void {
        self.records.lock().await.insert(record.server_id.clone(), record.clone());
        Ok(())
    }
}
