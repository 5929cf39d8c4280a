//! Durable storage for server configurations.
//!
//! The configuration store keeps its working set in memory and writes through
//! a [`GenericConfigPersistence`] on every mutation. Implementations must make a
//! single-record write atomic: after `save` returns the record survives a crash,
//! and a crash during `save` leaves the previous version intact.

pub mod json;
pub mod memory;

use std::{ops::Deref, sync::Arc};

use async_trait::async_trait;

use crate::{
    base::types::{Res, Void},
    digest::store::ServerConfig,
};

// Traits.

/// Generic persistence trait that backends must implement.
#[async_trait]
pub trait GenericConfigPersistence: Send + Sync + 'static {
    /// Load every persisted record.
    ///
    /// Called once when the store opens.
    async fn load_all(&self) -> Res<Vec<ServerConfig>>;

    /// Durably insert or replace one record.
    async fn save(&self, record: &ServerConfig) -> Void;
}

// Structs.

/// Persistence handle for the application.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct ConfigPersistence {
    inner: Arc<dyn GenericConfigPersistence>,
}

impl Deref for ConfigPersistence {
    type Target = dyn GenericConfigPersistence;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

impl ConfigPersistence {
    pub fn new(inner: Arc<dyn GenericConfigPersistence>) -> Self {
        Self { inner }
    }
}
