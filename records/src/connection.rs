//! Shared handle to the bucket used by every model of a database.

use std::sync::{Arc, PoisonError, RwLock};

use common::Storage;

use crate::error::{Error, Result};

/// The bucket handle shared by all models.
///
/// Operations resolve the handle on every call so that closing the database
/// makes every later operation fail with [`Error::NotConnected`].
pub(crate) struct Connection {
    storage: RwLock<Option<Arc<dyn Storage>>>,
}

impl Connection {
    pub(crate) fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage: RwLock::new(Some(storage)),
        }
    }

    /// Returns the bucket, or [`Error::NotConnected`] once disconnected.
    pub(crate) fn storage(&self) -> Result<Arc<dyn Storage>> {
        self.storage
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::NotConnected)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.storage
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Detaches the bucket, returning it so the caller can close it.
    pub(crate) fn disconnect(&self) -> Option<Arc<dyn Storage>> {
        self.storage
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    #[cfg(test)]
    pub(crate) fn in_memory() -> Arc<Self> {
        Arc::new(Self::new(Arc::new(common::InMemoryStorage::new())))
    }
}
