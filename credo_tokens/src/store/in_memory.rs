//! An in-memory storage backend

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use super::{BoxError, SecureStorage};

/// A storage backend that keeps entries in process memory
#[derive(Default, Debug)]
pub struct InMemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryStorage {
    /// Constructs a new, empty in-memory storage backend
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl SecureStorage for InMemoryStorage {
    async fn load(&self, key: &str) -> Result<Option<String>, BoxError> {
        Ok(self.entries().get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), BoxError> {
        self.entries().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), BoxError> {
        self.entries().remove(key);
        Ok(())
    }
}
