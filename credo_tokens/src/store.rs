//! Encrypted persistence of token records
//!
//! All records live in a single entry of a [`SecureStorage`] backend. The
//! entry holds a JSON map from audience to the serialized record, sealed with
//! AES-256-GCM under a key derived from device-local [`KeyMaterial`]. The
//! whole entry is rewritten on every change.

use std::{collections::BTreeMap, error, fmt, sync::Arc};

use aliri_base64::Base64Url;
use async_trait::async_trait;
use ring::{
    aead, hkdf,
    rand::{SecureRandom, SystemRandom},
};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::{AudienceKeyRef, TokenRecord};

#[cfg(feature = "file")]
mod file;
mod in_memory;

#[cfg(feature = "file")]
#[cfg_attr(docsrs, doc(cfg(feature = "file")))]
pub use file::FileStorage;
pub use in_memory::InMemoryStorage;

/// The default name of the storage entry holding all token records
pub const DEFAULT_STORAGE_KEY: &str = "CREDO_AUTH_TOKENS";

const KDF_SALT: &[u8] = b"credo token store";
const KDF_INFO: &[u8] = b"aes-256-gcm record map";

/// Errors reported by a storage backend
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// A backend able to persist a single string entry under a key
#[async_trait]
pub trait SecureStorage: fmt::Debug + Send + Sync {
    /// Loads the entry, if one exists
    async fn load(&self, key: &str) -> Result<Option<String>, BoxError>;

    /// Replaces the entry
    async fn save(&self, key: &str, value: &str) -> Result<(), BoxError>;

    /// Removes the entry; removing an absent entry is not an error
    async fn remove(&self, key: &str) -> Result<(), BoxError>;
}

#[async_trait]
impl<T: SecureStorage + ?Sized> SecureStorage for Arc<T> {
    async fn load(&self, key: &str) -> Result<Option<String>, BoxError> {
        (**self).load(key).await
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), BoxError> {
        (**self).save(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), BoxError> {
        (**self).remove(key).await
    }
}

/// Device-local secret input from which the store's encryption key is derived
#[derive(Clone)]
pub struct KeyMaterial(Vec<u8>);

impl KeyMaterial {
    /// Wraps the provided secret bytes
    pub fn new(material: impl Into<Vec<u8>>) -> Self {
        Self(material.into())
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("***KEY MATERIAL***")
    }
}

/// An error while writing to the token store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The record carries an error and no usable tokens
    #[error("refusing to persist a failed record: {0}")]
    FailedRecord(String),
    /// The record map could not be serialized
    #[error("unable to serialize token records")]
    Serialization(#[from] serde_json::Error),
    /// The record map could not be sealed
    #[error("unable to encrypt token records")]
    Encryption,
    /// The storage backend failed
    #[error("storage backend failed")]
    Backend(#[source] BoxError),
}

struct Sealer {
    key: aead::LessSafeKey,
    rng: SystemRandom,
}

impl fmt::Debug for Sealer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Sealer")
            .field("algorithm", self.key.algorithm())
            .finish()
    }
}

impl Sealer {
    fn derive(material: &KeyMaterial) -> Result<Self, StoreError> {
        let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, KDF_SALT).extract(&material.0);
        let okm = prk
            .expand(&[KDF_INFO], &aead::AES_256_GCM)
            .map_err(|_| StoreError::Encryption)?;
        Ok(Self {
            key: aead::LessSafeKey::new(aead::UnboundKey::from(okm)),
            rng: SystemRandom::new(),
        })
    }

    fn seal(&self, aad: &str, plaintext: String) -> Result<String, StoreError> {
        let mut nonce = [0u8; aead::NONCE_LEN];
        self.rng.fill(&mut nonce).map_err(|_| StoreError::Encryption)?;

        let mut in_out = plaintext.into_bytes();
        self.key
            .seal_in_place_append_tag(
                aead::Nonce::assume_unique_for_key(nonce),
                aead::Aad::from(aad.as_bytes()),
                &mut in_out,
            )
            .map_err(|_| StoreError::Encryption)?;

        let mut blob = Vec::with_capacity(nonce.len() + in_out.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&in_out);
        Ok(Base64Url::from_raw(blob).to_string())
    }

    fn open(&self, aad: &str, blob: &str) -> Option<String> {
        let mut raw = Base64Url::from_encoded(blob).ok()?.into_inner();
        if raw.len() < aead::NONCE_LEN + self.key.algorithm().tag_len() {
            return None;
        }

        let mut sealed = raw.split_off(aead::NONCE_LEN);
        let nonce = aead::Nonce::try_assume_unique_for_key(&raw).ok()?;
        let plaintext = self
            .key
            .open_in_place(nonce, aead::Aad::from(aad.as_bytes()), &mut sealed)
            .ok()?;
        String::from_utf8(plaintext.to_vec()).ok()
    }
}

type RecordMap = BTreeMap<String, String>;

/// Persists token records, one per audience
#[derive(Debug)]
pub struct TokenStore {
    storage: Box<dyn SecureStorage>,
    storage_key: String,
    sealer: Sealer,
    lock: Mutex<()>,
}

impl TokenStore {
    /// Constructs a store over the given backend using the default entry name
    pub fn new<S>(storage: S, material: &KeyMaterial) -> Result<Self, StoreError>
    where
        S: SecureStorage + 'static,
    {
        Self::with_storage_key(storage, material, DEFAULT_STORAGE_KEY)
    }

    /// Constructs a store over the given backend and entry name
    pub fn with_storage_key<S>(
        storage: S,
        material: &KeyMaterial,
        storage_key: impl Into<String>,
    ) -> Result<Self, StoreError>
    where
        S: SecureStorage + 'static,
    {
        Ok(Self {
            storage: Box::new(storage),
            storage_key: storage_key.into(),
            sealer: Sealer::derive(material)?,
            lock: Mutex::new(()),
        })
    }

    /// Gets the record stored for the audience
    ///
    /// Unreadable or corrupt entries are reported as absent.
    pub async fn get(&self, audience: &AudienceKeyRef) -> Option<TokenRecord> {
        let _guard = self.lock.lock().await;
        let mut map = match self.load_map().await {
            Ok(map) => map,
            Err(error) => {
                tracing::warn!(
                    %audience,
                    error = (&error as &dyn std::error::Error),
                    "unable to load token records"
                );
                return None;
            }
        };
        let raw = map.remove(audience.as_str())?;

        match serde_json::from_str::<TokenRecord>(&raw) {
            Ok(record) if record.is_usable() => Some(record),
            Ok(_) => {
                tracing::warn!(%audience, "stored record carries an error, ignoring");
                None
            }
            Err(error) => {
                tracing::warn!(%audience, %error, "unable to deserialize stored record");
                None
            }
        }
    }

    /// Stores the record for the audience, replacing any existing record
    pub async fn put(
        &self,
        audience: &AudienceKeyRef,
        record: &TokenRecord,
    ) -> Result<(), StoreError> {
        if let Some(error) = record.error() {
            return Err(StoreError::FailedRecord(error.to_owned()));
        }

        let serialized = serde_json::to_string(record)?;

        let _guard = self.lock.lock().await;
        let mut map = self.load_map().await?;
        map.insert(audience.as_str().to_owned(), serialized);
        self.write_map(&map).await?;
        tracing::debug!(%audience, "stored token record");
        Ok(())
    }

    /// Removes the record for the audience
    pub async fn delete(&self, audience: &AudienceKeyRef) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut map = self.load_map().await?;
        if map.remove(audience.as_str()).is_none() {
            return Ok(());
        }

        if map.is_empty() {
            self.remove_entry().await
        } else {
            self.write_map(&map).await
        }?;
        tracing::debug!(%audience, "deleted token record");
        Ok(())
    }

    /// Removes all records
    pub async fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        self.remove_entry().await?;
        tracing::debug!("cleared token records");
        Ok(())
    }

    /// Loads the record map
    ///
    /// An entry that cannot be decrypted or parsed reads as empty, but a
    /// backend failure is reported so that writers do not overwrite records
    /// they could not see.
    async fn load_map(&self) -> Result<RecordMap, StoreError> {
        let blob = match self
            .storage
            .load(&self.storage_key)
            .await
            .map_err(StoreError::Backend)?
        {
            Some(blob) => blob,
            None => return Ok(RecordMap::new()),
        };

        let Some(plaintext) = self.sealer.open(&self.storage_key, &blob) else {
            tracing::warn!("unable to decrypt token records, treating as empty");
            return Ok(RecordMap::new());
        };

        Ok(serde_json::from_str(&plaintext).unwrap_or_else(|error| {
            tracing::warn!(%error, "unable to parse token records, treating as empty");
            RecordMap::new()
        }))
    }

    async fn write_map(&self, map: &RecordMap) -> Result<(), StoreError> {
        let plaintext = serde_json::to_string(map)?;
        let blob = self.sealer.seal(&self.storage_key, plaintext)?;
        self.storage
            .save(&self.storage_key, &blob)
            .await
            .map_err(StoreError::Backend)
    }

    async fn remove_entry(&self) -> Result<(), StoreError> {
        self.storage
            .remove(&self.storage_key)
            .await
            .map_err(StoreError::Backend)
    }
}
