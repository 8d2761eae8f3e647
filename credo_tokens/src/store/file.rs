//! A file-backed storage backend

use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::fs::OpenOptions;

use super::{BoxError, SecureStorage};

/// A storage backend that keeps each entry in its own file within a directory
///
/// On unix, files are created readable only by the owner.
#[derive(Debug)]
pub struct FileStorage {
    directory: PathBuf,
}

impl FileStorage {
    /// Constructs a new file storage backend rooted at `directory`
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// The directory holding the entries
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.directory.join(name)
    }
}

#[async_trait]
impl SecureStorage for FileStorage {
    async fn load(&self, key: &str) -> Result<Option<String>, BoxError> {
        use tokio::io::AsyncReadExt;

        let mut file = match OpenOptions::new().read(true).open(self.path_for(key)).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut data = String::new();
        file.read_to_string(&mut data).await?;
        Ok(Some(data))
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), BoxError> {
        use tokio::io::AsyncWriteExt;

        tokio::fs::create_dir_all(&self.directory).await?;

        let mut file_opts = OpenOptions::new();

        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(self.path_for(key)).await?;
        file.write_all(value.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), BoxError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}
