// Object storage, backed by a local directory

use std::io::ErrorKind;
use std::path::PathBuf;

use crate::error::ApiError;
use crate::validation::validate_media_key;

#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Read an object by key. Missing objects are `NotFound`.
    pub async fn read(&self, key: &str) -> Result<Vec<u8>, ApiError> {
        validate_media_key(key)?;
        let path = self.root.join(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ApiError::NotFound(format!("media object {key}")))
            }
            Err(e) => Err(ApiError::InternalError(format!("reading {key}: {e}"))),
        }
    }
}
