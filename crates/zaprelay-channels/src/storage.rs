//! Local-disk media storage served back by the HTTP API under `/media/`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;
use zaprelay_core::{error::RelayError, traits::MediaStorage};

/// Writes media into `{dir}/{uuid}.{ext}` and returns `{public_url}/media/{file}`.
pub struct LocalMediaStorage {
    dir: PathBuf,
    public_url: String,
}

impl LocalMediaStorage {
    pub fn new(dir: impl Into<PathBuf>, public_url: &str) -> Self {
        Self {
            dir: dir.into(),
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// File extension for a MIME type. Unknown types get `bin`.
pub fn extension_for(mime_type: &str) -> &'static str {
    let essence = mime_type.split(';').next().unwrap_or("").trim();
    match essence {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "audio/ogg" => "ogg",
        "audio/mpeg" => "mp3",
        "audio/mp4" => "m4a",
        "video/mp4" => "mp4",
        "application/pdf" => "pdf",
        _ => "bin",
    }
}

/// MIME type for a stored file name, the inverse of [`extension_for`].
pub fn mime_for_file(file_name: &str) -> &'static str {
    match file_name.rsplit('.').next().unwrap_or("") {
        "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "ogg" => "audio/ogg",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "mp4" => "video/mp4",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Whether a requested file name is one we could have written.
///
/// Rejects path separators and parent references.
pub fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
}

#[async_trait]
impl MediaStorage for LocalMediaStorage {
    async fn store(&self, bytes: &[u8], mime_type: &str) -> Result<String, RelayError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let file = format!("{}.{}", uuid::Uuid::new_v4(), extension_for(mime_type));
        tokio::fs::write(self.dir.join(&file), bytes).await?;
        debug!("media: stored {} bytes as {file}", bytes.len());
        Ok(format!("{}/media/{file}", self.public_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_writes_file_and_returns_public_url() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = LocalMediaStorage::new(tmp.path().join("media"), "https://relay.example/");

        let url = storage.store(b"\xff\xd8jpeg", "image/jpeg").await.unwrap();
        assert!(url.starts_with("https://relay.example/media/"));
        assert!(url.ends_with(".jpg"));

        let file = url.rsplit('/').next().unwrap();
        let on_disk = std::fs::read(storage.dir().join(file)).unwrap();
        assert_eq!(on_disk, b"\xff\xd8jpeg");
    }

    #[test]
    fn test_extension_and_mime() {
        assert_eq!(extension_for("audio/ogg; codecs=opus"), "ogg");
        assert_eq!(extension_for("application/zip"), "bin");
        assert_eq!(mime_for_file("abc.jpg"), "image/jpeg");
        assert_eq!(mime_for_file("abc"), "application/octet-stream");
    }

    #[test]
    fn test_safe_file_names() {
        assert!(is_safe_file_name("0b1c-22.jpg"));
        assert!(!is_safe_file_name("../config.toml"));
        assert!(!is_safe_file_name("a/b.jpg"));
        assert!(!is_safe_file_name(".env"));
        assert!(!is_safe_file_name(""));
    }
}
