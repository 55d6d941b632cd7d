// src/upload.rs

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::Json;
use bytes::Bytes;
use chrono::Utc;
use tracing::info;

use crate::error::UploadError;
use crate::models::AttachmentDescriptor;
use crate::state::AppState;

/// The file-storage capability. The core never looks inside the returned
/// descriptor; it rides along on messages as an opaque value.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn store(
        &self,
        bytes: Bytes,
        original_name: &str,
        mime: &str,
    ) -> Result<AttachmentDescriptor, UploadError>;
}

/// Writes uploads to a local directory; files are renamed to a
/// millisecond timestamp keeping the original extension, and served back
/// under `{public_base_url}/uploads/`.
pub struct DiskAttachmentStore {
    dir: PathBuf,
    public_base_url: String,
}

impl DiskAttachmentStore {
    pub fn new(dir: PathBuf, public_base_url: String) -> Self {
        Self {
            dir,
            public_base_url,
        }
    }
}

#[async_trait]
impl AttachmentStore for DiskAttachmentStore {
    async fn store(
        &self,
        bytes: Bytes,
        original_name: &str,
        mime: &str,
    ) -> Result<AttachmentDescriptor, UploadError> {
        if bytes.is_empty() {
            return Err(UploadError::Empty);
        }

        let extension = Path::new(original_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        let filename = format!("{}{}", Utc::now().timestamp_millis(), extension);

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| UploadError::Storage(e.to_string()))?;
        tokio::fs::write(self.dir.join(&filename), &bytes)
            .await
            .map_err(|e| UploadError::Storage(e.to_string()))?;

        info!(name = original_name, stored = %filename, size = bytes.len(), "stored attachment");
        Ok(AttachmentDescriptor {
            url: format!("{}/uploads/{}", self.public_base_url, filename),
            mime: mime.to_string(),
            name: original_name.to_string(),
        })
    }
}

/// POST /api/upload: multipart with a single `file` field.
pub async fn upload_handler(
    State(app): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<AttachmentDescriptor>, (StatusCode, String)> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let name = field.file_name().unwrap_or("upload").to_string();
        let mime = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

        let descriptor = app
            .attachments
            .store(bytes, &name, &mime)
            .await
            .map_err(|e| match e {
                UploadError::Empty => (StatusCode::BAD_REQUEST, e.to_string()),
                UploadError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            })?;
        return Ok(Json(descriptor));
    }
    Err((StatusCode::BAD_REQUEST, "missing file field".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_store() -> (DiskAttachmentStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("chatline-test-{}", Uuid::new_v4()));
        (
            DiskAttachmentStore::new(dir.clone(), "http://localhost:8000".into()),
            dir,
        )
    }

    #[tokio::test]
    async fn stored_file_keeps_extension_and_builds_url() {
        let (store, dir) = temp_store();
        let descriptor = store
            .store(Bytes::from_static(b"png bytes"), "cat.png", "image/png")
            .await
            .unwrap();

        assert_eq!(descriptor.name, "cat.png");
        assert_eq!(descriptor.mime, "image/png");
        assert!(descriptor.url.starts_with("http://localhost:8000/uploads/"));
        assert!(descriptor.url.ends_with(".png"));

        let filename = descriptor.url.rsplit('/').next().unwrap();
        let written = tokio::fs::read(dir.join(filename)).await.unwrap();
        assert_eq!(written, b"png bytes");

        let _ = tokio::fs::remove_dir_all(dir).await;
    }

    #[tokio::test]
    async fn empty_upload_is_rejected() {
        let (store, dir) = temp_store();
        assert!(matches!(
            store.store(Bytes::new(), "cat.png", "image/png").await,
            Err(UploadError::Empty)
        ));
        let _ = tokio::fs::remove_dir_all(dir).await;
    }
}
