use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs; // Use tokio::fs for async file operations
use uuid::Uuid;

use crate::config::StorageConfig;

#[derive(Debug, Error)]
pub enum FileStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Invalid path component: {0}")]
    InvalidPathComponent(String),
    #[error("Remote storage error: {0}")]
    Remote(String),
    #[error("Unknown storage error: {0}")]
    Other(String),
}

impl FileStorageError {
    /// Whether repeating the same call could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FileStorageError::Io(_) | FileStorageError::Remote(_) | FileStorageError::Other(_) => true,
            FileStorageError::NotFound(_)
            | FileStorageError::Configuration(_)
            | FileStorageError::PermissionDenied(_)
            | FileStorageError::InvalidPathComponent(_) => false,
        }
    }
}

pub type FileStorageResult<T> = Result<T, FileStorageError>;

/// A file handed to the engine for storage.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub data: Vec<u8>,
    pub original_filename: String,
    /// MIME type declared by the client, if any. Content sniffing wins over it.
    pub content_type: Option<String>,
}

impl UploadFile {
    pub fn new(data: Vec<u8>, original_filename: impl Into<String>) -> Self {
        Self {
            data,
            original_filename: original_filename.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub mime_type: String,
    pub size: u64,
    pub extension: Option<String>,
}

/// Where a blob landed after upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub url: String,
    pub relative_path: String,
    pub meta: FileMeta,
}

/// Service trait for abstracting blob storage operations
#[async_trait]
pub trait FileStorageService: Send + Sync {
    /// Store the file, returning its public url, relative path and metadata.
    async fn upload(&self, file: &UploadFile) -> FileStorageResult<StoredFile>;

    /// Delete a blob by relative path. Deleting a blob that is already gone succeeds.
    async fn delete(&self, relative_path: &str) -> FileStorageResult<()>;

    /// Read a blob back.
    async fn get_file_data(&self, relative_path: &str) -> FileStorageResult<Vec<u8>>;
}

/// Lower-cased extension of a filename, without the dot.
pub fn file_extension(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(|ext| ext.to_lowercase())
}

fn guess_mime_type(extension: Option<&str>) -> String {
    let guessed = match extension.unwrap_or("") {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "zip" => "application/zip",
        _ => return mime::APPLICATION_OCTET_STREAM.to_string(),
    };
    guessed.to_string()
}

/// Work out the metadata of an upload: sniffed content type first, then the
/// declared type if it parses, then the extension.
pub fn detect_file_meta(file: &UploadFile) -> FileMeta {
    let extension = file_extension(&file.original_filename);

    let mime_type = infer::get(&file.data)
        .map(|kind| kind.mime_type().to_string())
        .or_else(|| {
            file.content_type
                .as_deref()
                .and_then(|declared| declared.parse::<mime::Mime>().ok())
                .map(|parsed| parsed.essence_str().to_string())
        })
        .unwrap_or_else(|| guess_mime_type(extension.as_deref()));

    FileMeta {
        mime_type,
        size: file.data.len() as u64,
        extension,
    }
}

// --- Local File Storage Implementation ---

pub struct LocalFileStorageService {
    base_path: PathBuf,
    public_base_url: String,
    original_subdir: String,
}

impl LocalFileStorageService {
    /// Creates a new LocalFileStorageService.
    /// Ensures the base directory exists.
    pub fn new(base_path_str: &str, public_base_url: &str) -> io::Result<Self> {
        let base_path = PathBuf::from(base_path_str);
        let original_subdir = "original".to_string();

        // Create directories synchronously during setup
        std::fs::create_dir_all(base_path.join(&original_subdir))?;

        Ok(Self {
            base_path,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            original_subdir,
        })
    }

    /// Sanitizes a path component to prevent directory traversal issues.
    fn sanitize_component(component: &str) -> Result<String, FileStorageError> {
        if component.is_empty() || component.contains('/') || component.contains('\\') || component == "." || component == ".." {
            Err(FileStorageError::InvalidPathComponent(component.to_string()))
        } else {
            Ok(component.to_string())
        }
    }

    /// Generates a unique filename keeping the original extension.
    fn generate_unique_filename(extension: Option<&str>) -> String {
        match extension {
            Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
            None => Uuid::new_v4().to_string(),
        }
    }

    /// Resolve a stored relative path under the base directory, dropping any
    /// root, `.` or `..` components.
    pub fn get_absolute_path(&self, relative_path: &str) -> PathBuf {
        let mut abs_path = self.base_path.clone();
        for component in Path::new(relative_path).components() {
            if let std::path::Component::Normal(comp_str) = component {
                abs_path.push(comp_str);
            }
        }
        abs_path
    }

    fn checked_path(&self, relative_path: &str) -> FileStorageResult<PathBuf> {
        let absolute_path = self.get_absolute_path(relative_path);
        if absolute_path == self.base_path || !absolute_path.starts_with(&self.base_path) {
            return Err(FileStorageError::PermissionDenied(format!(
                "Path '{}' resolves outside the storage directory",
                relative_path
            )));
        }
        Ok(absolute_path)
    }
}

#[async_trait]
impl FileStorageService for LocalFileStorageService {
    async fn upload(&self, file: &UploadFile) -> FileStorageResult<StoredFile> {
        let meta = detect_file_meta(file);
        let month_bucket = Self::sanitize_component(&Utc::now().format("%Y-%m").to_string())?;
        let unique_filename = Self::generate_unique_filename(meta.extension.as_deref());

        // original/<yyyy-mm>/<uuid>.<ext>
        let relative_path = format!("{}/{}/{}", self.original_subdir, month_bucket, unique_filename);
        let absolute_path = self.checked_path(&relative_path)?;

        let parent_dir = absolute_path
            .parent()
            .ok_or_else(|| FileStorageError::Other("Invalid path generated, no parent directory".to_string()))?;
        fs::create_dir_all(parent_dir).await?;
        fs::write(&absolute_path, &file.data).await?;

        debug!("Stored {} bytes at {}", meta.size, relative_path);

        Ok(StoredFile {
            url: format!("{}/{}", self.public_base_url, relative_path),
            relative_path,
            meta,
        })
    }

    async fn delete(&self, relative_path: &str) -> FileStorageResult<()> {
        let absolute_path = self.checked_path(relative_path)?;

        match fs::remove_file(&absolute_path).await {
            Ok(_) => Ok(()),
            // Already gone counts as deleted
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FileStorageError::Io(e)),
        }
    }

    async fn get_file_data(&self, relative_path: &str) -> FileStorageResult<Vec<u8>> {
        let absolute_path = self.checked_path(relative_path)?;

        match fs::read(&absolute_path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(FileStorageError::NotFound(relative_path.to_string()))
            }
            Err(e) => Err(FileStorageError::Io(e)),
        }
    }
}

// --- Remote blob API implementation ---

/// Blob storage behind an HTTP API (`POST /api/blobs`, `DELETE|GET /api/blobs/{path}`).
pub struct ApiFileStorageService {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ApiUploadResponse {
    url: String,
    relative_path: String,
}

impl ApiFileStorageService {
    pub fn new(base_url: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn blob_url(&self, relative_path: &str) -> String {
        format!("{}/api/blobs/{}", self.base_url, relative_path.trim_start_matches('/'))
    }

    async fn error_from_response(response: reqwest::Response) -> FileStorageError {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to get error details".to_string());
        FileStorageError::Remote(format!("Server returned error {}: {}", status, error_text))
    }
}

#[async_trait]
impl FileStorageService for ApiFileStorageService {
    async fn upload(&self, file: &UploadFile) -> FileStorageResult<StoredFile> {
        let meta = detect_file_meta(file);
        let part = Part::bytes(file.data.clone())
            .file_name(file.original_filename.clone())
            .mime_str(&meta.mime_type)
            .map_err(|e| FileStorageError::Other(format!("Invalid MIME type for upload: {}", e)))?;
        let form = Form::new().part("file", part);

        let response = self
            .client
            .post(format!("{}/api/blobs", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| FileStorageError::Remote(format!("Failed to upload blob: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let body = response
            .json::<ApiUploadResponse>()
            .await
            .map_err(|e| FileStorageError::Remote(format!("Failed to parse upload response: {}", e)))?;

        Ok(StoredFile {
            url: body.url,
            relative_path: body.relative_path,
            meta,
        })
    }

    async fn delete(&self, relative_path: &str) -> FileStorageResult<()> {
        let response = self
            .client
            .delete(self.blob_url(relative_path))
            .send()
            .await
            .map_err(|e| FileStorageError::Remote(format!("Failed to delete blob: {}", e)))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => Err(FileStorageError::PermissionDenied(
                format!("Remote storage refused to delete {}", relative_path),
            )),
            _ => Err(Self::error_from_response(response).await),
        }
    }

    async fn get_file_data(&self, relative_path: &str) -> FileStorageResult<Vec<u8>> {
        let response = self
            .client
            .get(self.blob_url(relative_path))
            .send()
            .await
            .map_err(|e| FileStorageError::Remote(format!("Failed to download blob: {}", e)))?;

        match response.status() {
            status if status.is_success() => response
                .bytes()
                .await
                .map(|bytes| bytes.to_vec())
                .map_err(|e| FileStorageError::Remote(format!("Failed to read blob body: {}", e))),
            StatusCode::NOT_FOUND => Err(FileStorageError::NotFound(relative_path.to_string())),
            _ => Err(Self::error_from_response(response).await),
        }
    }
}

/// Pick the storage implementation named by configuration.
pub fn build_storage(config: &StorageConfig) -> FileStorageResult<Arc<dyn FileStorageService>> {
    match config {
        StorageConfig::Local { base_path, public_base_url } => {
            let service = LocalFileStorageService::new(base_path, public_base_url)?;
            Ok(Arc::new(service))
        }
        StorageConfig::Api { base_url } => {
            if base_url.is_empty() {
                return Err(FileStorageError::Configuration("Remote storage base url is empty".to_string()));
            }
            Ok(Arc::new(ApiFileStorageService::new(base_url)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PNG_HEADER: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

    fn local_store(dir: &TempDir) -> LocalFileStorageService {
        LocalFileStorageService::new(dir.path().to_str().unwrap(), "https://files.example.com/").unwrap()
    }

    #[test]
    fn test_detect_file_meta_prefers_sniffed_type() {
        let mut data = PNG_HEADER.to_vec();
        data.extend_from_slice(&[0u8; 16]);
        let file = UploadFile::new(data, "receipt.PDF").with_content_type("application/pdf");

        let meta = detect_file_meta(&file);
        assert_eq!(meta.mime_type, "image/png");
        assert_eq!(meta.extension.as_deref(), Some("pdf"));
        assert_eq!(meta.size, 24);
    }

    #[test]
    fn test_detect_file_meta_falls_back_to_declared_then_extension() {
        let declared = UploadFile::new(b"plain words".to_vec(), "notes").with_content_type("text/markdown; charset=utf-8");
        assert_eq!(detect_file_meta(&declared).mime_type, "text/markdown");

        let by_extension = UploadFile::new(b"a,b\n1,2".to_vec(), "sheet.csv");
        assert_eq!(detect_file_meta(&by_extension).mime_type, "text/csv");

        let unknown = UploadFile::new(b"??".to_vec(), "blob");
        assert_eq!(detect_file_meta(&unknown).mime_type, "application/octet-stream");
        assert_eq!(detect_file_meta(&unknown).extension, None);
    }

    #[tokio::test]
    async fn test_local_upload_then_read_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = local_store(&dir);

        let stored = store.upload(&UploadFile::new(b"hello".to_vec(), "hello.txt")).await.unwrap();
        assert!(stored.relative_path.starts_with("original/"));
        assert!(stored.relative_path.ends_with(".txt"));
        assert_eq!(stored.url, format!("https://files.example.com/{}", stored.relative_path));
        assert_eq!(store.get_file_data(&stored.relative_path).await.unwrap(), b"hello".to_vec());

        store.delete(&stored.relative_path).await.unwrap();
        assert!(matches!(
            store.get_file_data(&stored.relative_path).await,
            Err(FileStorageError::NotFound(_))
        ));

        // Second delete of the same path is still a success
        store.delete(&stored.relative_path).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_paths_cannot_escape_base_dir() {
        let dir = TempDir::new().unwrap();
        let store = local_store(&dir);

        let resolved = store.get_absolute_path("../../etc/passwd");
        assert!(resolved.starts_with(dir.path()));

        let err = store.delete("..").await.unwrap_err();
        assert!(matches!(err, FileStorageError::PermissionDenied(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_build_storage_rejects_empty_remote_url() {
        let result = build_storage(&StorageConfig::Api { base_url: String::new() });
        assert!(matches!(result, Err(FileStorageError::Configuration(_))));
    }
}
