//! Media resolution: local content cache, MIME normalisation and the
//! resumable upload against the Google file service.
//!
//! Uploads bind the resulting file handle to the key that created them, so
//! callers must pin that key for any request referencing the handle.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use thiserror::Error;
use tracing::{debug, warn};

const UPLOAD_URL: &str = "https://generativelanguage.googleapis.com/upload/v1beta/files";
/// Poll cadence while waiting for an uploaded file to become ACTIVE.
const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Hard ceiling on readiness polling; after this we proceed with a warning.
const POLL_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("platform download failed: {0}")]
    Download(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handle returned by the upload service, referenced from a prompt as a
/// `file_data` part.
#[derive(Debug, Clone, PartialEq)]
pub struct FileHandle {
    pub mime_type: String,
    pub uri: String,
}

/// The messaging platform's file download capability, kept behind a trait so
/// this crate stays platform-free.
#[async_trait]
pub trait PlatformFiles: Send + Sync {
    async fn download(&self, file_id: &str) -> Result<Vec<u8>, MediaError>;
}

pub struct MediaResolver {
    client: reqwest::Client,
    cache_dir: PathBuf,
}

impl MediaResolver {
    pub fn new(client: reqwest::Client, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            cache_dir: cache_dir.into(),
        }
    }

    /// Fetch a photo and return it base64-encoded for inline attachment.
    pub async fn photo_base64(
        &self,
        files: &dyn PlatformFiles,
        file_id: &str,
    ) -> Result<String, MediaError> {
        let bytes = self.cached_bytes(files, file_id).await?;
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    /// Fetch any non-photo media, upload it to the Google file service with
    /// `token`, wait for readiness and return the handle.
    pub async fn upload_other(
        &self,
        files: &dyn PlatformFiles,
        file_id: &str,
        token: &str,
    ) -> Result<FileHandle, MediaError> {
        let bytes = self.cached_bytes(files, file_id).await?;
        let mime = sniff_mime(&bytes, file_id);
        debug!(file_id, mime = %mime, size = bytes.len(), "uploading media file");

        // Resumable protocol, step 1: open the session, read the upload URL
        // from the response headers.
        let start = self
            .client
            .post(format!("{UPLOAD_URL}?key={token}"))
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", bytes.len())
            .header("X-Goog-Upload-Header-Content-Type", &mime)
            .json(&serde_json::json!({ "file": { "display_name": file_id } }))
            .send()
            .await?;

        let upload_url = start
            .headers()
            .get("X-Goog-Upload-URL")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .ok_or_else(|| MediaError::Upload("no X-Goog-Upload-URL in response".into()))?;

        // Step 2: send the bytes and finalize in one shot.
        let content_length = bytes.len();
        let finalize: serde_json::Value = self
            .client
            .post(&upload_url)
            .header("X-Goog-Upload-Offset", 0)
            .header("X-Goog-Upload-Command", "upload, finalize")
            .header("Content-Length", content_length)
            .body(bytes)
            .send()
            .await?
            .json()
            .await?;

        let uri = finalize
            .pointer("/file/uri")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| MediaError::Upload("upload response carries no file uri".into()))?;

        self.wait_until_active(&uri, token).await;

        Ok(FileHandle {
            mime_type: mime,
            uri,
        })
    }

    /// Poll the file resource until `state == ACTIVE` or the deadline
    /// passes. A file that never activates is still returned to the caller;
    /// the generate call surfaces the real error if the handle is unusable.
    async fn wait_until_active(&self, uri: &str, token: &str) {
        let deadline = tokio::time::Instant::now() + POLL_DEADLINE;
        loop {
            let state = self
                .client
                .get(format!("{uri}?key={token}"))
                .send()
                .await
                .ok();
            let state = match state {
                Some(resp) => resp
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|v| v.get("state").and_then(|s| s.as_str()).map(String::from)),
                None => None,
            };

            if state.as_deref() == Some("ACTIVE") {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(uri, state = state.as_deref().unwrap_or("unknown"),
                    "uploaded file not ACTIVE before deadline, proceeding anyway");
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Read the file from the content cache, downloading it first if absent.
    async fn cached_bytes(
        &self,
        files: &dyn PlatformFiles,
        file_id: &str,
    ) -> Result<Vec<u8>, MediaError> {
        let path = self.cache_path(file_id);
        if path.exists() {
            return Ok(tokio::fs::read(&path).await?);
        }
        debug!(file_id, "downloading to content cache");
        let bytes = files.download(file_id).await?;
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        tokio::fs::write(&path, &bytes).await?;
        Ok(bytes)
    }

    fn cache_path(&self, file_id: &str) -> PathBuf {
        // File ids are opaque tokens from the platform; strip anything that
        // could traverse out of the cache directory.
        let safe: String = file_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        self.cache_dir.join(safe)
    }
}

/// Determine the MIME type by content inspection, with two normalisations:
/// unidentifiable content ships as `application/pdf` (the service rejects
/// octet-stream), and `application/*` audio containers remap to `audio/*`
/// when the name's extension signals audio.
pub fn sniff_mime(bytes: &[u8], file_name: &str) -> String {
    let sniffed = infer::get(bytes).map(|t| t.mime_type().to_string());

    let mime = match sniffed {
        Some(m) if m != "application/octet-stream" => m,
        _ => "application/pdf".to_string(),
    };

    if mime.starts_with("application/") {
        let by_name = mime_guess::from_path(Path::new(file_name)).first_raw();
        if let Some(guessed) = by_name {
            if guessed.starts_with("audio/") {
                return guessed.to_string();
            }
        }
    }

    mime
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_png_content() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
        assert_eq!(sniff_mime(&png, "blob"), "image/png");
    }

    #[test]
    fn unknown_content_becomes_pdf() {
        assert_eq!(sniff_mime(&[0x00, 0x01, 0x02, 0x03], "blob"), "application/pdf");
    }

    #[test]
    fn pdf_magic_stays_pdf() {
        let pdf = b"%PDF-1.7 rest of file";
        assert_eq!(sniff_mime(pdf, "doc"), "application/pdf");
    }

    #[test]
    fn audio_extension_remaps_application_mime() {
        // Unidentifiable bytes with an audio extension take the audio type.
        assert_eq!(sniff_mime(&[0x00, 0x01], "voice_note.mp3"), "audio/mpeg");
        assert!(sniff_mime(&[0x00, 0x01], "sample.wav").starts_with("audio/"));
    }

    #[test]
    fn cache_path_strips_traversal() {
        let resolver = MediaResolver::new(reqwest::Client::new(), "/cache");
        let path = resolver.cache_path("../../etc/passwd");
        assert_eq!(path, PathBuf::from("/cache/etcpasswd"));
    }

    #[tokio::test]
    async fn cached_bytes_downloads_once() {
        struct CountingFiles(std::sync::atomic::AtomicUsize);

        #[async_trait]
        impl PlatformFiles for CountingFiles {
            async fn download(&self, _file_id: &str) -> Result<Vec<u8>, MediaError> {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(vec![1, 2, 3])
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let resolver = MediaResolver::new(reqwest::Client::new(), dir.path());
        let files = CountingFiles(std::sync::atomic::AtomicUsize::new(0));

        let first = resolver.cached_bytes(&files, "fileA").await.unwrap();
        let second = resolver.cached_bytes(&files, "fileA").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(files.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn photo_base64_roundtrips() {
        struct OneFile;

        #[async_trait]
        impl PlatformFiles for OneFile {
            async fn download(&self, _file_id: &str) -> Result<Vec<u8>, MediaError> {
                Ok(b"jpegdata".to_vec())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let resolver = MediaResolver::new(reqwest::Client::new(), dir.path());
        let encoded = resolver.photo_base64(&OneFile, "photo1").await.unwrap();
        assert_eq!(
            base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .unwrap(),
            b"jpegdata"
        );
    }
}
