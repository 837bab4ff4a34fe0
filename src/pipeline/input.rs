//! Input resolution: media-type detection and loading documents from a
//! local path or an HTTP(S) URL.
//!
//! The server receives raw bytes with a declared content type; the CLI
//! receives a path or URL. Both end up as an [`InputDocument`] whose media
//! type is settled by [`resolve_media_type`] before any work is queued, so
//! an unsupported upload is rejected at submission time.

use crate::error::OcrError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Document formats the rasterizer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Pdf,
    Png,
    Jpeg,
    Tiff,
}

impl MediaType {
    pub fn as_mime(self) -> &'static str {
        match self {
            MediaType::Pdf => "application/pdf",
            MediaType::Png => "image/png",
            MediaType::Jpeg => "image/jpeg",
            MediaType::Tiff => "image/tiff",
        }
    }

    /// Map a MIME type (parameters and case ignored) to a supported format.
    pub fn from_mime(mime: &str) -> Option<Self> {
        match normalise_mime(mime).as_str() {
            "application/pdf" | "application/x-pdf" => Some(MediaType::Pdf),
            "image/png" => Some(MediaType::Png),
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(MediaType::Jpeg),
            "image/tiff" | "image/tif" | "image/x-tiff" => Some(MediaType::Tiff),
            _ => None,
        }
    }

    /// Detect the format from magic bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(MediaType::Png)
        } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(MediaType::Jpeg)
        } else if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
            Some(MediaType::Tiff)
        } else if find_pdf_header(bytes) {
            Some(MediaType::Pdf)
        } else {
            None
        }
    }

    /// Guess from a file extension.
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "pdf" => Some(MediaType::Pdf),
            "png" => Some(MediaType::Png),
            "jpg" | "jpeg" => Some(MediaType::Jpeg),
            "tif" | "tiff" => Some(MediaType::Tiff),
            _ => None,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_mime())
    }
}

/// PDF readers tolerate junk before the header; so do we, within 1 KiB.
fn find_pdf_header(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(1024)];
    window.windows(5).any(|w| w == b"%PDF-")
}

fn normalise_mime(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

fn is_generic_mime(mime: &str) -> bool {
    matches!(
        normalise_mime(mime).as_str(),
        "" | "application/octet-stream" | "binary/octet-stream" | "application/unknown"
    )
}

/// Settle the media type of a submission.
///
/// A declared supported type wins. A missing or generic declaration
/// (`application/octet-stream`) falls back to magic-byte detection. Any other
/// declaration, or content that matches no known signature, is
/// [`OcrError::UnsupportedFormat`]. A declared type that disagrees with the
/// content surfaces later as [`OcrError::CorruptInput`] when decoding fails.
pub fn resolve_media_type(declared: Option<&str>, bytes: &[u8]) -> Result<MediaType, OcrError> {
    match declared {
        Some(mime) if !is_generic_mime(mime) => {
            MediaType::from_mime(mime).ok_or_else(|| OcrError::UnsupportedFormat {
                media_type: normalise_mime(mime),
            })
        }
        _ => MediaType::sniff(bytes).ok_or_else(|| OcrError::UnsupportedFormat {
            media_type: declared
                .map(normalise_mime)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "unknown".to_string()),
        }),
    }
}

/// Raw document bytes plus what is known about their type.
#[derive(Debug, Clone)]
pub struct InputDocument {
    pub bytes: Vec<u8>,
    /// Declared MIME type (from the upload, the HTTP response, or the file extension).
    pub declared_type: Option<String>,
    /// File name or URL, for logs.
    pub name: String,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Load a document from a local path or an HTTP/HTTPS URL.
pub async fn load_input(input: &str, timeout_secs: u64) -> Result<InputDocument, OcrError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        load_local(PathBuf::from(input)).await
    }
}

async fn load_local(path: PathBuf) -> Result<InputDocument, OcrError> {
    let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => OcrError::FileNotFound { path: path.clone() },
        _ => OcrError::Internal(format!("Failed to read '{}': {}", path.display(), e)),
    })?;

    debug!("Loaded {} bytes from {}", bytes.len(), path.display());
    Ok(InputDocument {
        declared_type: MediaType::from_extension(&path).map(|m| m.as_mime().to_string()),
        name: path.display().to_string(),
        bytes,
    })
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<InputDocument, OcrError> {
    info!("Downloading document from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| OcrError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            OcrError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            OcrError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(OcrError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let declared_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let bytes = response
        .bytes()
        .await
        .map_err(|e| OcrError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    info!("Downloaded {} bytes", bytes.len());

    Ok(InputDocument {
        bytes: bytes.to_vec(),
        declared_type,
        name: url.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/scan.pdf"));
        assert!(is_url("http://example.com/scan.png"));
        assert!(!is_url("/tmp/scan.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn sniff_known_signatures() {
        assert_eq!(MediaType::sniff(PNG_MAGIC), Some(MediaType::Png));
        assert_eq!(MediaType::sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(MediaType::Jpeg));
        assert_eq!(MediaType::sniff(b"II*\0\x08\0\0\0"), Some(MediaType::Tiff));
        assert_eq!(MediaType::sniff(b"MM\0*\0\0\0\x08"), Some(MediaType::Tiff));
        assert_eq!(MediaType::sniff(b"%PDF-1.7\n"), Some(MediaType::Pdf));
        assert_eq!(MediaType::sniff(b"\r\n\n%PDF-1.4"), Some(MediaType::Pdf));
        assert_eq!(MediaType::sniff(b"GIF89a"), None);
        assert_eq!(MediaType::sniff(b""), None);
    }

    #[test]
    fn declared_type_wins_and_ignores_parameters() {
        let m = resolve_media_type(Some("Image/JPEG; charset=binary"), PNG_MAGIC).unwrap();
        assert_eq!(m, MediaType::Jpeg);
    }

    #[test]
    fn generic_declaration_falls_back_to_sniffing() {
        let m = resolve_media_type(Some("application/octet-stream"), PNG_MAGIC).unwrap();
        assert_eq!(m, MediaType::Png);
        let m = resolve_media_type(None, b"%PDF-1.5").unwrap();
        assert_eq!(m, MediaType::Pdf);
    }

    #[test]
    fn unsupported_declaration_is_rejected() {
        let err = resolve_media_type(Some("image/gif"), b"GIF89a").unwrap_err();
        match err {
            OcrError::UnsupportedFormat { media_type } => assert_eq!(media_type, "image/gif"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn undetectable_content_is_rejected() {
        let err = resolve_media_type(None, b"plain text").unwrap_err();
        assert_eq!(err.kind(), "unsupported_format");
    }

    #[test]
    fn extension_mapping() {
        assert_eq!(
            MediaType::from_extension(Path::new("scan.TIF")),
            Some(MediaType::Tiff)
        );
        assert_eq!(MediaType::from_extension(Path::new("notes.txt")), None);
    }

    #[tokio::test]
    async fn load_local_file_uses_extension_as_declared_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.png");
        std::fs::write(&path, PNG_MAGIC).unwrap();

        let doc = load_input(path.to_str().unwrap(), 5).await.unwrap();
        assert_eq!(doc.bytes, PNG_MAGIC);
        assert_eq!(doc.declared_type.as_deref(), Some("image/png"));
    }

    #[test]
    fn load_missing_file() {
        let err = tokio_test::block_on(load_input("/definitely/not/here.pdf", 5)).unwrap_err();
        assert!(matches!(err, OcrError::FileNotFound { .. }));
    }
}
