//! Input resolution: turn the user's INPUT (path, URL, or nothing) into a
//! local PDF path plus a document id.
//!
//! ## Why download to a temp file?
//!
//! pdfium requires a file-system path; it cannot stream from a byte buffer.
//! Downloading to a `TempDir` gives us a path pdfium can open while ensuring
//! cleanup happens automatically when `ResolvedInput` is dropped, even if
//! the process panics. Re-rasterisation in Stage 2 reopens the same path,
//! so the `ResolvedInput` must outlive the whole pipeline run.

use crate::error::PipelineError;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info};

/// The resolved input: either a local path or a downloaded temp file.
#[derive(Debug)]
pub enum ResolvedInput {
    /// Input was already a local file.
    Local(PathBuf),
    /// Input was a URL; PDF downloaded to a temp directory.
    /// The `TempDir` is kept alive to prevent cleanup until processing completes.
    Downloaded { path: PathBuf, _temp_dir: TempDir },
}

impl ResolvedInput {
    /// Get the path to the PDF file regardless of how it was resolved.
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Downloaded { path, .. } => path,
        }
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve INPUT to a local PDF.
///
/// - `None`: the first PDF (by name) in `input_dir`
/// - URL: downloaded with a `download_timeout` deadline
/// - anything else: a local path, checked for existence and `%PDF` magic
pub async fn resolve_input(
    input: Option<&str>,
    input_dir: &Path,
    download_timeout: Duration,
) -> Result<ResolvedInput, PipelineError> {
    match input {
        None => {
            let path = discover_first_pdf(input_dir)?;
            info!("No INPUT given; using {}", path.display());
            check_local(path)
        }
        Some(s) if is_url(s) => download_url(s, download_timeout).await,
        Some(s) if s.trim().is_empty() => Err(PipelineError::InvalidInput {
            input: s.to_string(),
        }),
        Some(s) => check_local(PathBuf::from(s)),
    }
}

/// First `*.pdf` file in `dir`, case-insensitive, sorted by file name.
pub fn discover_first_pdf(dir: &Path) -> Result<PathBuf, PipelineError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PipelineError::NoInput {
                dir: dir.to_path_buf(),
            })
        }
        Err(e) => return Err(PipelineError::io(dir, e)),
    };

    let mut pdfs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && has_pdf_extension(p))
        .collect();
    pdfs.sort();

    pdfs.into_iter().next().ok_or_else(|| PipelineError::NoInput {
        dir: dir.to_path_buf(),
    })
}

fn has_pdf_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"))
}

/// Document id used in session names and artifact metadata: the file stem.
pub fn document_id(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("document")
        .to_string()
}

/// Validate a local file: it must exist, be readable and start with `%PDF`.
fn check_local(path: PathBuf) -> Result<ResolvedInput, PipelineError> {
    if !path.is_file() {
        return Err(PipelineError::FileNotFound { path });
    }

    let mut f = std::fs::File::open(&path).map_err(|e| PipelineError::io(&path, e))?;
    let mut magic = [0u8; 4];
    f.read_exact(&mut magic).map_err(|e| PipelineError::io(&path, e))?;
    if &magic != b"%PDF" {
        return Err(PipelineError::NotAPdf { path, magic });
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(ResolvedInput::Local(path))
}

/// Download a URL to a temporary directory and return the path.
async fn download_url(url: &str, timeout: Duration) -> Result<ResolvedInput, PipelineError> {
    info!("Downloading PDF from: {}", url);
    let failed = |reason: String| PipelineError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            failed(format!("timed out after {}s", timeout.as_secs()))
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let filename = filename_from_url(url);
    let temp_dir = TempDir::new().map_err(|e| PipelineError::io(std::env::temp_dir(), e))?;
    let file_path = temp_dir.path().join(&filename);

    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;

    if bytes.len() < 4 || &bytes[..4] != b"%PDF" {
        let mut magic = [0u8; 4];
        let n = bytes.len().min(4);
        magic[..n].copy_from_slice(&bytes[..n]);
        return Err(PipelineError::NotAPdf {
            path: file_path,
            magic,
        });
    }

    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| PipelineError::io(&file_path, e))?;

    info!("Downloaded {} bytes to: {}", bytes.len(), file_path.display());

    Ok(ResolvedInput::Downloaded {
        path: file_path,
        _temp_dir: temp_dir,
    })
}

/// Last path segment when it looks like a file name, else `downloaded.pdf`.
fn filename_from_url(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }

    "downloaded.pdf".to_string()
}
