use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

static BINARY_EXTENSIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "exe", "dll", "so", "dylib", "a", "o", "obj", "png", "jpg", "jpeg", "gif", "bmp", "ico",
        "webp", "avif", "mp3", "mp4", "avi", "mkv", "mov", "wav", "flac", "pdf", "doc", "docx",
        "xls", "xlsx", "ppt", "pptx", "zip", "tar", "gz", "bz2", "xz", "7z", "rar", "wasm", "pyc",
        "class", "woff", "woff2", "ttf", "otf", "eot",
    ]
    .into_iter()
    .collect()
});

/// Snapshot of one pseudo-code input taken at read time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// File name without directories
    pub name: String,

    /// Path relative to the source root, `/`-separated
    pub path: String,

    /// Absolute path the content was read from
    pub absolute_path: PathBuf,

    /// Full text at the moment of read
    pub content: String,
}

impl SourceFile {
    /// Creates a snapshot from already-loaded content.
    #[must_use]
    pub fn new(path: impl Into<String>, absolute_path: PathBuf, content: String) -> Self {
        let path = normalize_relative(&path.into());
        let name = path.rsplit('/').next().unwrap_or(&path).to_string();
        Self {
            name,
            path,
            absolute_path,
            content,
        }
    }

    /// Reads `relative` below `root`.
    ///
    /// Returns `Ok(None)` for files that look binary; those are never sent
    /// to the completion service.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid UTF-8.
    pub async fn read(root: &Path, relative: &Path) -> Result<Option<Self>> {
        let absolute = root.join(relative);

        if has_binary_extension(&absolute) {
            return Ok(None);
        }

        let bytes = tokio::fs::read(&absolute)
            .await
            .map_err(|e| Error::io(&absolute, e))?;

        Self::from_bytes(relative.to_string_lossy(), absolute, bytes)
    }

    /// Builds a snapshot from raw file bytes already read from `absolute_path`.
    ///
    /// Returns `Ok(None)` if the bytes look binary.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not valid UTF-8.
    pub(crate) fn from_bytes(
        path: impl Into<String>,
        absolute_path: PathBuf,
        bytes: Vec<u8>,
    ) -> Result<Option<Self>> {
        if looks_binary(&bytes) {
            return Ok(None);
        }

        let content =
            String::from_utf8(bytes).map_err(|_| Error::invalid_utf8(&absolute_path))?;

        Ok(Some(Self::new(path, absolute_path, content)))
    }

    /// File extension without the leading dot, if any.
    #[must_use]
    pub fn extension(&self) -> Option<&str> {
        Path::new(&self.name).extension().and_then(|ext| ext.to_str())
    }

    /// Destination of the generated output below `output_root`.
    #[must_use]
    pub fn output_path(&self, output_root: &Path) -> PathBuf {
        self.path
            .split('/')
            .fold(output_root.to_path_buf(), |acc, part| acc.join(part))
    }
}

/// Converts a platform path string to the `/`-separated form used for keys.
fn normalize_relative(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches("./").to_string()
}

/// Content sniffing over (at most) the first 8KB of `bytes`.
fn looks_binary(bytes: &[u8]) -> bool {
    const SAMPLE_SIZE: usize = 8192;
    const ASCII_THRESHOLD: f64 = 0.85;

    let sample = &bytes[..bytes.len().min(SAMPLE_SIZE)];
    if sample.is_empty() {
        return false;
    }

    if memchr::memchr(0, sample).is_some() {
        return true;
    }

    // Valid UTF-8 prose in other scripts is mostly non-ASCII; don't reject it.
    match std::str::from_utf8(sample) {
        Ok(_) => return false,
        // Sample cut in the middle of a multi-byte character.
        Err(e) if e.error_len().is_none() => return false,
        Err(_) => {}
    }

    let ascii_count = sample.iter().filter(|&&b| b < 128).count();
    let ascii_ratio = ascii_count as f64 / sample.len() as f64;

    ascii_ratio < ASCII_THRESHOLD
}

/// Checks if a file extension suggests a binary file.
#[must_use]
pub(crate) fn has_binary_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| BINARY_EXTENSIONS.contains(ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
