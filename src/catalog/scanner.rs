//! Directory scan producing [`ModelDescriptor`]s.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::gguf;
use crate::catalog::CatalogError;

/// Stable model identifier: the canonical absolute path of the artifact.
pub type ModelId = String;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Quantization label used when nothing cheaper than a full parse would tell.
pub const UNKNOWN_QUANTIZATION: &str = "unknown";

/// Description of one model artifact found by a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Canonical absolute path, stable across scans while the file stays put.
    pub id: ModelId,

    /// File name without extension, separators replaced by spaces.
    pub name: String,

    /// Size in gigabytes rounded to two decimals.
    pub size_gb: f64,

    /// Display form of `size_gb`, e.g. "4.37 GB".
    pub size: String,

    pub size_bytes: u64,

    /// Quantization label, or "unknown".
    pub quantization: String,

    /// `general.architecture` when the header was inspected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,

    pub path: PathBuf,
}

/// Options controlling a scan.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Extension without the leading dot, compared case-insensitively.
    pub extension: String,

    /// Peek at GGUF headers for quantization metadata.
    pub inspect_headers: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            extension: "gguf".to_string(),
            inspect_headers: true,
        }
    }
}

/// Enumerate model artifacts in `dir`.
///
/// A missing directory is created and yields an empty catalog. Results come
/// back in directory order; callers sort if they need a stable presentation.
pub fn scan(dir: &Path, options: &ScanOptions) -> Result<Vec<ModelDescriptor>, CatalogError> {
    if !dir.exists() {
        info!(dir = %dir.display(), "Model directory missing, creating it");
        fs::create_dir_all(dir).map_err(|source| CatalogError::Create {
            path: dir.to_path_buf(),
            source,
        })?;
        return Ok(Vec::new());
    }

    if !dir.is_dir() {
        return Err(CatalogError::NotADirectory(dir.to_path_buf()));
    }

    let entries = fs::read_dir(dir).map_err(|source| CatalogError::Read {
        path: dir.to_path_buf(),
        source,
    })?;

    let extension = options.extension.trim_start_matches('.');
    let mut models = Vec::new();

    for entry in entries {
        let entry = entry.map_err(|source| CatalogError::Read {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();

        let matches_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(extension));
        if !matches_ext {
            continue;
        }

        match describe(&path, options) {
            Ok(Some(descriptor)) => models.push(descriptor),
            Ok(None) => {}
            // A single unreadable file should not hide the rest of the catalog.
            Err(e) => warn!(path = %path.display(), "Skipping model file: {e}"),
        }
    }

    debug!(dir = %dir.display(), count = models.len(), "Scan complete");
    Ok(models)
}

/// Build a descriptor for one file; `None` for non-regular files.
fn describe(path: &Path, options: &ScanOptions) -> std::io::Result<Option<ModelDescriptor>> {
    let metadata = fs::metadata(path)?;
    if !metadata.is_file() {
        return Ok(None);
    }

    let canonical = fs::canonicalize(path)?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let size_bytes = metadata.len();
    let size_gb = round2(size_bytes as f64 / BYTES_PER_GB);

    let header = if options.inspect_headers {
        match gguf::read_header(path) {
            Ok(header) => Some(header),
            Err(e) => {
                debug!(path = %path.display(), "No usable GGUF header: {e}");
                None
            }
        }
    } else {
        None
    };

    let quantization = header
        .as_ref()
        .and_then(|h| h.quantization())
        .or_else(|| gguf::quantization_from_name(&stem))
        .unwrap_or(UNKNOWN_QUANTIZATION)
        .to_string();

    Ok(Some(ModelDescriptor {
        id: canonical.to_string_lossy().into_owned(),
        name: display_name(&stem),
        size_gb,
        size: format!("{size_gb:.2} GB"),
        size_bytes,
        quantization,
        architecture: header.and_then(|h| h.architecture),
        path: canonical,
    }))
}

/// `mistral-7b_instruct` → `mistral 7b instruct`.
pub fn display_name(stem: &str) -> String {
    stem.replace(['-', '_'], " ")
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
