//! Built-in `inspect` operation: validates comic archives without
//! modifying them.
//!
//! Checks that the item is a readable file with a comic archive extension
//! and that its header matches a known archive format.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::AsyncReadExt;

use crate::error::ProcessError;
use crate::processors::{ItemOutcome, ItemProcessor};

/// Bytes read from the start of each file; enough for the tar magic.
const HEADER_LEN: usize = 512;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_MAGIC: &[u8] = b"PK\x05\x06";
const RAR_MAGIC: &[u8] = b"Rar!\x1a\x07";
const SEVEN_ZIP_MAGIC: &[u8] = b"7z\xbc\xaf\x27\x1c";
const TAR_MAGIC: &[u8] = b"ustar";
const TAR_MAGIC_OFFSET: usize = 257;

/// Archive container formats recognised by header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Rar,
    SevenZip,
    Tar,
}

impl ArchiveFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Rar => "rar",
            Self::SevenZip => "7z",
            Self::Tar => "tar",
        }
    }

    /// Format implied by a file extension (case-insensitive).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "cbz" | "zip" => Some(Self::Zip),
            "cbr" | "rar" => Some(Self::Rar),
            "cb7" | "7z" => Some(Self::SevenZip),
            "cbt" | "tar" => Some(Self::Tar),
            _ => None,
        }
    }

    /// Detect the format from the leading bytes of a file.
    pub fn sniff(header: &[u8]) -> Option<Self> {
        if header.starts_with(ZIP_MAGIC) || header.starts_with(ZIP_EMPTY_MAGIC) {
            Some(Self::Zip)
        } else if header.starts_with(RAR_MAGIC) {
            Some(Self::Rar)
        } else if header.starts_with(SEVEN_ZIP_MAGIC) {
            Some(Self::SevenZip)
        } else if header
            .get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len())
            .is_some_and(|m| m == TAR_MAGIC)
        {
            Some(Self::Tar)
        } else {
            None
        }
    }
}

/// Resolve `.` and `..` lexically (no filesystem access).
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if components
                    .last()
                    .is_some_and(|c| matches!(c, Component::Normal(_)))
                {
                    components.pop();
                }
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Read-only archive validator.
pub struct ArchiveInspector {
    library_root: Option<PathBuf>,
}

impl ArchiveInspector {
    /// Inspector that accepts any path.
    pub fn new() -> Self {
        Self { library_root: None }
    }

    /// Inspector restricted to files under `root`. Relative items are
    /// resolved against it.
    pub fn with_library_root(root: impl Into<PathBuf>) -> Self {
        Self {
            library_root: Some(root.into()),
        }
    }

    /// Resolve an item to a path, enforcing the library root.
    ///
    /// `Ok(Err(msg))` is a per-item rejection; `Err` means the root itself is
    /// unusable and no item can succeed.
    async fn resolve(&self, item: &str) -> Result<Result<PathBuf, String>, ProcessError> {
        let raw = PathBuf::from(item);
        let Some(root) = &self.library_root else {
            return Ok(Ok(raw));
        };

        let root = tokio::fs::canonicalize(root)
            .await
            .map_err(|e| ProcessError::Fatal {
                name: "inspect".to_string(),
                reason: format!("library root {} unavailable: {e}", root.display()),
            })?;

        let joined = if raw.is_absolute() {
            raw
        } else {
            root.join(raw)
        };
        let resolved = match tokio::fs::canonicalize(&joined).await {
            Ok(p) => p,
            Err(_) => normalize_lexical(&joined),
        };

        if resolved.starts_with(&root) {
            Ok(Ok(resolved))
        } else {
            Ok(Err(format!("{item} is outside the library root")))
        }
    }
}

impl Default for ArchiveInspector {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_header(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

#[async_trait]
impl ItemProcessor for ArchiveInspector {
    fn name(&self) -> &str {
        "inspect"
    }

    fn description(&self) -> &str {
        "Validate comic archives (cbz, cbr, cb7, cbt) by extension and header"
    }

    async fn process(&self, item: &str) -> Result<ItemOutcome, ProcessError> {
        let path = match self.resolve(item).await? {
            Ok(path) => path,
            Err(reason) => return Ok(ItemOutcome::failed(reason)),
        };

        let Some(expected) = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(ArchiveFormat::from_extension)
        else {
            return Ok(ItemOutcome::failed(format!(
                "{item}: not a comic archive extension"
            )));
        };

        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(ItemOutcome::failed(format!("{item}: not a regular file"))),
            Err(e) => return Ok(ItemOutcome::failed(format!("{item}: {e}"))),
        };

        let header = match read_header(&path).await {
            Ok(h) => h,
            Err(e) => return Ok(ItemOutcome::failed(format!("{item}: {e}"))),
        };

        let Some(detected) = ArchiveFormat::sniff(&header) else {
            return Ok(ItemOutcome::failed(format!(
                "{item}: not a valid {} archive",
                expected.as_str()
            )));
        };

        let mut details = Map::new();
        details.insert("format".into(), Value::from(detected.as_str()));
        details.insert("size_bytes".into(), Value::from(meta.len()));
        if detected != expected {
            tracing::debug!(
                item,
                expected = expected.as_str(),
                detected = detected.as_str(),
                "Archive extension does not match contents"
            );
            details.insert("extension_mismatch".into(), Value::Bool(true));
        }

        Ok(ItemOutcome::ok().with_details(details))
    }
}
