//! Single-file tar archives for the Docker archive-extraction endpoint.
//!
//! `PUT /containers/{id}/archive?path=<dir>` extracts a tar stream into
//! `<dir>`. Writing one file means building a one-entry archive whose entry
//! name is the file's base name and uploading it against the parent dir.

use std::path::{Component, Path, PathBuf};

use crate::sandbox::error::SandboxError;
use crate::sandbox::types::SANDBOX_HOME;

/// Target of a file write, split for the archive endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveTarget {
    /// Absolute directory the archive is extracted into.
    pub parent: String,
    /// Entry name inside the archive.
    pub file_name: String,
}

impl ArchiveTarget {
    /// Normalise `path` and split it. Relative paths resolve against the
    /// sandbox home directory; `.` and `..` are folded lexically.
    pub fn resolve(path: &str) -> Result<Self, SandboxError> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(SandboxError::Transfer("empty file path".into()));
        }
        let raw = Path::new(trimmed);
        let joined = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            Path::new(SANDBOX_HOME).join(raw)
        };

        let mut normal = PathBuf::from("/");
        for component in joined.components() {
            match component {
                Component::Normal(part) => normal.push(part),
                Component::ParentDir => {
                    normal.pop();
                }
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }

        let file_name = normal
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from)
            .ok_or_else(|| SandboxError::Transfer(format!("not a file path: {path:?}")))?;
        let parent = normal
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());

        Ok(Self { parent, file_name })
    }

    pub fn full_path(&self) -> String {
        if self.parent == "/" {
            format!("/{}", self.file_name)
        } else {
            format!("{}/{}", self.parent, self.file_name)
        }
    }
}

/// Build a ustar archive holding exactly one regular file.
pub fn single_file_archive(file_name: &str, content: &[u8]) -> Result<Vec<u8>, SandboxError> {
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);

    let mut builder = tar::Builder::new(Vec::with_capacity(content.len() + 1024));
    builder
        .append_data(&mut header, file_name, content)
        .map_err(|e| SandboxError::Transfer(format!("failed to build archive for {file_name}: {e}")))?;
    builder
        .into_inner()
        .map_err(|e| SandboxError::Transfer(format!("failed to finish archive for {file_name}: {e}")))
}
