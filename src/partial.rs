//! File naming shared by the Worker (writer) and the Progress Watcher
//! (reader).
//!
//! A job for resource `R` produces `<dir>/<escaped R>.<ext>` and, while the
//! tool runs, `<dir>/<escaped R>.<ext>.part`. Escaping is reversible so a
//! partial file name always maps back to exactly one resource id. Nothing
//! outside this module knows the convention.

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::trace;

pub const PARTIAL_SUFFIX: &str = ".part";

#[derive(Debug, Clone)]
pub struct OutputLayout {
    dir: PathBuf,
    extension: String,
}

impl OutputLayout {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        let extension = extension.into();
        OutputLayout {
            dir: dir.into(),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn artifact_name(&self, resource_id: &str) -> String {
        format!("{}.{}", escape(resource_id), self.extension)
    }

    pub fn artifact_path(&self, resource_id: &str) -> PathBuf {
        self.dir.join(self.artifact_name(resource_id))
    }

    pub fn partial_path(&self, resource_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}{PARTIAL_SUFFIX}", self.artifact_name(resource_id)))
    }

    /// The resource a partial file belongs to, or `None` when the name does
    /// not follow the convention.
    pub fn resource_for_partial(&self, file_name: &str) -> Option<String> {
        let stem = file_name
            .strip_suffix(PARTIAL_SUFFIX)?
            .strip_suffix(self.extension.as_str())?
            .strip_suffix('.')?;
        if stem.is_empty() {
            return None;
        }
        unescape(stem)
    }

    /// Lists the partial files currently present together with their sizes.
    /// A missing directory reads as empty.
    pub async fn scan(&self) -> std::io::Result<Vec<PartialFile>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(resource_id) = name.to_str().and_then(|n| self.resource_for_partial(n)) else {
                continue;
            };
            // The tool may rename the file between listing and stat.
            match entry.metadata().await {
                Ok(meta) if meta.is_file() => found.push(PartialFile {
                    resource_id,
                    path: entry.path(),
                    size: meta.len(),
                }),
                Ok(_) => {}
                Err(err) => trace!(path = ?entry.path(), error = %err, "Partial file vanished"),
            }
        }
        Ok(found)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialFile {
    pub resource_id: String,
    pub path: PathBuf,
    pub size: u64,
}

fn is_plain(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.')
}

fn escape(resource_id: &str) -> String {
    let mut out = String::with_capacity(resource_id.len());
    for byte in resource_id.bytes() {
        if is_plain(byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Only the digits `escape` emits, so every name decodes from one spelling.
fn upper_hex(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}

fn unescape(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = upper_hex(*bytes.get(i + 1)?)?;
                let lo = upper_hex(*bytes.get(i + 2)?)?;
                let byte = hi << 4 | lo;
                if is_plain(byte) {
                    return None;
                }
                out.push(byte);
                i += 3;
            }
            byte if is_plain(byte) => {
                out.push(byte);
                i += 1;
            }
            _ => return None,
        }
    }
    String::from_utf8(out).ok()
}
