//! Chunked submodel/variable-content file transport: the receiver
//! writes every `FileChunk` to a `.part` sibling of its final
//! destination and only renames it into place once the EOF-marked
//! chunk's sha256 checks out, so a half-received file is never
//! observable at `<base_dir>/<session>/<root_model>/<relative>`.

use crate::error::{Error, Result};
use crate::proto::FileChunk;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufWriter};

/// Destination path for one file transfer, resolved before any bytes
/// arrive so a malicious or buggy `relative_path` can be rejected up
/// front instead of escaping `base_dir` via `..` segments.
#[must_use]
pub fn destination_path(base_dir: &Path, session: &str, root_model: &str, relative: &str) -> Result<PathBuf> {
    if relative.split('/').any(|seg| seg == "..") {
        return Err(Error::FileIntegrity(format!("relative path escapes base dir: {relative}")));
    }
    Ok(base_dir.join(session).join(root_model).join(relative))
}

/// Accumulates chunks for a single file transfer and performs the
/// write-to-temp-then-rename finish.
pub struct FileReceiver {
    final_path: PathBuf,
    temp_path: PathBuf,
    writer: Option<BufWriter<tokio::fs::File>>,
    hasher: Sha256,
    bytes_written: u64,
}

impl FileReceiver {
    /// Open the `.part` temp file for a destination, creating parent
    /// directories as needed.
    pub async fn create(final_path: PathBuf) -> Result<Self> {
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path = temp_path_for(&final_path);
        let file = tokio::fs::File::create(&temp_path).await?;
        Ok(Self {
            final_path,
            temp_path,
            writer: Some(BufWriter::new(file)),
            hasher: Sha256::new(),
            bytes_written: 0,
        })
    }

    /// Append one chunk's payload. On `chunk.is_last`, flush, verify
    /// the running sha256 against `chunk.expected_sha256` (when
    /// non-empty), and atomically rename the temp file into place.
    pub async fn accept(&mut self, chunk: &FileChunk) -> Result<u64> {
        let writer = self.writer.as_mut().ok_or_else(|| Error::FileIntegrity("chunk received after close".into()))?;
        writer.write_all(&chunk.data).await?;
        self.hasher.update(&chunk.data);
        self.bytes_written += chunk.data.len() as u64;

        if chunk.is_last {
            self.finish(&chunk.expected_sha256).await?;
        }
        Ok(self.bytes_written)
    }

    async fn finish(&mut self, expected_sha256: &str) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
            writer.shutdown().await?;
        }

        if !expected_sha256.is_empty() {
            let digest = format!("{:x}", self.hasher.clone().finalize());
            if digest != expected_sha256 {
                tokio::fs::remove_file(&self.temp_path).await.ok();
                return Err(Error::FileIntegrity(format!(
                    "sha256 mismatch for {}: expected {expected_sha256}, got {digest}",
                    self.final_path.display()
                )));
            }
        }

        tokio::fs::rename(&self.temp_path, &self.final_path).await?;
        Ok(())
    }
}

fn temp_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    final_path.with_file_name(name)
}

/// Splits a file on disk into a sequence of `FileChunk`s of at most
/// `chunk_size` bytes, the last carrying `is_last = true` and the
/// whole file's sha256.
pub async fn read_chunks(
    path: &Path,
    session_id: &str,
    root_model: &str,
    relative_path: &str,
    chunk_size: usize,
) -> Result<Vec<FileChunk>> {
    let bytes = tokio::fs::read(path).await?;
    let expected_sha256 = format!("{:x}", Sha256::digest(&bytes));

    let mut chunks = Vec::new();
    let mut offset = 0;
    if bytes.is_empty() {
        chunks.push(FileChunk {
            session_id: session_id.to_string(),
            root_model: root_model.to_string(),
            relative_path: relative_path.to_string(),
            data: Vec::new(),
            is_last: true,
            expected_sha256: expected_sha256.clone(),
        });
        return Ok(chunks);
    }
    while offset < bytes.len() {
        let end = (offset + chunk_size).min(bytes.len());
        let is_last = end == bytes.len();
        chunks.push(FileChunk {
            session_id: session_id.to_string(),
            root_model: root_model.to_string(),
            relative_path: relative_path.to_string(),
            data: bytes[offset..end].to_vec(),
            is_last,
            expected_sha256: if is_last { expected_sha256.clone() } else { String::new() },
        });
        offset = end;
    }
    Ok(chunks)
}
