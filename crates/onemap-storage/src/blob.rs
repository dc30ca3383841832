//! Raw snapshot file storage used by the ingestion glue (inbox imports).

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::fs::write_atomically;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub path: String,
    pub content_hash: String,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn download(&self, path: &str) -> anyhow::Result<Vec<u8>>;
    async fn upload(&self, path: &str, bytes: &[u8]) -> anyhow::Result<StoredBlob>;
    /// Paths under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("blob path '{path}' must be relative and must not contain '..'");
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn download(&self, path: &str) -> anyhow::Result<Vec<u8>> {
        let absolute = self.resolve(path)?;
        fs::read(&absolute)
            .await
            .with_context(|| format!("reading blob {}", absolute.display()))
    }

    async fn upload(&self, path: &str, bytes: &[u8]) -> anyhow::Result<StoredBlob> {
        let absolute = self.resolve(path)?;
        let content_hash = sha256_hex(bytes);

        if fs::try_exists(&absolute)
            .await
            .with_context(|| format!("checking blob path {}", absolute.display()))?
        {
            let existing = fs::read(&absolute)
                .await
                .with_context(|| format!("reading blob {}", absolute.display()))?;
            if sha256_hex(&existing) == content_hash {
                return Ok(StoredBlob {
                    path: path.to_string(),
                    content_hash,
                    byte_size: bytes.len(),
                    deduplicated: true,
                });
            }
        }

        write_atomically(&absolute, bytes).await?;
        Ok(StoredBlob {
            path: path.to_string(),
            content_hash,
            byte_size: bytes.len(),
            deduplicated: false,
        })
    }

    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let mut out = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("listing {}", dir.display()))
                }
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .with_context(|| format!("listing {}", dir.display()))?
            {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let relative = path
                    .strip_prefix(&self.root)
                    .unwrap_or(&path)
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join("/");
                if relative.starts_with(prefix) {
                    out.push(relative);
                }
            }
        }
        out.sort();
        Ok(out)
    }
}
