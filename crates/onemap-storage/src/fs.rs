//! Filesystem-backed document store: one JSON file per document, written with
//! an atomic temp-file rename so readers never observe half-written documents.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::document::{validate_collection, Document, DocumentStore, Filter, StoreError, WriteOp};

#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_dir(&self, collection: &str) -> Result<PathBuf, StoreError> {
        validate_collection(collection)?;
        Ok(self.root.join(collection))
    }

    fn document_path(&self, collection: &str, id: &str) -> Result<PathBuf, StoreError> {
        Ok(self
            .collection_dir(collection)?
            .join(format!("{}.json", hex::encode(id.as_bytes()))))
    }

    async fn read_document(path: &Path) -> Result<Option<Value>, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing document {}", path.display()))?;
                Ok(Some(value))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(err, format!("reading document {}", path.display()))),
        }
    }

    /// Sorted ids present in a collection directory.
    async fn list_ids(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.collection_dir(collection)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(err, format!("listing {}", dir.display()))),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| io_error(err, format!("listing {}", dir.display())))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            let Ok(bytes) = hex::decode(stem) else {
                continue;
            };
            if let Ok(id) = String::from_utf8(bytes) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn apply(&self, op: WriteOp) -> Result<(), StoreError> {
        match op {
            WriteOp::Put {
                collection,
                id,
                doc,
            } => self.put(&collection, &id, doc).await,
            WriteOp::Delete { collection, id } => self.delete(&collection, &id).await,
        }
    }
}

fn io_error(err: std::io::Error, context: String) -> StoreError {
    match err.kind() {
        std::io::ErrorKind::Interrupted
        | std::io::ErrorKind::TimedOut
        | std::io::ErrorKind::WouldBlock => StoreError::Transient(format!("{context}: {err}")),
        _ => StoreError::Backend(anyhow::Error::new(err).context(context)),
    }
}

/// Write bytes to `path` through a unique temp file in the same directory and
/// an atomic rename.
pub(crate) async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let path = self.document_path(collection, id)?;
        Self::read_document(&path).await
    }

    async fn put(&self, collection: &str, id: &str, doc: Value) -> Result<(), StoreError> {
        let path = self.document_path(collection, id)?;
        let bytes = serde_json::to_vec_pretty(&doc).map_err(|source| StoreError::Serialization {
            collection: collection.to_string(),
            id: id.to_string(),
            source,
        })?;
        write_atomically(&path, &bytes).await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let path = self.document_path(collection, id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(err, format!("deleting {}", path.display()))),
        }
    }

    async fn query(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        let mut out = Vec::new();
        for id in self.list_ids(collection).await? {
            if let Some(body) = self.get(collection, &id).await? {
                if filter.matches(&body) {
                    out.push(Document { id, body });
                }
            }
        }
        Ok(out)
    }

    async fn page(
        &self,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        let ids = self.list_ids(collection).await?;
        let mut out = Vec::new();
        for id in ids
            .into_iter()
            .filter(|id| after.map_or(true, |a| id.as_str() > a))
        {
            if out.len() >= limit {
                break;
            }
            if let Some(body) = self.get(collection, &id).await? {
                out.push(Document { id, body });
            }
        }
        Ok(out)
    }

    /// Each document is replaced atomically; the batch as a whole is not.
    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        for op in &ops {
            validate_collection(op.collection())?;
        }
        for op in ops {
            self.apply(op).await?;
        }
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<u64, StoreError> {
        Ok(self.list_ids(collection).await?.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn documents_survive_a_reopen() {
        let dir = tempdir().expect("tempdir");
        let store = FsDocumentStore::new(dir.path());
        store
            .put("entities", "LAW/001", json!({"entity_id": "LAW/001"}))
            .await
            .expect("put");

        let reopened = FsDocumentStore::new(dir.path());
        assert_eq!(
            reopened.get("entities", "LAW/001").await.expect("get"),
            Some(json!({"entity_id": "LAW/001"}))
        );
        assert_eq!(reopened.count("entities").await.expect("count"), 1);
    }

    #[tokio::test]
    async fn paging_skips_temp_files_and_orders_ids() {
        let dir = tempdir().expect("tempdir");
        let store = FsDocumentStore::new(dir.path());
        for id in ["b", "a", "c"] {
            store.put("entities", id, json!({"id": id})).await.unwrap();
        }
        tokio::fs::write(dir.path().join("entities").join(".stray.tmp"), b"{")
            .await
            .unwrap();

        let page = store.page("entities", Some("a"), 10).await.unwrap();
        assert_eq!(page.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), ["b", "c"]);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = FsDocumentStore::new(dir.path());
        store.put("import_batches", "b1", json!({})).await.unwrap();
        store.delete("import_batches", "b1").await.unwrap();
        store.delete("import_batches", "b1").await.unwrap();
        assert_eq!(store.get("import_batches", "b1").await.unwrap(), None);
    }
}
