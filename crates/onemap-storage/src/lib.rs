pub mod blob;
pub mod document;
pub mod entities;
pub mod fs;
pub mod ledger;
pub mod memory;
pub mod postgres;
pub mod retry;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use blob::{sha256_hex, BlobStore, FsBlobStore, StoredBlob};
pub use document::{
    from_document, to_document, Document, DocumentStore, Filter, StoreError, WriteOp,
    DEFAULT_MAX_BATCH_SIZE,
};
pub use entities::{EntityScan, EntityStore, StatusCounts, ENTITIES};
pub use fs::FsDocumentStore;
pub use ledger::{ImportLedger, IMPORT_BATCHES};
pub use memory::MemoryDocumentStore;
pub use postgres::PgDocumentStore;
pub use retry::{with_retry, BackoffPolicy, RetryDisposition};
#[cfg(any(test, feature = "test-util"))]
pub use testing::FaultInjectingStore;

pub const CRATE_NAME: &str = "onemap-storage";
