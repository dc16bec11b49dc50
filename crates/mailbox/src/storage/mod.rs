//! Storage traits and implementations
//!
//! `MailboxStore` is the relational side (emails, threads, drafts, attachment
//! metadata, labels, signatures), backed by SQLite. `BlobStore` holds
//! attachment payloads, either on disk behind signed URLs or in memory for
//! development.

mod blob;
mod blob_file;
mod blob_memory;
pub mod filter;
mod presign;
mod sqlite;
mod traits;

pub use blob::{BlobKey, BlobStore, PresignedUrl, StoredBlob};
pub use blob_file::FileBlobStore;
pub use blob_memory::InMemoryBlobStore;
pub use filter::{EmailFilter, EmailSortField, SortOrder, ThreadFilter};
pub use presign::{SignatureError, UrlSigner};
pub use sqlite::SqliteMailboxStore;
pub use traits::{InsertOutcome, MailboxStore, MutationOutcome, PurgeOutcome};
