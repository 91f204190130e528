pub mod config;
pub mod error;
pub mod hybrid;
pub mod image;
pub mod kv;
pub mod mirror;
pub mod models;
pub mod reorder;
pub mod repo;
pub mod schema;
pub mod workspace;

// Re-export commonly used items for tests / external users
pub use config::{AppConfig, CloudConfig};
pub use error::{StoreError, StoreResult};
pub use hybrid::{HybridWorkspaces, WorkspaceSession};
pub use kv::{FsKv, KvStore, MemoryKv, SharedKv};
pub use mirror::{CloudMirror, DocumentStore, HttpDocumentStore, MemoryDocumentStore, Subscription};
pub use repo::{BoardRepo, BoardStore, CardRepo, ListRepo, Removed, Repo};
