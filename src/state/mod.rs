// State management module
// SQLite index, file layout and the versioned model registry

pub mod db;
pub mod models;
pub mod queries;
pub mod registry;
pub mod storage;
pub mod store;

pub use db::{DbConnection, DbError, DbResult};
pub use models::{
    ActiveModelRecord, ArtifactRecord, Sample, SampleMetadata, SampleRecord, POSITIVE_LABEL,
};
pub use registry::{LoadFailure, ModelRegistry, RegistryError, RegistryResult};
pub use storage::{default_data_dir, StorageError, StorageResult};
pub use store::{Store, StoreError, StoreResult};
