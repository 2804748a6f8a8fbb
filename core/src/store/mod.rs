pub mod backend;

pub use backend::{MemoryStorage, SledStorage, StorageBackend};
