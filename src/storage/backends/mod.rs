//! Collaborator backend implementations

pub mod file;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "s3")]
pub mod s3;

pub use file::FileObjectStore;
pub use memory::{FailureInjector, MemoryObjectStore, MemoryQueue, MemoryStore};
#[cfg(feature = "redis")]
pub use redis::{RedisQueue, RedisStore};
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;
