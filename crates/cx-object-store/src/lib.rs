//! cx-object-store - Object Storage Client
//!
//! Wraps a key/value blob backend (DigitalOcean Spaces or any S3-compatible
//! service) and adds what an eventually-consistent store does not give us:
//!
//! - md5 verification of every read against the backend's ETag
//! - bounded retries with linear backoff
//! - transparent pagination of listings
//!
//! Backends:
//! - `SpacesBackend`: aws-sdk-s3 against `https://{region}.digitaloceanspaces.com`
//! - `MemoryBackend`: in-process map, for tests and offline runs

pub mod backend;
pub mod client;
pub mod digest;
pub mod error;
pub mod memory;
pub mod retry;
pub mod spaces;

pub use backend::{ListPage, ObjectBackend, PutReceipt, PutRequest, StoredObject};
pub use client::{ObjectStoreClient, VerifiedObject};
pub use error::{ObjectStoreError, Result};
pub use memory::MemoryBackend;
pub use retry::RetryPolicy;
pub use spaces::{SpacesBackend, SpacesCredentials};
