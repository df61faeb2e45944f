//! Core domain types for depot.
//!
//! This crate defines the vocabulary every other crate speaks:
//! - content-addressed resource keys and tree hashes,
//! - the streaming dual-convention tar tree hasher,
//! - configuration types,
//! - the core error taxonomy.

pub mod config;
pub mod error;
pub mod resource;
pub mod treehash;

pub use error::{Error, Result};
pub use resource::{ResourceKey, ResourceKind, TreeHash};
pub use treehash::{TarTreeHasher, TreeHashPair};
