//! Hash Index Builder
//!
//! Pulls hash-list documents from an external feed, decodes them into
//! (hash, filename, size) triples, classifies each and appends unseen hashes
//! to the hash shard store. A decoded copy of each document under the
//! marker directory records that it has been processed.

pub mod builder;
pub mod decode;
pub mod feed;

pub use builder::{BuilderPolicy, HashIndexBuilder, RunSummary};
pub use decode::TorrentTriple;
pub use feed::{DocumentDescriptor, GithubHashlistFeed, HashlistFeed};
