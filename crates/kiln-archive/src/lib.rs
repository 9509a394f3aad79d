//! Container format for captured pipeline-state archives.
//!
//! An archive is a flat file of hashed create-info blobs grouped by
//! [`format::ResourceTag`], with a trailing TOC for random access. The
//! replayer enumerates hashes per tag in capture order and reads entries
//! individually, optionally as the stored (compressed) bytes for size
//! accounting.

#![forbid(unsafe_code)]

pub mod builder;
pub mod format;
pub mod reader;

pub use builder::ArchiveBuilder;
pub use format::{Hash, ResourceTag};
pub use reader::{ArchiveReadError, ArchiveReader, PayloadRead};
