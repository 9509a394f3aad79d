//! Data model and JSON deserializer for captured pipeline-creation state.
//!
//! Archive entry payloads are JSON documents, one create-info per entry.
//! 64-bit hashes are hex strings (JSON numbers lose precision past 2^53) and
//! SPIR-V code is base64. [`StateReplayer::parse`] decodes one entry and
//! invokes the matching [`StateCreator`] callback.

#![forbid(unsafe_code)]

pub mod model;
pub mod replayer;

pub use kiln_archive::{Hash, ResourceTag};
pub use model::*;
pub use replayer::{to_entry_json, StateCreator, StateError, StateReplayer};
