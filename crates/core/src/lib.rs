//! Shared leaf crate for the stave render dispatcher.
//!
//! Holds the types every other crate agrees on: socket/request
//! identifiers, the engraver backend and release-channel enums, the
//! JSON-RPC 2.0 frame builders with their wire error codes, and the
//! source preprocessing applied before a score is handed to a renderer
//! child. This crate has no internal dependencies.

pub mod protocol;
pub mod source;
pub mod types;
