#![forbid(unsafe_code)]

//! Caching and persistence layer in front of a YouTube captions provider.
//!
//! The binary in `src/bin/backend.rs` wires these modules into an HTTP
//! service; tests drive them directly.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod security;
pub mod transcripts;
pub mod upstream;
pub mod video_id;
