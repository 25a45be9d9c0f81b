//! Stubvault - mock HTTP server with recording, replay and portable snapshots
//!
//! Stub mappings are served from an in-memory store, captured from a live
//! upstream while recording, and saved or restored as zip snapshots on a
//! local directory, a hosted git repository or an artifact repository.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::field_reassign_with_default,
    clippy::multiple_crate_versions
)]

pub mod app;
pub mod archive;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod mapping;
pub mod network;
pub mod recording;
pub mod snapshot;
pub mod storage;
pub mod store;

pub use app::App;
pub use error::{Result, StubvaultError};
