//! Durable manifest storage.

pub mod manifest;

pub use manifest::{ManifestStore, StoreError, StreamRow};
