//! Stream packaging and content addressing core for the Rill network.
//!
//! [`StreamAssembler`] partitions a source file into AES-CBC-encrypted,
//! content-addressed blobs, derives the stream hash and SD hash that identify
//! the stream on the network, writes the canonical stream descriptor blob,
//! and persists the manifest to a [`ManifestStore`]. The inverse paths are
//! [`StreamDescriptor::from_stream_descriptor_blob`] for ingesting a
//! descriptor blob and [`reassemble_stream`] for decrypting a stream back to
//! its source bytes.

pub mod blob;
pub mod crypto;
pub mod error;
pub mod storage;
pub mod stream;

pub use blob::{BlobInfo, MAX_BLOB_SIZE};
pub use storage::ManifestStore;
pub use stream::{StreamAssembler, StreamDescriptor, reassemble_stream};
