//! Error types for the crate, re-exported in one place.

pub use crate::blob::file::{BlobReadError, BlobWriteError};
pub use crate::blob::info::BlobInfoError;
pub use crate::crypto::cipher::CipherError;
pub use crate::storage::manifest::StoreError;
pub use crate::stream::assembler::StreamCreationError;
pub use crate::stream::descriptor::{DescriptorError, SdBlobWriteError};
pub use crate::stream::reassembler::ReassemblyError;
