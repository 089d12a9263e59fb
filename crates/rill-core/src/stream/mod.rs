//! Stream descriptors, assembly, and reassembly.

pub mod assembler;
pub mod descriptor;
pub mod reassembler;

pub use assembler::{
    DEFAULT_CREATE_LIMIT, StreamAssembler, StreamCreationError, random_iv_generator,
};
pub use descriptor::{DescriptorError, STREAM_TYPE, SdBlobWriteError, StreamDescriptor};
pub use reassembler::{ReassemblyError, reassemble_stream};
