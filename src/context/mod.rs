//! Context packet assembly for external language calls.

pub mod assembler;
pub mod budget;

pub use assembler::{Assembly, AssemblyRequest, CompressionStage, ContextAssembler, ContextPacket};
