//! Checkpoint persistence

pub mod writer;

pub use writer::CheckpointWriter;
