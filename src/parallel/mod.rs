//! Parallel execution support for ebpfc
//!
//! Compiles independent source files concurrently.

mod executor;

pub use executor::{compile_files, parallel_map, ParallelConfig};
