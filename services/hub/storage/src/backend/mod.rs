//! Graph store backends

pub mod file;
pub mod mem;
