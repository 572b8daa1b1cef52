//! Output writers.

pub mod role;
