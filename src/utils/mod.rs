//! Small async helpers

pub mod sleep;

pub use sleep::*;
