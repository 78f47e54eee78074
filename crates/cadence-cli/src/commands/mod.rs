//! CLI command implementations.

pub mod negotiate;
pub mod simulate;
pub mod validate;
