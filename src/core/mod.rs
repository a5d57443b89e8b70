//! Core domain model
//!
//! Blueprint loading, symbolic reference resolution, step discrimination,
//! and pipeline assembly.

pub mod blueprint;
pub mod builder;
pub mod error;
pub mod registry;
pub mod resolver;
pub mod step;
pub mod value;
