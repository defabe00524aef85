//! Core type definitions for Maestro
//!
//! This module contains the fundamental types used throughout the system:
//! - Composition: one node of the combinator AST
//! - CombinatorDescriptor / ArgSpec / ArgKind: combinator shapes
//! - CombinatorRegistry: the canonical combinator table

mod composition;
mod descriptor;

pub use composition::Composition;
pub use descriptor::{version_at_most, ArgKind, ArgSpec, CombinatorDescriptor, CombinatorRegistry};
