//! Core intermediate representation for the Weave data-parallel compiler.
//!
//! A Weave program is a flat sequence of operations, each of which produces
//! array-like values over an explicit multi-dimensional iteration domain.
//! Operations may carry a `loop_nest` attribute naming the loops their
//! iterations are materialized in, and per-result `storage` attributes
//! describing where the produced value lives.
//!
//! The [mapping] module provides the algebra of partial mappings between
//! ordered index spaces that the storage analyses are built on.

pub mod attributes;
pub mod mapping;
pub mod program;
pub mod types;

pub use compact_str::{CompactString as SmallStr, ToCompactString as ToSmallStr, format_compact};
pub use cranelift_entity::EntityRef;
pub use rustc_hash::{FxHashMap, FxHashSet};
pub use smallvec::{SmallVec, smallvec};

/// Source location attached to operations and surfaced in diagnostics.
pub type SourceSpan = miette::SourceSpan;

pub use self::{
    attributes::{Loop, LoopIter, MemorySpace, NamedMapping, StorageAttr},
    mapping::{Mapping, MappingExpr},
    program::{DomainShape, DomainShapeDim, Op, OpKind, Operation, Program, Value, ValueAccess},
    types::{ScalarType, ValueType},
};
