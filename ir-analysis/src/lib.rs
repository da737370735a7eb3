//! Storage assignment and verification analyses for Weave IR.
//!
//! The entry point is [`StorageAnalysis`], which decides where every value of
//! a program lives: it declares buffers from storage annotations and external
//! memory operations, unifies their shapes across uses, propagates storage
//! through value-routing operations to a fixpoint, and verifies that each
//! buffer's allocation point is legal. [`verify_storage`] additionally checks
//! in-place update layouts and that enough of every value is stored to cross
//! between its definition and its uses.

pub mod buffer;
pub mod defaults;
pub mod iteration_space;
pub mod loop_nest;
pub mod storage;

pub use self::{
    buffer::Buffer,
    defaults::{assign_default_loop_nests, assign_default_storage, default_loop_nest},
    iteration_space::{IterationSpace, IterationSpaceAnalysis},
    loop_nest::{LoopFusionAnalysis, LoopNest},
    storage::{
        PassThroughPolicy, StandardPassThrough, StorageAnalysis, StorageError, ValueStorage,
        verify_storage,
    },
};

/// Boxed diagnostic, as returned by every fallible analysis entry point.
pub type Report = miette::Report;
