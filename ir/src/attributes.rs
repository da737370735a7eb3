//! Attributes attached to operations: loop nests and storage annotations.

use core::fmt;

use smallvec::SmallVec;

use crate::{Mapping, SmallStr};

/// Where a value's storage lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemorySpace {
    Register,
    Memory,
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register => f.write_str("register"),
            Self::Memory => f.write_str("memory"),
        }
    }
}

/// How one loop of a nest iterates.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LoopIter {
    /// Iterates dimension `dim` of the operation's domain with the given
    /// step. Strip-mined dimensions appear as several loops over the same
    /// dimension with decreasing steps, coarsest first.
    Dimension { dim: usize, step: u64 },
    /// Carries no dimension of this operation; the loop is materialized for
    /// fusion with other operations.
    Rematerialize,
}

/// One level of an operation's loop-nest attribute.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Loop {
    pub name: SmallStr,
    pub iter: LoopIter,
}

impl Loop {
    /// A step-1 loop over domain dimension `dim`.
    pub fn new(name: impl Into<SmallStr>, dim: usize) -> Self {
        Self { name: name.into(), iter: LoopIter::Dimension { dim, step: 1 } }
    }

    pub fn strip_mined(name: impl Into<SmallStr>, dim: usize, step: u64) -> Self {
        Self { name: name.into(), iter: LoopIter::Dimension { dim, step } }
    }

    pub fn rematerialize(name: impl Into<SmallStr>) -> Self {
        Self { name: name.into(), iter: LoopIter::Rematerialize }
    }
}

/// A layout annotation: `mapping` sends the named loops (plus any further,
/// unnamed use dimensions) to buffer dimensions. `names[i]` names use
/// dimension `i` of the mapping.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NamedMapping {
    pub names: SmallVec<[SmallStr; 4]>,
    pub mapping: Mapping,
}

impl NamedMapping {
    /// The identity layout over the given loops.
    pub fn identity(names: impl IntoIterator<Item = SmallStr>) -> Self {
        let names: SmallVec<[SmallStr; 4]> = names.into_iter().collect();
        let mapping = Mapping::identity(names.len());
        Self { names, mapping }
    }
}

/// Per-result storage annotation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StorageAttr {
    pub space: MemorySpace,
    /// Required for `Memory`, forbidden for `Register`.
    pub buffer_name: Option<SmallStr>,
    pub layout: Option<NamedMapping>,
}

impl StorageAttr {
    pub fn register() -> Self {
        Self {
            space: MemorySpace::Register,
            buffer_name: None,
            layout: Some(NamedMapping::identity([])),
        }
    }

    pub fn memory(buffer_name: impl Into<SmallStr>, layout: NamedMapping) -> Self {
        Self {
            space: MemorySpace::Memory,
            buffer_name: Some(buffer_name.into()),
            layout: Some(layout),
        }
    }
}
