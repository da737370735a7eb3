//! Storage assignment: which buffer each value lives in and with what layout.
//!
//! [`StorageAnalysis::create`] runs four phases:
//!
//! 1. buffer declaration: external memory operations and storage annotations
//!    declare buffers, whose shapes are unified across occurrences;
//! 2. value-storage propagation: annotations seed per-value storage records
//!    which a worklist propagates through value-routing operations until
//!    fixpoint;
//! 3. loop-nest legality and minimization: each buffer's loop nest is checked
//!    against its layout dependencies and allocation point, then shrunk to the
//!    shortest legal prefix;
//! 4. external ordering: writes to an imported buffer must follow the import's
//!    memref definition.
//!
//! [`verify_storage`] runs the analysis and additionally checks in-place
//! update layouts and communication volumes.

use std::collections::hash_map::Entry;

use bitvec::prelude::*;
use log::{debug, trace};
use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use weavec_ir::{
    Mapping, MappingExpr, MemorySpace, Op, OpKind, Operation, Program, SmallStr, SourceSpan,
    StorageAttr, Value, ValueAccess, format_compact, mapping::unification_constraints,
};

use crate::{
    Report,
    buffer::Buffer,
    iteration_space::{IterationSpace, IterationSpaceAnalysis},
    loop_nest::LoopFusionAnalysis,
};

const LOG_TARGET: &str = "storage";

#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum StorageError {
    #[error("wrong number of storage entries")]
    WrongArity {
        #[label("for this operation")]
        span: SourceSpan,
    },
    #[error("index and memref variables cannot be allocated in memory")]
    MemoryIneligibleType {
        #[label("this result")]
        span: SourceSpan,
    },
    #[error("buffers must have a name if and only if they are stored in memory")]
    NameSpaceMismatch {
        #[label("in this storage annotation")]
        span: SourceSpan,
    },
    #[error("operation cannot store two results in the same buffer")]
    DuplicateBufferUse {
        name: SmallStr,
        #[label("buffer \"{name}\" used twice here")]
        span: SourceSpan,
    },
    #[error("layouts cannot contain `?` expressions")]
    UnknownInLayout {
        #[label("in this storage annotation")]
        span: SourceSpan,
    },
    #[error("only 0D buffers can be stored in registers")]
    RegisterNotZeroRank {
        #[label("in this storage annotation")]
        span: SourceSpan,
    },
    #[error("unknown loop name \"{name}\"")]
    UnknownLoopName {
        name: SmallStr,
        #[label("referenced here")]
        span: SourceSpan,
    },
    #[error("buffer \"{name}\" has a different element type than in a previous occurrence")]
    ElementTypeConflict {
        name: SmallStr,
        #[label("conflicting occurrence")]
        span: SourceSpan,
        #[label("previous occurrence here")]
        previous: SourceSpan,
    },
    #[error("buffer \"{name}\" rank differs from a previous occurrence")]
    RankConflict {
        name: SmallStr,
        #[label("conflicting occurrence")]
        span: SourceSpan,
        #[label("previous occurrence here")]
        previous: SourceSpan,
    },
    #[error("buffer \"{name}\" layout is incompatible with previous occurrences")]
    IncompatibleLayout {
        name: SmallStr,
        #[label("conflicting occurrence")]
        span: SourceSpan,
        #[label("previous occurrence here")]
        previous: SourceSpan,
    },
    #[error("buffer \"{name}\" maps a dimension to conflicting iteration dimensions")]
    DimensionMismatch {
        name: SmallStr,
        #[label("conflicting occurrence")]
        span: SourceSpan,
        #[label("previous occurrence here")]
        previous: SourceSpan,
    },
    #[error("conflicting memory spaces: expected {expected}, got {got}")]
    SpaceConflict {
        expected: MemorySpace,
        got: MemorySpace,
        #[label("for the value defined here")]
        span: SourceSpan,
    },
    #[error("conflicting buffer names: expected \"{expected}\", got \"{got}\"")]
    BufferNameConflict {
        expected: SmallStr,
        got: SmallStr,
        #[label("for the value defined here")]
        span: SourceSpan,
    },
    #[error("conflicting layouts: expected {expected}, got {got}")]
    LayoutConflict {
        expected: String,
        got: String,
        #[label("for the value defined here")]
        span: SourceSpan,
    },
    #[error("buffer name \"{name}\" is already used")]
    BufferNameReused {
        name: SmallStr,
        #[label("reused here")]
        span: SourceSpan,
        #[label("previous use here")]
        previous: SourceSpan,
    },
    #[error("buffer \"{name}\" layout is not fully specified")]
    LayoutNotFullySpecified {
        name: SmallStr,
        #[label("buffer declared here")]
        span: SourceSpan,
    },
    #[error("buffer \"{name}\" used before it is defined")]
    UsedBeforeDefined {
        name: SmallStr,
        #[label("buffer written here")]
        span: SourceSpan,
        #[label("buffer defined here")]
        defined: SourceSpan,
    },
    #[error("buffer \"{name}\" is used before one of its dimensions is defined")]
    UseBeforeDimensionDef {
        name: SmallStr,
        #[label("first write to the buffer")]
        span: SourceSpan,
        #[label("dimension defined here")]
        dimension: SourceSpan,
    },
    #[error(
        "buffer \"{name}\" depends on a dimension that is defined after the buffer is allocated"
    )]
    LoopNestTooShort {
        name: SmallStr,
        #[label("first write to the buffer")]
        span: SourceSpan,
        #[label("dimension defined here")]
        dimension: SourceSpan,
    },
    #[error("buffer \"{name}\" layout depends on loops it cannot be nested in")]
    UnresolvableLayoutDependency {
        name: SmallStr,
        #[label("buffer declared here")]
        span: SourceSpan,
    },
    #[error(
        "operand storage must cover all operand dimensions that are not covered by loops \
         common to both operand and user"
    )]
    IncompleteCrossIterationStorage {
        #[label("operand used here")]
        span: SourceSpan,
        #[label("operand defined here")]
        defined: SourceSpan,
    },
    #[error("in-place update of buffer \"{name}\" must use the same layout in input and output ({got} vs {expected})")]
    InPlaceLayoutConflict {
        name: SmallStr,
        expected: String,
        got: String,
        #[label("in this operation")]
        span: SourceSpan,
    },
    #[error("unknown buffer \"{name}\"")]
    UnknownBuffer {
        name: SmallStr,
        #[label("referenced here")]
        span: SourceSpan,
    },
}

/// Where a value is materialized. All fields start unset and are filled in by
/// merging annotation-derived facts; a merge never overwrites a known fact
/// with a different one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ValueStorage {
    space: Option<MemorySpace>,
    buffer_name: Option<SmallStr>,
    /// From the loops of the value's iteration space to buffer dimensions.
    layout: Option<Mapping>,
}

impl ValueStorage {
    pub fn new(
        space: Option<MemorySpace>,
        buffer_name: Option<SmallStr>,
        layout: Option<Mapping>,
    ) -> Self {
        Self { space, buffer_name, layout }
    }

    pub fn space(&self) -> Option<MemorySpace> {
        self.space
    }

    pub fn buffer_name(&self) -> Option<&SmallStr> {
        self.buffer_name.as_ref()
    }

    pub fn layout(&self) -> Option<&Mapping> {
        self.layout.as_ref()
    }

    pub fn merge_space(&mut self, new: Option<MemorySpace>) -> Result<(), ()> {
        let Some(new) = new else { return Ok(()) };
        match self.space {
            None => {
                self.space = Some(new);
                Ok(())
            }
            Some(old) if old == new => Ok(()),
            Some(_) => Err(()),
        }
    }

    pub fn merge_buffer_name(&mut self, new: Option<&SmallStr>) -> Result<(), ()> {
        let Some(new) = new else { return Ok(()) };
        match &self.buffer_name {
            None => {
                self.buffer_name = Some(new.clone());
                Ok(())
            }
            Some(old) if old == new => Ok(()),
            Some(_) => Err(()),
        }
    }

    /// Merges layouts by resolving `?` placeholders; anything else must match
    /// structurally.
    pub fn merge_layout(&mut self, new: Option<&Mapping>) -> Result<(), ()> {
        let Some(new) = new else { return Ok(()) };
        match &self.layout {
            None => {
                self.layout = Some(new.clone());
                Ok(())
            }
            Some(old) => {
                self.layout = Some(new.unify_unknown(old).ok_or(())?);
                Ok(())
            }
        }
    }

    /// Prepends `n` buffer dimensions with unknown layout expressions.
    pub(crate) fn add_unknown_prefix_to_layout(&mut self, n: usize) {
        if let Some(layout) = self.layout.take() {
            self.layout = Some(layout.add_prefix(core::iter::repeat_n(MappingExpr::Unknown, n)));
        }
    }

    /// Expresses this storage in the iteration space of `to`, given `mapping`
    /// from `to`'s domain to `from`'s domain. `from` is the operation whose
    /// space the layout is currently expressed in.
    pub fn map(
        &self,
        program: &Program,
        spaces: &IterationSpaceAnalysis,
        from: Op,
        to: Op,
        mapping: &Mapping,
    ) -> ValueStorage {
        let layout = self.layout.as_ref().map(|layout| {
            // Values may have a smaller rank than the operation defining them.
            let domain_mapping = mapping
                .clone()
                .resize(program.op(from).domain.len())
                .resize_use_domain(program.op(to).domain.len());
            spaces
                .translate_mapping(program, to, from, &domain_mapping)
                .compose(layout)
                .canonicalize()
        });
        ValueStorage { space: self.space, buffer_name: self.buffer_name.clone(), layout }
    }
}

impl core::fmt::Display for ValueStorage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.space {
            Some(space) => write!(f, "{space}")?,
            None => f.write_str("unassigned")?,
        }
        if let Some(name) = &self.buffer_name {
            write!(f, " \"{name}\"")?;
        }
        if let Some(layout) = &self.layout {
            write!(f, " layout {layout}")?;
        }
        Ok(())
    }
}

/// Which operations pass storage through from operands to results.
pub trait PassThroughPolicy {
    /// The result that shares storage with operand `operand`, if any.
    fn forward_result(&self, op: &Operation, operand: usize) -> Option<usize>;
    /// The operands that share storage with result `result`.
    fn backward_operands(&self, op: &Operation, result: usize) -> SmallVec<[usize; 2]>;
}

/// Projections and `fby` route all operands to their single result;
/// map-reduce links init operand `i` with result `i`.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardPassThrough;

impl PassThroughPolicy for StandardPassThrough {
    fn forward_result(&self, op: &Operation, operand: usize) -> Option<usize> {
        match op.kind {
            OpKind::ProjAny | OpKind::ProjLast | OpKind::Fby => Some(0),
            OpKind::MapReduce { num_inits } if operand < num_inits => Some(operand),
            _ => None,
        }
    }

    fn backward_operands(&self, op: &Operation, result: usize) -> SmallVec<[usize; 2]> {
        match op.kind {
            OpKind::ProjAny | OpKind::ProjLast | OpKind::Fby => {
                (0..op.operands.len()).collect()
            }
            OpKind::MapReduce { num_inits } if result < num_inits => {
                SmallVec::from_slice(&[result])
            }
            _ => SmallVec::new(),
        }
    }
}

/// The result of storage assignment over a whole program.
#[derive(Debug)]
pub struct StorageAnalysis {
    next_buffer_id: usize,
    buffers: FxHashMap<SmallStr, Buffer>,
    value_storages: FxHashMap<Value, ValueStorage>,
}

impl StorageAnalysis {
    pub fn create(
        program: &Program,
        fusion: &LoopFusionAnalysis,
        spaces: &IterationSpaceAnalysis,
        policy: &dyn PassThroughPolicy,
    ) -> Result<Self, Report> {
        verify_storage_attrs(program)?;
        let mut analysis = Self {
            next_buffer_id: 0,
            buffers: FxHashMap::default(),
            value_storages: FxHashMap::default(),
        };
        analysis.declare_buffers(program, fusion, spaces)?;
        analysis.compute_value_storages(program, fusion, spaces, policy)?;
        analysis.verify_and_minimize_buffer_loop_nests(program, fusion, spaces)?;
        analysis.verify_external_write_order(program)?;
        Ok(analysis)
    }

    pub fn buffer(&self, name: &SmallStr) -> Option<&Buffer> {
        self.buffers.get(name)
    }

    pub fn buffers(&self) -> impl Iterator<Item = (&SmallStr, &Buffer)> {
        self.buffers.iter()
    }

    /// Storage of a value of the analyzed program. Every value has an entry.
    pub fn storage(&self, value: Value) -> &ValueStorage {
        &self.value_storages[&value]
    }

    /// A buffer name not yet declared in the program.
    pub fn fresh_buffer_name(&mut self) -> SmallStr {
        loop {
            let name: SmallStr = format_compact!("buffer_{}", self.next_buffer_id);
            self.next_buffer_id += 1;
            if !self.buffers.contains_key(&name) {
                return name;
            }
        }
    }

    /// Declares a fresh buffer nested in `loop_names` and assigns `value` to
    /// it. The buffer's rank stays undetermined until a layout is merged in.
    /// Returns the buffer name.
    pub fn create_buffer(
        &mut self,
        program: &Program,
        fusion: &LoopFusionAnalysis,
        spaces: &IterationSpaceAnalysis,
        policy: &dyn PassThroughPolicy,
        value: Value,
        loop_names: &[SmallStr],
    ) -> Result<SmallStr, Report> {
        let name = self.fresh_buffer_name();
        let def = program.value(value);
        let span = program.op(def.producer).span;
        let nest = fusion.get_loop_nest(loop_names, program);
        self.buffers.insert(
            name.clone(),
            Buffer::new(name.clone(), span, def.ty.element_type.clone(), loop_names, &nest),
        );
        debug!(target: LOG_TARGET, "created buffer {name} for {value:?}");

        let mut storage = self.value_storages.get(&value).cloned().unwrap_or_default();
        if storage.merge_buffer_name(Some(&name)).is_err() {
            let got = storage.buffer_name.clone().unwrap_or_default();
            return Err(StorageError::BufferNameConflict { expected: name, got, span }.into());
        }
        if storage.merge_space(Some(MemorySpace::Memory)).is_err() {
            return Err(StorageError::SpaceConflict {
                expected: MemorySpace::Memory,
                got: MemorySpace::Register,
                span,
            }
            .into());
        }
        self.merge_storage(program, fusion, spaces, policy, value, storage)?;
        Ok(name)
    }

    /// Merges additional storage facts into `value` and propagates. If the
    /// facts name a buffer with a layout, the buffer's rank is checked (or
    /// initialized to 0 for rank-less buffers).
    pub fn merge_storage(
        &mut self,
        program: &Program,
        fusion: &LoopFusionAnalysis,
        spaces: &IterationSpaceAnalysis,
        policy: &dyn PassThroughPolicy,
        value: Value,
        new_storage: ValueStorage,
    ) -> Result<(), Report> {
        let span = program.op(program.producer(value)).span;
        if let (Some(name), Some(layout)) = (new_storage.buffer_name(), new_storage.layout()) {
            let Some(buffer) = self.buffers.get_mut(name) else {
                return Err(StorageError::UnknownBuffer { name: name.clone(), span }.into());
            };
            match buffer.rank() {
                Some(rank) if rank == layout.len() => {}
                Some(_) => {
                    return Err(StorageError::RankConflict {
                        name: name.clone(),
                        span,
                        previous: buffer.span(),
                    }
                    .into());
                }
                None => {
                    if !layout.is_empty() {
                        return Err(StorageError::RankConflict {
                            name: name.clone(),
                            span,
                            previous: buffer.span(),
                        }
                        .into());
                    }
                    let empty = Mapping::empty(buffer.domain().len());
                    if buffer.unify_layout(empty).is_err() {
                        return Err(StorageError::IncompatibleLayout {
                            name: name.clone(),
                            span,
                            previous: buffer.span(),
                        }
                        .into());
                    }
                }
            }
        }
        self.set_storage(program, fusion, spaces, policy, value, new_storage)
    }

    /// Extends `buffer_name` to the rank of `new_layout` (a mapping from the
    /// loops of `op`'s iteration space to the extended buffer dimensions),
    /// prepending the new dimensions. Existing values get unknown layout
    /// prefixes for the new dimensions.
    pub fn add_dimensions_to_buffer(
        &mut self,
        program: &Program,
        fusion: &LoopFusionAnalysis,
        spaces: &IterationSpaceAnalysis,
        buffer_name: &SmallStr,
        op: Op,
        new_layout: &Mapping,
    ) -> Result<(), Report> {
        let op_space = spaces.get(op);
        let Some(buffer) = self.buffers.get_mut(buffer_name) else {
            return Err(StorageError::UnknownBuffer {
                name: buffer_name.clone(),
                span: program.op(op).span,
            }
            .into());
        };
        debug_assert!(buffer.layout().is_some());
        debug_assert!(new_layout.len() >= buffer.rank().unwrap_or(0));
        debug_assert!(!buffer.is_external());

        trim_buffer_loop_nest_for_access(op_space, Some(new_layout), fusion, program, buffer);
        let old_rank = buffer.rank().unwrap_or(0);
        let num_new = new_layout.len() - old_rank;
        buffer.add_none_prefix_to_layout(num_new);
        unify_buffer_shape(program, fusion, buffer_name, op, new_layout, op_space, buffer)?;

        let values: SmallVec<[Value; 2]> = buffer.values().iter().copied().collect();
        for value in values {
            if let Some(storage) = self.value_storages.get_mut(&value) {
                storage.add_unknown_prefix_to_layout(num_new);
            }
        }
        Ok(())
    }

    fn declare_buffers(
        &mut self,
        program: &Program,
        fusion: &LoopFusionAnalysis,
        spaces: &IterationSpaceAnalysis,
    ) -> Result<(), Report> {
        // External buffers first: their shape comes from the memref domain.
        for (id, op) in program.ops() {
            let (name, parallel) = match &op.kind {
                OpKind::FromMemory { buffer_name, parallel_domain }
                | OpKind::ToMemory { buffer_name, parallel_domain } => {
                    (buffer_name, *parallel_domain)
                }
                _ => continue,
            };
            if let Some(previous) = self.buffers.get(name) {
                return Err(StorageError::BufferNameReused {
                    name: name.clone(),
                    span: op.span,
                    previous: previous.span(),
                }
                .into());
            }
            let space = spaces.get(id);
            let nest = fusion.get_loop_nest(space.loop_names(), program);
            let element_type = match &op.kind {
                OpKind::FromMemory { .. } => {
                    program.value(op.results[0]).ty.element_type.clone()
                }
                _ => program.value(op.operands[1].value).ty.element_type.clone(),
            };
            let mut buffer = Buffer::new_external(
                name.clone(),
                id,
                op.span,
                element_type,
                space.loop_names(),
                &nest,
            );
            let layout = external_layout(op, space, parallel);
            unify_buffer_shape(program, fusion, name, id, &layout, space, &mut buffer)?;
            debug!(
                target: LOG_TARGET,
                "declared external buffer {name} with rank {}", layout.len()
            );
            self.buffers.insert(name.clone(), buffer);
        }

        // Internal buffers from storage annotations.
        for (id, op) in program.ops() {
            if !op.kind.is_compute() {
                continue;
            }
            for result in 0..op.results.len() {
                if let Some(attr) = op.storage(result) {
                    self.declare_buffer(program, fusion, spaces, id, result, attr)?;
                }
            }
        }

        for (name, buffer) in &self.buffers {
            if let Some(layout) = buffer.layout() {
                if layout.has_none() {
                    return Err(StorageError::LayoutNotFullySpecified {
                        name: name.clone(),
                        span: buffer.span(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    fn declare_buffer(
        &mut self,
        program: &Program,
        fusion: &LoopFusionAnalysis,
        spaces: &IterationSpaceAnalysis,
        op_id: Op,
        result: usize,
        attr: &StorageAttr,
    ) -> Result<(), Report> {
        let Some(name) = attr.buffer_name.as_ref() else { return Ok(()) };
        let op = program.op(op_id);
        let element_type = program.value(op.results[result]).ty.element_type.clone();
        let space = spaces.get(op_id);

        let buffer = match self.buffers.entry(name.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let nest = fusion.get_loop_nest(space.loop_names(), program);
                debug!(target: LOG_TARGET, "declared buffer {name}");
                entry.insert(Buffer::new(
                    name.clone(),
                    op.span,
                    element_type.clone(),
                    space.loop_names(),
                    &nest,
                ))
            }
        };

        if *buffer.element_type() != element_type {
            return Err(StorageError::ElementTypeConflict {
                name: name.clone(),
                span: op.span,
                previous: buffer.span(),
            }
            .into());
        }

        let layout = get_buffer_layout(op, attr, space)?;
        if let (Some(rank), Some(layout)) = (buffer.rank(), layout.as_ref()) {
            if rank != layout.len() {
                return Err(StorageError::RankConflict {
                    name: name.clone(),
                    span: op.span,
                    previous: buffer.span(),
                }
                .into());
            }
        }

        trim_buffer_loop_nest_for_access(space, layout.as_ref(), fusion, program, buffer);
        if let Some(layout) = &layout {
            unify_buffer_shape(program, fusion, name, op_id, layout, space, buffer)?;
        }
        Ok(())
    }

    fn compute_value_storages(
        &mut self,
        program: &Program,
        fusion: &LoopFusionAnalysis,
        spaces: &IterationSpaceAnalysis,
        policy: &dyn PassThroughPolicy,
    ) -> Result<(), Report> {
        for (id, op) in program.ops() {
            match &op.kind {
                OpKind::Compute | OpKind::MapReduce { .. } => {
                    for result in 0..op.results.len() {
                        let Some(attr) = op.storage(result) else { continue };
                        let layout = get_buffer_layout(op, attr, spaces.get(id))?;
                        let storage = ValueStorage::new(
                            Some(attr.space),
                            attr.buffer_name.clone(),
                            layout,
                        );
                        self.set_storage(
                            program,
                            fusion,
                            spaces,
                            policy,
                            op.results[result],
                            storage,
                        )?;
                    }
                }
                OpKind::FromScalar => {
                    let storage = ValueStorage::new(
                        Some(MemorySpace::Register),
                        None,
                        Some(Mapping::empty(spaces.get(id).num_loops())),
                    );
                    self.set_storage(program, fusion, spaces, policy, op.results[0], storage)?;
                }
                OpKind::FromMemory { buffer_name, parallel_domain } => {
                    let layout = external_layout(op, spaces.get(id), *parallel_domain);
                    let storage = ValueStorage::new(
                        Some(MemorySpace::Memory),
                        Some(buffer_name.clone()),
                        Some(layout),
                    );
                    self.set_storage(program, fusion, spaces, policy, op.results[0], storage)?;
                }
                OpKind::ToMemory { buffer_name, parallel_domain } => {
                    let layout = external_layout(op, spaces.get(id), *parallel_domain);
                    let storage = ValueStorage::new(
                        Some(MemorySpace::Memory),
                        Some(buffer_name.clone()),
                        Some(layout),
                    );
                    let operand = &op.operands[1];
                    let producer = program.producer(operand.value);
                    let mapped =
                        storage.map(program, spaces, id, producer, &operand.mapping.inverse());
                    self.set_storage(program, fusion, spaces, policy, operand.value, mapped)?;
                }
                _ => {}
            }
        }
        for (value, _) in program.values() {
            self.value_storages.entry(value).or_default();
        }
        Ok(())
    }

    /// Records storage facts for `value` and propagates them through
    /// pass-through operations, forward to results and backward to operands,
    /// until nothing changes.
    fn set_storage(
        &mut self,
        program: &Program,
        fusion: &LoopFusionAnalysis,
        spaces: &IterationSpaceAnalysis,
        policy: &dyn PassThroughPolicy,
        value: Value,
        storage: ValueStorage,
    ) -> Result<(), Report> {
        let mut work_list: Vec<Value> = Vec::new();
        self.update_storage(program, fusion, spaces, value, storage, &mut work_list)?;

        while let Some(value) = work_list.pop() {
            let storage = self.value_storages[&value].clone();
            let producer = program.producer(value);

            // Forward propagation.
            for &(user, pos) in program.users(value) {
                let user_op = program.op(user);
                let Some(result) = policy.forward_result(user_op, pos) else { continue };
                let operand = &user_op.operands[pos];
                let new_storage = storage.map(program, spaces, producer, user, &operand.mapping);
                self.update_storage(
                    program,
                    fusion,
                    spaces,
                    user_op.results[result],
                    new_storage,
                    &mut work_list,
                )?;
            }

            // Backward propagation.
            let def_op = program.op(producer);
            let result_index = program.value(value).index;
            for pos in policy.backward_operands(def_op, result_index) {
                let operand = &def_op.operands[pos];
                let new_storage = storage.map(
                    program,
                    spaces,
                    producer,
                    program.producer(operand.value),
                    &operand.mapping.inverse(),
                );
                self.update_storage(
                    program,
                    fusion,
                    spaces,
                    operand.value,
                    new_storage,
                    &mut work_list,
                )?;
            }
        }
        Ok(())
    }

    fn update_storage(
        &mut self,
        program: &Program,
        fusion: &LoopFusionAnalysis,
        spaces: &IterationSpaceAnalysis,
        value: Value,
        new_storage: ValueStorage,
        work_list: &mut Vec<Value>,
    ) -> Result<(), Report> {
        let current = self.value_storages.entry(value).or_default().clone();
        if current == new_storage {
            return Ok(());
        }
        work_list.push(value);
        trace!(target: LOG_TARGET, "updating storage of {value:?}: {new_storage:?}");

        // First time the value is assigned to a buffer: register the use and
        // make sure the buffer can be addressed from everywhere the value is
        // live.
        if current.buffer_name.is_none() {
            if let Some(name) = new_storage.buffer_name() {
                let producer = program.producer(value);
                let Some(buffer) = self.buffers.get_mut(name) else {
                    return Err(StorageError::UnknownBuffer {
                        name: name.clone(),
                        span: program.op(producer).span,
                    }
                    .into());
                };
                buffer.add_value(program, value);
                trim_buffer_loop_nest_for_access(
                    spaces.get(producer),
                    None,
                    fusion,
                    program,
                    buffer,
                );
                for &(user, _) in program.users(value) {
                    trim_buffer_loop_nest_for_access(
                        spaces.get(user),
                        None,
                        fusion,
                        program,
                        buffer,
                    );
                }
            }
        }

        let span = program.op(program.producer(value)).span;
        let mut merged = current;
        if merged.merge_space(new_storage.space()).is_err() {
            return Err(StorageError::SpaceConflict {
                expected: new_storage.space.unwrap_or(MemorySpace::Register),
                got: merged.space.unwrap_or(MemorySpace::Register),
                span,
            }
            .into());
        }
        if merged.merge_buffer_name(new_storage.buffer_name()).is_err() {
            return Err(StorageError::BufferNameConflict {
                expected: new_storage.buffer_name.clone().unwrap_or_default(),
                got: merged.buffer_name.clone().unwrap_or_default(),
                span,
            }
            .into());
        }
        if merged.merge_layout(new_storage.layout()).is_err() {
            return Err(StorageError::LayoutConflict {
                expected: new_storage.layout.map(|l| l.to_string()).unwrap_or_default(),
                got: merged.layout.map(|l| l.to_string()).unwrap_or_default(),
                span,
            }
            .into());
        }
        self.value_storages.insert(value, merged);
        Ok(())
    }

    fn verify_and_minimize_buffer_loop_nests(
        &mut self,
        program: &Program,
        fusion: &LoopFusionAnalysis,
        spaces: &IterationSpaceAnalysis,
    ) -> Result<(), Report> {
        let names: Vec<SmallStr> = self.buffers.keys().cloned().collect();
        for name in names {
            let buffer = &self.buffers[&name];
            let Some(layout) = buffer.layout() else { continue };

            let mut min_num_loops = 0;

            // Loops the layout-indexed dimensions are derived from.
            let used = layout.dependency_mask();
            for dim in used.iter_ones() {
                let mapping = &buffer.domain()[dim].mapping;
                if mapping.has_none() {
                    return Err(StorageError::UnresolvableLayoutDependency {
                        name: name.clone(),
                        span: buffer.span(),
                    }
                    .into());
                }
                min_num_loops = min_num_loops.max(mapping.min_domain_size());
            }

            // Inner stripe levels must stay nested in their outer levels.
            let nest = fusion.get_loop_nest(buffer.loop_nest(), program);
            let prefix = StripePrefix {
                exprs: nest.domain_to_loops.exprs(),
                domain: &nest.domain,
            };
            for expr in layout.exprs() {
                let Ok(new_min) = stripe_level_min_loops(expr, buffer.domain(), &prefix) else {
                    return Err(StorageError::UnresolvableLayoutDependency {
                        name: name.clone(),
                        span: buffer.span(),
                    }
                    .into());
                };
                min_num_loops = min_num_loops.max(new_min);
            }

            if buffer.is_external() {
                continue;
            }

            check_alloc_insertion_point(
                program,
                spaces,
                &name,
                buffer,
                &used,
                &mut min_num_loops,
            )?;

            let keep: SmallVec<[SmallStr; 4]> =
                buffer.loop_nest()[..min_num_loops].iter().cloned().collect();
            if keep.len() < buffer.loop_nest().len() {
                debug!(
                    target: LOG_TARGET,
                    "trimming loop nest of buffer {name} to {} loops", keep.len()
                );
            }
            let new_nest = fusion.get_loop_nest(&keep, program);
            if let Some(buffer) = self.buffers.get_mut(&name) {
                buffer.set_loop_nest(&new_nest);
            }
        }
        Ok(())
    }

    /// Writes to an external buffer must come after the memref it wraps is
    /// defined. Reads always follow writes, so checking writes is enough.
    fn verify_external_write_order(&self, program: &Program) -> Result<(), Report> {
        for (name, buffer) in &self.buffers {
            let Some(import_op) = buffer.import_op() else { continue };
            let Some(memref) = program.op(import_op).operands.first() else { continue };
            let defined = program.producer(memref.value);
            for &(write, _) in buffer.writes() {
                if write < defined {
                    return Err(StorageError::UsedBeforeDefined {
                        name: name.clone(),
                        span: program.op(write).span,
                        defined: program.op(defined).span,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }
}

/// Checks storage annotations in isolation, before any cross-operation
/// reasoning.
fn verify_storage_attrs(program: &Program) -> Result<(), Report> {
    for (_, op) in program.ops() {
        if !op.kind.is_compute() {
            continue;
        }
        if op.storage.len() != op.results.len() {
            return Err(StorageError::WrongArity { span: op.span }.into());
        }
        let loop_names: FxHashSet<&SmallStr> = op
            .loop_nest
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(|l| &l.name)
            .collect();
        let mut buffer_names: FxHashSet<&SmallStr> = FxHashSet::default();
        for (attr, &result) in op.storage.iter().zip(&op.results) {
            let Some(attr) = attr else { continue };
            let ty = &program.value(result).ty;
            if attr.space == MemorySpace::Memory && !ty.element_type.is_memory_eligible() {
                return Err(StorageError::MemoryIneligibleType { span: op.span }.into());
            }
            if (attr.space == MemorySpace::Memory) != attr.buffer_name.is_some() {
                return Err(StorageError::NameSpaceMismatch { span: op.span }.into());
            }
            if let Some(name) = &attr.buffer_name {
                if !buffer_names.insert(name) {
                    return Err(StorageError::DuplicateBufferUse {
                        name: name.clone(),
                        span: op.span,
                    }
                    .into());
                }
            }
            let Some(layout) = &attr.layout else { continue };
            if layout.mapping.has_unknown() {
                return Err(StorageError::UnknownInLayout { span: op.span }.into());
            }
            if attr.space == MemorySpace::Register && !layout.mapping.is_empty() {
                return Err(StorageError::RegisterNotZeroRank { span: op.span }.into());
            }
            for loop_name in &layout.names {
                if !loop_names.contains(loop_name) {
                    return Err(StorageError::UnknownLoopName {
                        name: loop_name.clone(),
                        span: op.span,
                    }
                    .into());
                }
            }
        }
    }
    Ok(())
}

/// Turns a layout annotation into a mapping from the loops of `space` to
/// buffer dimensions, resolving loop names to positions.
fn get_buffer_layout(
    op: &Operation,
    attr: &StorageAttr,
    space: &IterationSpace,
) -> Result<Option<Mapping>, Report> {
    let Some(named) = &attr.layout else { return Ok(None) };
    let mut exprs = vec![MappingExpr::None; named.mapping.use_domain_size()];
    for (i, loop_name) in named.names.iter().enumerate() {
        let Some(pos) = space.loop_names().iter().position(|n| n == loop_name) else {
            return Err(StorageError::UnknownLoopName {
                name: loop_name.clone(),
                span: op.span,
            }
            .into());
        };
        exprs[i] = MappingExpr::Dim(pos);
    }
    let loops_to_indexed = Mapping::new(space.num_loops(), exprs);
    Ok(Some(loops_to_indexed.compose(&named.mapping)))
}

/// Layout of an external memory operation: from the loops of its iteration
/// space to the memref dimensions, which follow the parallel domain.
fn external_layout(op: &Operation, space: &IterationSpace, parallel_domain: usize) -> Mapping {
    let rank = op.domain.len() - parallel_domain;
    space
        .mapping()
        .inverse()
        .compose(&Mapping::identity(rank).shift_right(parallel_domain))
}

/// Trims `buffer`'s loop nest so the buffer can be accessed from
/// `iter_space`: only common loops remain, and none that `layout` (from the
/// loops of `iter_space` to buffer dimensions, if given) indexes.
fn trim_buffer_loop_nest_for_access(
    iter_space: &IterationSpace,
    layout: Option<&Mapping>,
    fusion: &LoopFusionAnalysis,
    program: &Program,
    buffer: &mut Buffer,
) {
    let mut max_loop_nest = iter_space.num_common_loops(buffer.loop_nest());
    if let Some(layout) = layout {
        if let Some(first_indexed) = layout.dependency_mask().first_one() {
            max_loop_nest = max_loop_nest.min(first_indexed);
        }
    }
    if max_loop_nest == buffer.loop_nest().len() {
        return;
    }
    let keep: SmallVec<[SmallStr; 4]> =
        iter_space.loop_names()[..max_loop_nest].iter().cloned().collect();
    let new_nest = fusion.get_loop_nest(&keep, program);
    buffer.set_loop_nest(&new_nest);
}

/// Unifies `buffer`'s shape with the occurrence at `op`, whose layout (from
/// the loops of `op_space` to buffer dimensions) is `layout`. Appends
/// newly-indexed dimensions to the buffer domain and merges the layouts.
fn unify_buffer_shape(
    program: &Program,
    fusion: &LoopFusionAnalysis,
    name: &SmallStr,
    op_id: Op,
    layout: &Mapping,
    op_space: &IterationSpace,
    buffer: &mut Buffer,
) -> Result<(), Report> {
    let op = program.op(op_id);
    let op_loop_nest = fusion.get_loop_nest(op_space.loop_names(), program);
    let buffer_loop_nest = fusion.get_loop_nest(buffer.loop_nest(), program);

    // Express the loops over the concatenation of the loop-nest domain and
    // the op domain: through the loop-nest domain where possible, through the
    // op domain otherwise.
    let shift = op_loop_nest.domain.len();
    let concat_domain_size = shift + op.domain.len();
    let mut concat_exprs: Vec<MappingExpr> = op_loop_nest.domain_to_loops.exprs().to_vec();
    let op_dims = op_space.mapping().shift_right(shift);
    concat_exprs.extend(
        op_dims.exprs().iter().skip(op_loop_nest.domain_to_loops.len()).cloned(),
    );
    let concat_domains = Mapping::new(concat_domain_size, concat_exprs);
    let concat_to_layout = concat_domains.compose(layout).canonicalize();

    // Dimensions covered by the buffer loop nest must match exactly across
    // occurrences; everything else is constrained by the old layout.
    let mut constraints = vec![MappingExpr::None; concat_domain_size];
    for (i, constraint) in constraints.iter_mut().enumerate().take(buffer_loop_nest.domain.len())
    {
        *constraint = MappingExpr::Dim(i);
    }
    if let Some(old_layout) = buffer.layout() {
        for (old, new) in old_layout.exprs().iter().zip(concat_to_layout.exprs()) {
            if unification_constraints(new, old, &mut constraints).is_err() {
                return Err(StorageError::IncompatibleLayout {
                    name: name.clone(),
                    span: op.span,
                    previous: buffer.span(),
                }
                .into());
            }
        }
    }

    // Resolve constraints, appending newly-indexed dimensions to the domain.
    let indexed = concat_to_layout.dependency_mask();
    let mut new_domain: Vec<ValueAccess> = buffer.domain().to_vec();
    for dimension in indexed.iter_ones() {
        let mut dim_access = if dimension < shift {
            op_loop_nest.domain[dimension].clone()
        } else {
            let d = dimension - shift;
            let dependency = op.shape.dims[d]
                .dependency_mapping
                .clone()
                .resize_use_domain(op.domain.len());
            ValueAccess {
                value: op.domain[d],
                mapping: op_space.mapping().inverse().compose(&dependency),
            }
        };
        // The dimension may only depend on loops in the buffer loop nest.
        dim_access.mapping = dim_access.mapping.resize_use_domain(buffer.loop_nest().len());
        resolve_unification_constraint(
            op.span,
            name,
            buffer.span(),
            dim_access,
            &mut constraints[dimension],
            &mut new_domain,
        )?;
    }
    let existing = buffer.domain().len();
    buffer.append_to_domain(new_domain.drain(existing..));

    let renaming = Mapping::new(buffer.domain().len(), constraints);
    if buffer.unify_layout(renaming.compose(&concat_to_layout)).is_err() {
        return Err(StorageError::IncompatibleLayout {
            name: name.clone(),
            span: op.span,
            previous: buffer.span(),
        }
        .into());
    }
    Ok(())
}

/// Resolves one unification constraint: either allocates a new buffer domain
/// dimension or checks the constraint against the dimension it is pinned to.
fn resolve_unification_constraint(
    span: SourceSpan,
    name: &SmallStr,
    buffer_span: SourceSpan,
    dim_access: ValueAccess,
    constraint: &mut MappingExpr,
    domain: &mut Vec<ValueAccess>,
) -> Result<(), Report> {
    let mismatch = || StorageError::DimensionMismatch {
        name: name.clone(),
        span,
        previous: buffer_span,
    };
    match constraint {
        MappingExpr::None => {
            *constraint = MappingExpr::Dim(domain.len());
            domain.push(dim_access);
            Ok(())
        }
        MappingExpr::Dim(d) => {
            let existing = &mut domain[*d];
            if existing.value != dim_access.value {
                return Err(mismatch().into());
            }
            existing.mapping =
                existing.mapping.unify(&dim_access.mapping).ok_or_else(|| mismatch())?;
            Ok(())
        }
        _ => Err(mismatch().into()),
    }
}

/// The loop-nest part of a buffer instance layout: one expression per loop,
/// over the loop-nest domain.
struct StripePrefix<'a> {
    exprs: &'a [MappingExpr],
    domain: &'a [ValueAccess],
}

/// Structural equality of stripe expressions across domains: dimensions match
/// when they access the same underlying value. Layout expressions index the
/// buffer domain while loop-nest expressions index the nest domain, and
/// unification keeps those as separate entries for the same dimension.
fn same_stripe_source(
    a: &MappingExpr,
    a_domain: &[ValueAccess],
    b: &MappingExpr,
    b_domain: &[ValueAccess],
) -> bool {
    match (a, b) {
        (MappingExpr::Dim(i), MappingExpr::Dim(j)) => {
            a_domain.get(*i).map(|access| access.value)
                == b_domain.get(*j).map(|access| access.value)
        }
        (
            MappingExpr::Stripe { operand: a_op, factors: a_factors },
            MappingExpr::Stripe { operand: b_op, factors: b_factors },
        ) => a_factors == b_factors && same_stripe_source(a_op, a_domain, b_op, b_domain),
        (
            MappingExpr::UnStripe { operands: a_ops, factors: a_factors },
            MappingExpr::UnStripe { operands: b_ops, factors: b_factors },
        ) => {
            a_factors == b_factors
                && a_ops.len() == b_ops.len()
                && a_ops
                    .iter()
                    .zip(b_ops)
                    .all(|(a, b)| same_stripe_source(a, a_domain, b, b_domain))
        }
        (MappingExpr::None, MappingExpr::None)
        | (MappingExpr::Unknown, MappingExpr::Unknown) => true,
        _ => false,
    }
}

/// Minimum number of loop-nest loops required so that every inner stripe
/// level in `expr` (over `domain`, the buffer domain) stays nested inside its
/// outer levels. Fails when an outer level is not a loop-nest loop: the inner
/// level's extent would then depend on a dimension that does not exist when
/// the buffer is allocated.
fn stripe_level_min_loops(
    expr: &MappingExpr,
    domain: &[ValueAccess],
    prefix: &StripePrefix<'_>,
) -> Result<usize, ()> {
    match expr {
        MappingExpr::Dim(_) | MappingExpr::None | MappingExpr::Unknown => Ok(0),
        MappingExpr::Stripe { operand, factors } => {
            let mut min = stripe_level_min_loops(operand, domain, prefix)?;
            for level in 1..factors.len() {
                let outer = MappingExpr::Stripe {
                    operand: operand.clone(),
                    factors: factors[..level].iter().copied().collect(),
                };
                let pos = prefix
                    .exprs
                    .iter()
                    .position(|e| same_stripe_source(&outer, domain, e, prefix.domain))
                    .ok_or(())?;
                min = min.max(pos + 1);
            }
            Ok(min)
        }
        MappingExpr::UnStripe { operands, .. } => {
            let mut min = 0;
            for operand in operands {
                min = min.max(stripe_level_min_loops(operand, domain, prefix)?);
            }
            Ok(min)
        }
    }
}

/// Raises `min_num_loops` until an allocation for `buffer` can be inserted
/// before its first write, and fails if a buffer dimension is defined too
/// late for that.
fn check_alloc_insertion_point(
    program: &Program,
    spaces: &IterationSpaceAnalysis,
    name: &SmallStr,
    buffer: &Buffer,
    used_dimensions: &BitVec,
    min_num_loops: &mut usize,
) -> Result<(), Report> {
    let Some(first_write) = buffer.writes().iter().map(|&(op, _)| op).min() else {
        return Ok(());
    };
    let write_loops = spaces.get(first_write).loop_names();
    for dim in used_dimensions.iter_ones() {
        let dim_op = program.producer(buffer.domain()[dim].value);
        if first_write < dim_op {
            return Err(StorageError::UseBeforeDimensionDef {
                name: name.clone(),
                span: program.op(first_write).span,
                dimension: program.op(dim_op).span,
            }
            .into());
        }

        for operand in &program.op(dim_op).operands {
            let operand_loops = spaces.get(program.producer(operand.value)).loop_names();
            let mut new_min = write_loops.len().min(operand_loops.len());
            while new_min > 0 && operand_loops[new_min - 1] != write_loops[new_min - 1] {
                new_min -= 1;
            }
            if new_min > buffer.loop_nest().len() {
                return Err(StorageError::LoopNestTooShort {
                    name: name.clone(),
                    span: program.op(first_write).span,
                    dimension: program.op(dim_op).span,
                }
                .into());
            }
            *min_num_loops = (*min_num_loops).max(new_min);
        }
    }
    Ok(())
}

/// Maps the part of a value's domain that must survive between its definition
/// and a use: the sub-domain not covered by loops common to both iteration
/// spaces.
pub fn communication_volume(
    value_rank: usize,
    def_space: &IterationSpace,
    use_space: &IterationSpace,
) -> Mapping {
    let num_common = def_space.num_common_loops(use_space.loop_names());
    let domain_to_common = def_space
        .mapping()
        .clone()
        .resize_use_domain(value_rank)
        .resize(num_common);
    // Extend to cover the full operand domain, then drop the common loops:
    // what remains must come from storage.
    domain_to_common
        .inverse()
        .make_surjective()
        .inverse()
        .drop_front(num_common)
}

fn verify_communication_volume_for(
    program: &Program,
    spaces: &IterationSpaceAnalysis,
    analysis: &StorageAnalysis,
    use_span: SourceSpan,
    use_space: &IterationSpace,
    operand: &ValueAccess,
) -> Result<(), Report> {
    let def_op = program.producer(operand.value);
    let def_space = spaces.get(def_op);
    if !use_space.fully_specified() || !def_space.fully_specified() {
        return Ok(());
    }
    let storage = analysis.storage(operand.value);
    let Some(layout) = storage.layout() else { return Ok(()) };

    let value_rank = program.value(operand.value).ty.rank;
    let volume = communication_volume(value_rank, def_space, use_space);
    let layout_to_operand = def_space
        .mapping()
        .compose(layout)
        .inverse()
        .resize(value_rank);
    let layout_to_volume = layout_to_operand.compose(&volume).canonicalize();

    if layout_to_volume.has_none() {
        return Err(StorageError::IncompleteCrossIterationStorage {
            span: use_span,
            defined: program.op(def_op).span,
        }
        .into());
    }
    Ok(())
}

fn verify_communication_volume(
    program: &Program,
    spaces: &IterationSpaceAnalysis,
    analysis: &StorageAnalysis,
) -> Result<(), Report> {
    for (id, op) in program.ops() {
        let space = spaces.get(id);
        for operand in &op.operands {
            verify_communication_volume_for(program, spaces, analysis, op.span, space, operand)?;
        }
        // Dimension definitions are consumed at every iteration of the using
        // operation; their own operands must be reachable too.
        for (i, &dim) in op.domain.iter().enumerate() {
            let dim_op = program.producer(dim);
            let dependency = op.shape.dims[i]
                .dependency_mapping
                .clone()
                .resize_use_domain(op.domain.len());
            for operand in &program.op(dim_op).operands {
                let access = ValueAccess {
                    value: operand.value,
                    mapping: dependency.compose(&operand.mapping),
                };
                verify_communication_volume_for(
                    program, spaces, analysis, op.span, space, &access,
                )?;
            }
        }
    }
    Ok(())
}

fn verify_in_place_updates(
    program: &Program,
    spaces: &IterationSpaceAnalysis,
    analysis: &StorageAnalysis,
) -> Result<(), Report> {
    for (id, op) in program.ops() {
        if !op.kind.is_compute() {
            continue;
        }
        for &result in &op.results {
            let result_storage = analysis.storage(result);
            let Some(name) = result_storage.buffer_name() else { continue };
            for operand in &op.operands {
                let operand_storage = analysis.storage(operand.value);
                if operand_storage.buffer_name() != Some(name) {
                    continue;
                }
                let mapped = operand_storage.map(
                    program,
                    spaces,
                    program.producer(operand.value),
                    id,
                    &operand.mapping,
                );
                if mapped.layout() != result_storage.layout() {
                    let display =
                        |l: Option<&Mapping>| l.map(ToString::to_string).unwrap_or_default();
                    return Err(StorageError::InPlaceLayoutConflict {
                        name: name.clone(),
                        expected: display(result_storage.layout()),
                        got: display(mapped.layout()),
                        span: op.span,
                    }
                    .into());
                }
            }
        }
    }
    Ok(())
}

/// Full storage verification: analysis construction plus in-place layout and
/// communication-volume checks.
pub fn verify_storage(
    program: &Program,
    fusion: &LoopFusionAnalysis,
    spaces: &IterationSpaceAnalysis,
    policy: &dyn PassThroughPolicy,
) -> Result<StorageAnalysis, Report> {
    let analysis = StorageAnalysis::create(program, fusion, spaces, policy)?;
    verify_in_place_updates(program, spaces, &analysis)?;
    verify_communication_volume(program, spaces, &analysis)?;
    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use weavec_ir::smallvec;

    use super::*;

    #[test]
    fn inner_stripe_levels_need_their_outer_levels_in_the_nest() {
        // The buffer domain holds two entries for the same dimension: the
        // nest-domain copy and the one appended by shape unification.
        let d = Value::from_u32(0);
        let domain = [
            ValueAccess::new(d, Mapping::empty(1)),
            ValueAccess::new(d, Mapping::empty(1)),
        ];
        let nest_exprs = [MappingExpr::Stripe {
            operand: Box::new(MappingExpr::Dim(0)),
            factors: smallvec![4],
        }];
        let block = MappingExpr::Stripe {
            operand: Box::new(MappingExpr::Dim(1)),
            factors: smallvec![4],
        };
        let point = MappingExpr::Stripe {
            operand: Box::new(MappingExpr::Dim(1)),
            factors: smallvec![4, 1],
        };

        let prefix = StripePrefix { exprs: &nest_exprs, domain: &domain[..1] };
        assert_eq!(stripe_level_min_loops(&point, &domain, &prefix), Ok(1));
        assert_eq!(stripe_level_min_loops(&block, &domain, &prefix), Ok(0));

        // Without the block loop the point extent has nothing to nest in.
        let trimmed = StripePrefix { exprs: &[], domain: &[] };
        assert_eq!(stripe_level_min_loops(&block, &domain, &trimmed), Ok(0));
        assert_eq!(stripe_level_min_loops(&point, &domain, &trimmed), Err(()));
    }

    #[test]
    fn merge_space_is_idempotent_and_conflict_checked() {
        let mut storage = ValueStorage::default();
        storage.merge_space(Some(MemorySpace::Memory)).expect("first merge");
        storage.merge_space(Some(MemorySpace::Memory)).expect("same space");
        storage.merge_space(None).expect("nothing to merge");
        assert!(storage.merge_space(Some(MemorySpace::Register)).is_err());
        assert_eq!(storage.space(), Some(MemorySpace::Memory));
    }

    #[test]
    fn merge_layout_resolves_unknowns_only() {
        let mut storage = ValueStorage::default();
        storage
            .merge_layout(Some(&Mapping::new(2, [MappingExpr::Unknown, MappingExpr::Dim(1)])))
            .expect("first layout");
        storage
            .merge_layout(Some(&Mapping::new(
                2,
                [MappingExpr::Dim(0), MappingExpr::Dim(1)],
            )))
            .expect("refines the unknown");
        assert_eq!(
            storage.layout(),
            Some(&Mapping::new(2, [MappingExpr::Dim(0), MappingExpr::Dim(1)]))
        );
        // `none` does not unify with a concrete expression here.
        assert!(storage
            .merge_layout(Some(&Mapping::new(
                2,
                [MappingExpr::None, MappingExpr::Dim(1)]
            )))
            .is_err());
    }

    #[test]
    fn add_unknown_prefix_extends_layout() {
        let mut storage =
            ValueStorage::new(None, None, Some(Mapping::new(1, [MappingExpr::Dim(0)])));
        storage.add_unknown_prefix_to_layout(2);
        assert_eq!(
            storage.layout(),
            Some(&Mapping::new(
                1,
                [MappingExpr::Unknown, MappingExpr::Unknown, MappingExpr::Dim(0)]
            ))
        );
    }
}
