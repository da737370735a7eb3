//! Multi-dimensional storage shared by values.

use bitvec::prelude::*;
use smallvec::SmallVec;
use weavec_ir::{
    Mapping, MappingExpr, Op, Program, ScalarType, SmallStr, SourceSpan, Value, ValueAccess,
};

use crate::loop_nest::LoopNest;

/// A buffer: its element type, the loops its allocation is nested in, the
/// iteration dimensions its size is derived from, and how those dimensions
/// map to buffer dimensions.
#[derive(Clone, Debug, PartialEq)]
pub struct Buffer {
    name: SmallStr,
    span: SourceSpan,
    element_type: ScalarType,
    /// The external memory operation this buffer wraps, if any.
    import_op: Option<Op>,
    /// Names of the loops the buffer allocation is nested in, outermost
    /// first. Only ever shrinks after construction.
    loop_nest: SmallVec<[SmallStr; 4]>,
    /// Dimensions the buffer shape depends on. The first dimensions are the
    /// loop-nest domain; unification appends further dimensions indexed by
    /// layouts. Access mappings are expressed over the loop nest.
    domain: SmallVec<[ValueAccess; 4]>,
    /// From `domain` to buffer dimensions. `None` until a layout for the
    /// buffer is seen; its arity is the buffer rank.
    layout: Option<Mapping>,
    /// Compute operations writing into the buffer, as (op, result) pairs.
    writes: SmallVec<[(Op, usize); 2]>,
    /// Compute operations reading from the buffer, as (op, operand) pairs.
    reads: SmallVec<[(Op, usize); 2]>,
    /// Values stored in the buffer.
    values: SmallVec<[Value; 2]>,
}

impl Buffer {
    pub(crate) fn new(
        name: SmallStr,
        span: SourceSpan,
        element_type: ScalarType,
        loop_names: &[SmallStr],
        loop_nest: &LoopNest,
    ) -> Self {
        let num_loops = loop_names.len();
        Self {
            name,
            span,
            element_type,
            import_op: None,
            loop_nest: loop_names.iter().cloned().collect(),
            domain: loop_nest
                .domain
                .iter()
                .map(|access| ValueAccess {
                    value: access.value,
                    mapping: access.mapping.clone().resize_use_domain(num_loops),
                })
                .collect(),
            layout: None,
            writes: SmallVec::new(),
            reads: SmallVec::new(),
            values: SmallVec::new(),
        }
    }

    pub(crate) fn new_external(
        name: SmallStr,
        import_op: Op,
        span: SourceSpan,
        element_type: ScalarType,
        loop_names: &[SmallStr],
        loop_nest: &LoopNest,
    ) -> Self {
        Self {
            import_op: Some(import_op),
            ..Self::new(name, span, element_type, loop_names, loop_nest)
        }
    }

    pub fn name(&self) -> &SmallStr {
        &self.name
    }

    pub fn span(&self) -> SourceSpan {
        self.span
    }

    pub fn element_type(&self) -> &ScalarType {
        &self.element_type
    }

    pub fn is_external(&self) -> bool {
        self.import_op.is_some()
    }

    pub fn import_op(&self) -> Option<Op> {
        self.import_op
    }

    pub fn loop_nest(&self) -> &[SmallStr] {
        &self.loop_nest
    }

    pub fn domain(&self) -> &[ValueAccess] {
        &self.domain
    }

    pub fn layout(&self) -> Option<&Mapping> {
        self.layout.as_ref()
    }

    /// Number of buffer dimensions, once a layout fixed it.
    pub fn rank(&self) -> Option<usize> {
        self.layout.as_ref().map(Mapping::len)
    }

    pub fn writes(&self) -> &[(Op, usize)] {
        &self.writes
    }

    pub fn reads(&self) -> &[(Op, usize)] {
        &self.reads
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// The layout extended with the loop-nest dimensions as a prefix, giving
    /// the full index space of one buffer instance.
    pub fn instance_layout(&self, loop_nest: &LoopNest) -> Option<Mapping> {
        self.layout
            .as_ref()
            .map(|layout| layout.add_prefix(loop_nest.domain_to_loops.exprs().iter().cloned()))
    }

    /// Merges a layout over the current domain into the buffer's layout.
    /// Fails if the layouts assign structurally different expressions to a
    /// buffer dimension.
    pub(crate) fn unify_layout(&mut self, layout: Mapping) -> Result<(), ()> {
        match self.layout.take() {
            Some(old) => {
                self.layout = Some(old.unify(&layout).ok_or(())?);
            }
            None => self.layout = Some(layout),
        }
        Ok(())
    }

    pub(crate) fn append_to_domain(&mut self, dims: impl IntoIterator<Item = ValueAccess>) {
        self.domain.extend(dims);
        if let Some(layout) = self.layout.take() {
            self.layout = Some(layout.resize_use_domain(self.domain.len()));
        }
    }

    /// Prepends `n` new, not-yet-mapped buffer dimensions to the layout.
    pub(crate) fn add_none_prefix_to_layout(&mut self, n: usize) {
        if let Some(layout) = self.layout.take() {
            self.layout =
                Some(layout.add_prefix(core::iter::repeat_n(MappingExpr::None, n)));
        }
    }

    /// Shrinks the loop nest to `loop_nest` and compacts the domain to the
    /// dimensions still reachable: the new loop-nest domain plus whatever the
    /// layout depends on. The layout is renamed onto the compacted domain.
    pub(crate) fn set_loop_nest(&mut self, loop_nest: &LoopNest) {
        let num_loops = loop_nest.num_loops();
        debug_assert!(num_loops <= self.loop_nest.len());
        if num_loops == self.loop_nest.len() {
            return;
        }
        self.loop_nest.truncate(num_loops);
        if self.domain.is_empty() {
            return;
        }

        let mut preserved = bitvec![0; self.domain.len()];
        for i in 0..loop_nest.domain.len() {
            preserved.set(i, true);
        }
        if let Some(layout) = &self.layout {
            for dim in layout.dependency_mask().iter_ones() {
                preserved.set(dim, true);
            }
        }

        let old_domain = core::mem::take(&mut self.domain);
        let mut renaming = vec![MappingExpr::None; old_domain.len()];
        for dim in preserved.iter_ones() {
            renaming[dim] = MappingExpr::Dim(self.domain.len());
            self.domain.push(ValueAccess {
                value: old_domain[dim].value,
                mapping: old_domain[dim].mapping.clone().resize_use_domain(num_loops),
            });
        }
        if let Some(layout) = self.layout.take() {
            let renaming = Mapping::new(self.domain.len(), renaming);
            self.layout = Some(renaming.compose(&layout));
        }
    }

    /// Registers a value as stored in the buffer, recording compute writes
    /// and reads.
    pub(crate) fn add_value(&mut self, program: &Program, value: Value) {
        self.values.push(value);
        let def = program.value(value);
        if program.op(def.producer).kind.is_compute() {
            self.writes.push((def.producer, def.index));
        }
        for &(user, pos) in program.users(value) {
            if program.op(user).kind.is_compute() {
                self.reads.push((user, pos));
            }
        }
    }
}
